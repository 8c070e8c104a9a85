//! Transaction-control sublayer: transaction-ID assignment with
//! per-destination memory.
//!
//! Remembers the last TID used for each unique destination address so two
//! consecutive transactions to the same destination never share a TID.  A
//! full table evicts entries that have aged past the minimum table time;
//! younger tables refuse the transaction instead.

use alloc::vec::Vec;

use crate::config::{DOMAIN_ID_LEN, MIN_TABLE_TIME_MS, TID_TABLE_SIZE};
use crate::net::addr::{Destination, DestinationAddress, DomainIndex};
use crate::node::NodeConfig;
use crate::time::{Clock, LonTimer};

/// Address-mode-specific part of a destination key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TidKey {
	SubnetNode { subnet: u8, node: u8 },
	UniqueId([u8; 6]),
	Multicast { group: u8 },
	Broadcast { subnet: u8 },
}

impl TidKey {
	fn from_destination(dest: &Destination) -> Option<Self> {
		// A node never originates a multicast-ack addressed transaction.
		match *dest {
			Destination::Broadcast { subnet } => Some(TidKey::Broadcast { subnet }),
			Destination::Multicast { group } => Some(TidKey::Multicast { group }),
			Destination::SubnetNode { subnet, node } => {
				Some(TidKey::SubnetNode { subnet, node })
			}
			Destination::UniqueId { id, .. } => Some(TidKey::UniqueId(id)),
			Destination::MulticastAck { .. } => None,
		}
	}
}

#[derive(Clone, Copy, Debug)]
struct TidEntry {
	domain_id: [u8; DOMAIN_ID_LEN],
	domain_len: u8,
	key: TidKey,
	last_tid: u16,
	timer: LonTimer,
}

/// One transaction-ID allocator; the stack holds one per priority level.
pub(crate) struct TidAllocator {
	in_progress: bool,
	current: u16,
	next_tid: u16,
	max_tid: u16,
	table: Vec<TidEntry>,
}

impl TidAllocator {
	pub fn new(max_tid: u16) -> Self {
		Self {
			in_progress: false,
			current: 0,
			next_tid: 1,
			max_tid,
			table: Vec::with_capacity(TID_TABLE_SIZE),
		}
	}

	/// Re-initializes the allocator.  The destination table survives a
	/// software reset (the whole point of it is remembering across
	/// transactions); power-up and external resets clear it and rely on
	/// the post-reset send delay instead.
	pub fn reset(&mut self, clear_table: bool) {
		self.in_progress = false;
		self.next_tid = 1;
		if clear_table {
			self.table.clear();
		}
	}

	fn bump(&mut self) {
		self.next_tid += 1;
		if self.next_tid > self.max_tid {
			self.next_tid = 1;
		}
	}

	/// Starts a new transaction to `dest`, returning the assigned TID, or
	/// `None` when a transaction is already in flight, the destination is
	/// not representable, or the table is full of young entries.
	pub fn new_trans(
		&mut self,
		dest: &DestinationAddress,
		node: &NodeConfig,
		clock: &dyn Clock,
	) -> Option<u16> {
		if self.in_progress {
			return None;
		}
		let key = TidKey::from_destination(&dest.dest)?;

		// Resolve the domain bytes the entry is keyed under.
		let mut domain_id = [0u8; DOMAIN_ID_LEN];
		let domain_len = match dest.domain.index {
			DomainIndex::Table(index) => {
				let entry = node.domain(index)?;
				if entry.invalid {
					return None;
				}
				domain_id[..usize::from(entry.len)].copy_from_slice(entry.id_bytes());
				entry.len
			}
			DomainIndex::Flex => {
				domain_id[..usize::from(dest.domain.len)]
					.copy_from_slice(dest.domain.id_bytes());
				dest.domain.len
			}
		};

		let matched = self.table.iter().position(|entry| {
			entry.domain_len == domain_len
				&& entry.domain_id[..usize::from(domain_len)]
					== domain_id[..usize::from(domain_len)]
				&& entry.key == key
		});

		if let Some(pos) = matched {
			// This destination saw the tentative TID last time; re-select.
			if self.table[pos].last_tid == self.next_tid {
				self.bump();
			}
			let tid = self.next_tid;
			let entry = &mut self.table[pos];
			entry.last_tid = tid;
			entry.timer.set(clock, MIN_TABLE_TIME_MS);
		} else {
			if self.table.len() == TID_TABLE_SIZE {
				// Evict the first entry that has aged out; with none, the
				// transaction has to wait.
				let victim = self
					.table
					.iter_mut()
					.position(|entry| entry.timer.expired(clock))?;
				self.table.swap_remove(victim);
			}
			let mut timer = LonTimer::new();
			timer.set(clock, MIN_TABLE_TIME_MS);
			self.table.push(TidEntry {
				domain_id,
				domain_len,
				key,
				last_tid: self.next_tid,
				timer,
			});
		}

		self.current = self.next_tid;
		self.in_progress = true;
		Some(self.current)
	}

	/// Releases the in-flight slot and advances the running TID.
	pub fn trans_done(&mut self) {
		self.in_progress = false;
		self.bump();
	}

	/// True iff `tid` is the transaction currently in flight.
	pub fn validate(&self, tid: u16) -> bool {
		self.in_progress && self.current == tid
	}

	/// Forces the in-flight TID, for transactions that inherit their TID
	/// from an upstream leg.
	pub fn override_tid(&mut self, tid: u16) {
		self.next_tid = tid;
		self.current = tid;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::net::addr::Domain;
	use core::cell::Cell;

	struct TestClock(Cell<u32>);

	impl Clock for TestClock {
		fn now_ms(&self) -> u32 {
			self.0.get()
		}
	}

	fn configured_node() -> NodeConfig {
		let mut node = NodeConfig::factory([0; 8]);
		node.domain_table[0].invalid = false;
		node.domain_table[0].len = 1;
		node.domain_table[0].id = [0x51, 0, 0, 0, 0, 0];
		node
	}

	fn subnet_node(subnet: u8, node: u8) -> DestinationAddress {
		DestinationAddress {
			domain: Domain::table(0),
			dest: Destination::SubnetNode { subnet, node },
		}
	}

	#[test]
	fn consecutive_transactions_to_same_destination_differ() {
		let clock = TestClock(Cell::new(0));
		let node = configured_node();
		let mut tcs = TidAllocator::new(15);
		let dest = subnet_node(3, 17);

		let first = tcs.new_trans(&dest, &node, &clock).unwrap();
		tcs.trans_done();
		let second = tcs.new_trans(&dest, &node, &clock).unwrap();
		assert_ne!(first, second);
	}

	#[test]
	fn one_transaction_in_flight_per_allocator() {
		let clock = TestClock(Cell::new(0));
		let node = configured_node();
		let mut tcs = TidAllocator::new(15);
		let dest = subnet_node(3, 17);
		assert!(tcs.new_trans(&dest, &node, &clock).is_some());
		assert!(tcs.new_trans(&dest, &node, &clock).is_none());
		tcs.trans_done();
		assert!(tcs.new_trans(&dest, &node, &clock).is_some());
	}

	#[test]
	fn tid_wrap_skips_zero() {
		let clock = TestClock(Cell::new(0));
		let node = configured_node();
		let mut tcs = TidAllocator::new(15);
		// Use a different destination each time so the collision rule does
		// not interfere with observing the raw wrap sequence.
		let mut last = 0;
		for i in 0..40u16 {
			let dest = subnet_node((i % 20) as u8 + 1, 1);
			if let Some(tid) = tcs.new_trans(&dest, &node, &clock) {
				last = tid;
				tcs.trans_done();
			} else {
				// Table full of young entries; acceptable here.
				break;
			}
			clock.0.set(clock.0.get() + 25_000);
		}
		assert!(last <= 15);
	}

	#[test]
	fn collision_with_last_tid_reselects() {
		let clock = TestClock(Cell::new(0));
		let node = configured_node();
		let mut tcs = TidAllocator::new(15);
		let dest = subnet_node(3, 17);

		let first = tcs.new_trans(&dest, &node, &clock).unwrap();
		tcs.trans_done();
		// Walk next_tid all the way around so it collides with `first`.
		while tcs.next_tid != first {
			tcs.in_progress = false;
			tcs.bump();
		}
		let tid = tcs.new_trans(&dest, &node, &clock).unwrap();
		assert_ne!(tid, first);
	}

	#[test]
	fn full_table_refuses_until_aged() {
		let clock = TestClock(Cell::new(0));
		let node = configured_node();
		let mut tcs = TidAllocator::new(15);
		for i in 0..TID_TABLE_SIZE as u8 {
			let dest = subnet_node(1 + i, 1);
			assert!(tcs.new_trans(&dest, &node, &clock).is_some());
			tcs.trans_done();
		}
		let fresh = subnet_node(200, 1);
		assert!(tcs.new_trans(&fresh, &node, &clock).is_none());
		// Age the table past the minimum residency and retry.
		clock.0.set(MIN_TABLE_TIME_MS as u32 + 1);
		assert!(tcs.new_trans(&fresh, &node, &clock).is_some());
	}

	#[test]
	fn validate_tracks_current_transaction() {
		let clock = TestClock(Cell::new(0));
		let node = configured_node();
		let mut tcs = TidAllocator::new(15);
		let tid = tcs.new_trans(&subnet_node(3, 17), &node, &clock).unwrap();
		assert!(tcs.validate(tid));
		assert!(!tcs.validate(tid.wrapping_add(1)));
		tcs.trans_done();
		assert!(!tcs.validate(tid));
	}
}

/// The two allocator instances, one per priority level.
pub(crate) struct Tcs {
	pri: TidAllocator,
	nonpri: TidAllocator,
}

impl Tcs {
	pub fn new(max_tid: u16) -> Self {
		Self {
			pri: TidAllocator::new(max_tid),
			nonpri: TidAllocator::new(max_tid),
		}
	}

	pub fn get(&self, priority: bool) -> &TidAllocator {
		if priority { &self.pri } else { &self.nonpri }
	}

	pub fn get_mut(&mut self, priority: bool) -> &mut TidAllocator {
		if priority { &mut self.pri } else { &mut self.nonpri }
	}

	pub fn reset(&mut self, clear_tables: bool) {
		self.pri.reset(clear_tables);
		self.nonpri.reset(clear_tables);
	}
}
