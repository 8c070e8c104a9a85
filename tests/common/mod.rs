//! Shared test bench: a scripted network interface, a manual clock, and an
//! in-memory persistent store around a commissioned stack instance.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use lon_stack::drivers::link::frame::L2Frame;
use lon_stack::drivers::link::{LinkError, LinkPort};
use lon_stack::net::npdu::ProtocolVersion;
use lon_stack::node::persist::{PersistError, PersistentStore, SegmentType};
use lon_stack::node::{AuthType, DomainEntry, NodeState};
use lon_stack::time::Clock;
use lon_stack::{Stack, StackConfig};

pub const TEST_DOMAIN: u8 = 0x51;
pub const OUR_SUBNET: u8 = 2;
pub const OUR_NODE: u8 = 3;
pub const TEST_KEY: [u8; 6] = [1, 2, 3, 4, 5, 6];

#[derive(Clone)]
pub struct ManualClock(Rc<Cell<u32>>);

impl ManualClock {
	pub fn new() -> Self {
		Self(Rc::new(Cell::new(0)))
	}

	pub fn advance(&self, ms: u32) {
		self.0.set(self.0.get().wrapping_add(ms));
	}
}

impl Clock for ManualClock {
	fn now_ms(&self) -> u32 {
		self.0.get()
	}
}

struct PortInner {
	rx: VecDeque<L2Frame>,
	tx: Vec<L2Frame>,
	power_line: bool,
}

/// Handle the test keeps; the stack owns the `ScriptedPort` twin.
#[derive(Clone)]
pub struct PortHandle(Rc<RefCell<PortInner>>);

pub struct ScriptedPort(Rc<RefCell<PortInner>>);

pub fn scripted_port(power_line: bool) -> (ScriptedPort, PortHandle) {
	let inner = Rc::new(RefCell::new(PortInner {
		rx: VecDeque::new(),
		tx: Vec::new(),
		power_line,
	}));
	(ScriptedPort(inner.clone()), PortHandle(inner))
}

impl LinkPort for ScriptedPort {
	fn name(&self) -> &str {
		"LON1"
	}

	fn is_power_line(&self) -> bool {
		self.0.borrow().power_line
	}

	fn read_frame(&mut self) -> Result<Option<L2Frame>, LinkError> {
		Ok(self.0.borrow_mut().rx.pop_front())
	}

	fn write_frame(&mut self, frame: &L2Frame) -> Result<(), LinkError> {
		self.0.borrow_mut().tx.push(frame.clone());
		Ok(())
	}
}

impl PortHandle {
	pub fn push(&self, frame: L2Frame) {
		self.0.borrow_mut().rx.push_back(frame);
	}

	pub fn take_writes(&self) -> Vec<L2Frame> {
		std::mem::take(&mut self.0.borrow_mut().tx)
	}

	/// Drains captured writes, keeping only outgoing LPDUs as
	/// `(link_header, npdu)` pairs.
	pub fn take_lpdus(&self) -> Vec<(u8, Vec<u8>)> {
		self.take_writes()
			.into_iter()
			.filter(|frame| frame.cmd == 0x12)
			.map(|frame| (frame.pdu[0], frame.pdu[1..].to_vec()))
			.collect()
	}
}

#[derive(Default)]
pub struct MemStore {
	segments: BTreeMap<u8, Vec<u8>>,
}

impl PersistentStore for MemStore {
	fn read_segment(&mut self, segment: SegmentType) -> Option<Vec<u8>> {
		let key = matches!(segment, SegmentType::ApplicationData) as u8;
		self.segments.get(&key).cloned()
	}

	fn write_segment(&mut self, segment: SegmentType, data: &[u8]) -> Result<(), PersistError> {
		let key = matches!(segment, SegmentType::ApplicationData) as u8;
		self.segments.insert(key, data.to_vec());
		Ok(())
	}
}

pub struct Bench {
	pub stack: Stack,
	pub clock: ManualClock,
	pub port: PortHandle,
}

/// A commissioned single-port stack: domain 0 configured, online, past the
/// post-reset quiet period, with all startup writes drained.
pub fn bench() -> Bench {
	bench_with(false)
}

pub fn bench_with(power_line: bool) -> Bench {
	let clock = ManualClock::new();
	let (port, handle) = scripted_port(power_line);
	let config = StackConfig {
		program_id: [0x9F, 1, 2, 3, 4, 5, 6, 7],
		signature: 0x4C4F_4E31,
		protocol_version: ProtocolVersion::Legacy,
		entropy_seed: [7; 32],
	};
	let ports: Vec<Box<dyn LinkPort>> = vec![Box::new(port)];
	let mut stack = Stack::new(
		config,
		ports,
		Box::new(MemStore::default()),
		Box::new(clock.clone()),
	);

	let node = stack.node_mut();
	node.read_only.unique_id = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5];
	node.read_only.node_state = NodeState::ConfigOnline;
	node.domain_table[0] = DomainEntry {
		id: [TEST_DOMAIN, 0, 0, 0, 0, 0],
		len: 1,
		subnet: OUR_SUBNET,
		node: OUR_NODE,
		clone: false,
		invalid: false,
		auth_type: AuthType::Standard,
		key: TEST_KEY,
	};
	stack.commit_config();

	// Step past the post-reset send quiet period.
	clock.advance(2500);
	stack.service();
	handle.take_writes();

	Bench {
		stack,
		clock,
		port: handle,
	}
}

/// Hand-built NPDU framing, independent of the stack's own codec.
pub mod wire {
	use super::*;

	pub enum Dest {
		Broadcast { subnet: u8 },
		Multicast { group: u8 },
		SubnetNode { subnet: u8, node: u8 },
		MulticastAck { subnet: u8, node: u8, group: u8, member: u8 },
		UniqueId { subnet: u8, id: [u8; 6] },
	}

	pub fn npdu(pdu_type: u8, src: (u8, u8), dest: Dest, domain: &[u8], payload: &[u8]) -> Vec<u8> {
		let (format, sel) = match dest {
			Dest::Broadcast { .. } => (0, 1),
			Dest::Multicast { .. } => (1, 1),
			Dest::SubnetNode { .. } => (2, 1),
			Dest::MulticastAck { .. } => (2, 0),
			Dest::UniqueId { .. } => (3, 1),
		};
		let domain_code: u8 = match domain.len() {
			0 => 0,
			1 => 1,
			3 => 2,
			6 => 3,
			other => panic!("bad domain length {other}"),
		};
		let mut out = vec![
			pdu_type << 4 | format << 2 | domain_code,
			src.0,
			sel << 7 | src.1,
		];
		match dest {
			Dest::Broadcast { subnet } => out.push(subnet),
			Dest::Multicast { group } => out.push(group),
			Dest::SubnetNode { subnet, node } => {
				out.push(subnet);
				out.push(0x80 | node);
			}
			Dest::MulticastAck {
				subnet,
				node,
				group,
				member,
			} => {
				out.push(subnet);
				out.push(0x80 | node);
				out.push(group);
				out.push(member);
			}
			Dest::UniqueId { subnet, id } => {
				out.push(subnet);
				out.extend_from_slice(&id);
			}
		}
		out.extend_from_slice(domain);
		out.extend_from_slice(payload);
		out
	}

	/// Wraps an NPDU in a mode-2 uplink control block the way the USB
	/// interface delivers it: tag byte, link header, NPDU, then the CRC
	/// and register bytes the driver strips.
	pub fn uplink(priority: bool, npdu: &[u8]) -> L2Frame {
		let mut pdu = vec![0x22, if priority { 0x80 } else { 0x00 }];
		pdu.extend_from_slice(npdu);
		pdu.extend_from_slice(&[0xC1, 0xC2, 0xE1, 0xE2]);
		L2Frame::new(0x1C, pdu)
	}
}
