//! Persistent segments.
//!
//! The stack owns two opaque byte segments: `NetworkImage` (node
//! configuration and error log) and `ApplicationData` (host-owned).  A
//! write-in-progress flag leads each image so a write torn by power loss is
//! detected and the image discarded on the next open.

use alloc::vec::Vec;

use thiserror::Error;

use crate::config::{NUM_ADDR_TBL_ENTRIES, NUM_DOMAINS};
use crate::node::{NodeConfig, NodeState, ResetCause};
use crate::stats::SystemError;

/// Persistent segment identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentType {
	NetworkImage,
	ApplicationData,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PersistError {
	#[error("persistent write failed")]
	WriteFailed,
}

/// Host-provided storage for persistent segments.  Each segment is an
/// opaque byte array; interpretation belongs to its producer.
pub trait PersistentStore {
	fn read_segment(&mut self, segment: SegmentType) -> Option<Vec<u8>>;
	fn write_segment(&mut self, segment: SegmentType, data: &[u8]) -> Result<(), PersistError>;
}

const FLAG_COMMITTED: u8 = 0;
const FLAG_IN_PROGRESS: u8 = 1;

/// Compiled table dimensions recorded at the head of `NetworkImage`.  A
/// mismatch against the stored copy discards the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
	pub n_domains: u8,
	pub addr_capacity: u8,
	pub dp_capacity: u8,
	pub alias_capacity: u8,
}

impl Dimensions {
	pub fn compiled() -> Self {
		Self {
			n_domains: NUM_DOMAINS as u8,
			addr_capacity: NUM_ADDR_TBL_ENTRIES.min(255) as u8,
			dp_capacity: 0,
			alias_capacity: 0,
		}
	}
}

/// Writes the network image.  The store sees two writes: the image flagged
/// in-progress, then the committed rewrite.  Power loss between the two
/// leaves the flag set and the image is discarded on re-open.
pub fn write_network_image(
	store: &mut dyn PersistentStore,
	node: &NodeConfig,
	signature: u32,
	reset_cause: ResetCause,
) -> Result<(), PersistError> {
	let dims = Dimensions::compiled();
	let payload = node.mutable_image();
	let mut image = Vec::with_capacity(12 + payload.len());
	image.push(FLAG_IN_PROGRESS);
	image.extend_from_slice(&signature.to_be_bytes());
	image.extend_from_slice(&[
		dims.n_domains,
		dims.addr_capacity,
		dims.dp_capacity,
		dims.alias_capacity,
	]);
	image.push(u8::from(node.read_only.node_state));
	image.push(u8::from(node.error_log));
	image.push(u8::from(reset_cause));
	image.extend_from_slice(&payload);
	store.write_segment(SegmentType::NetworkImage, &image)?;
	image[0] = FLAG_COMMITTED;
	store.write_segment(SegmentType::NetworkImage, &image)
}

/// Loads the network image into `node`.  Returns the persisted reset cause,
/// or `None` when there is no usable image (missing, torn, foreign
/// signature, or changed dimensions) and the caller must fall back to
/// factory defaults.
pub fn load_network_image(
	store: &mut dyn PersistentStore,
	node: &mut NodeConfig,
	signature: u32,
) -> Option<ResetCause> {
	let image = store.read_segment(SegmentType::NetworkImage)?;
	let (header, payload) = image.split_at_checked(12)?;
	if header[0] != FLAG_COMMITTED {
		log::warn!("network image write was torn; discarding");
		return None;
	}
	if u32::from_be_bytes(header[1..5].try_into().unwrap()) != signature {
		log::info!("network image signature changed; discarding");
		return None;
	}
	let dims = Dimensions::compiled();
	if header[5..9] != [
		dims.n_domains,
		dims.addr_capacity,
		dims.dp_capacity,
		dims.alias_capacity,
	] {
		log::info!("network image dimensions changed; discarding");
		return None;
	}
	let state = NodeState::try_from(header[9]).ok()?;
	let error_log = SystemError::try_from(header[10]).unwrap_or(SystemError::NoError);
	let cause = ResetCause::try_from(header[11]).unwrap_or(ResetCause::Cleared);
	if !node.restore_mutable(payload) {
		return None;
	}
	node.read_only.node_state = state;
	node.error_log = error_log;
	Some(cause)
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloc::collections::BTreeMap;

	#[derive(Default)]
	pub struct MemStore {
		segments: BTreeMap<u8, Vec<u8>>,
		pub writes: usize,
	}

	fn key(segment: SegmentType) -> u8 {
		match segment {
			SegmentType::NetworkImage => 0,
			SegmentType::ApplicationData => 1,
		}
	}

	impl PersistentStore for MemStore {
		fn read_segment(&mut self, segment: SegmentType) -> Option<Vec<u8>> {
			self.segments.get(&key(segment)).cloned()
		}

		fn write_segment(
			&mut self,
			segment: SegmentType,
			data: &[u8],
		) -> Result<(), PersistError> {
			self.writes += 1;
			self.segments.insert(key(segment), data.to_vec());
			Ok(())
		}
	}

	#[test]
	fn image_round_trips() {
		let mut store = MemStore::default();
		let mut node = NodeConfig::factory([3; 8]);
		node.read_only.node_state = NodeState::ConfigOnline;
		node.domain_table[0].subnet = 42;
		node.domain_table[0].invalid = false;
		write_network_image(&mut store, &node, 0xDEAD_BEEF, ResetCause::Software).unwrap();

		let mut restored = NodeConfig::factory([3; 8]);
		let cause = load_network_image(&mut store, &mut restored, 0xDEAD_BEEF);
		assert_eq!(cause, Some(ResetCause::Software));
		assert_eq!(restored.read_only.node_state, NodeState::ConfigOnline);
		assert_eq!(restored.domain_table[0].subnet, 42);
	}

	#[test]
	fn torn_write_is_discarded() {
		let mut store = MemStore::default();
		let node = NodeConfig::factory([3; 8]);
		write_network_image(&mut store, &node, 1, ResetCause::PowerUp).unwrap();
		// Simulate power loss between the two write steps.
		store.segments.get_mut(&0).unwrap()[0] = FLAG_IN_PROGRESS;
		let mut restored = NodeConfig::factory([3; 8]);
		assert_eq!(load_network_image(&mut store, &mut restored, 1), None);
	}

	#[test]
	fn foreign_signature_is_discarded() {
		let mut store = MemStore::default();
		let node = NodeConfig::factory([3; 8]);
		write_network_image(&mut store, &node, 1, ResetCause::PowerUp).unwrap();
		let mut restored = NodeConfig::factory([3; 8]);
		assert_eq!(load_network_image(&mut store, &mut restored, 2), None);
	}
}
