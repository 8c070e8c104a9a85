//! Node identity and configuration: domain table, address table, node
//! state, dimension decode tables, and the configuration checksum.

pub mod persist;

use alloc::vec::Vec;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::config::{
	AUTH_KEY_LEN, DOMAIN_ID_LEN, NUM_ADDR_TBL_ENTRIES, NUM_COMM_PARAMS, NUM_DOMAINS,
	PROGRAM_ID_LEN, UNIQUE_ID_LEN,
};
use crate::stats::SystemError;

// Neuron dimension code tables.
static BUF_SIZE_CODES: [u16; 16] = [
	255, 20, 20, 21, 22, 24, 26, 30, 34, 42, 50, 66, 82, 114, 146, 210,
];
static BUF_CNT_CODES: [u16; 16] = [0, 1, 1, 2, 3, 5, 7, 11, 15, 23, 31, 47, 63, 95, 127, 191];
static RPT_TIMER_CODES: [u16; 16] = [
	16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072,
];
static RCV_TIMER_CODES: [u16; 16] = [
	128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096, 6144, 8192, 12_288, 16_384,
	24_576,
];

/// Decodes a buffer-size code into bytes.
pub fn decode_buffer_size(code: u8) -> u16 {
	BUF_SIZE_CODES.get(usize::from(code)).copied().unwrap_or(0)
}

/// Decodes a buffer-count code into a queue depth.
pub fn decode_buffer_cnt(code: u8) -> u16 {
	BUF_CNT_CODES.get(usize::from(code)).copied().unwrap_or(0)
}

/// Decodes a repeat-timer code into milliseconds.
pub fn decode_rpt_timer(code: u8) -> u16 {
	RPT_TIMER_CODES.get(usize::from(code)).copied().unwrap_or(0)
}

/// Decodes a receive-timer code into milliseconds.
pub fn decode_rcv_timer(code: u8) -> u16 {
	RCV_TIMER_CODES.get(usize::from(code)).copied().unwrap_or(0)
}

/// Decodes a transmit-timer code into milliseconds: 16 ms doubled every two
/// codes, with odd codes adding half a step.
pub fn decode_tx_timer(code: u8) -> u16 {
	let mut v: u32 = 16;
	v <<= code / 2;
	if code & 1 != 0 {
		v += v / 2;
	}
	v.min(u32::from(u16::MAX)) as u16
}

/// Node state byte.  Bit 2 means "configuration valid".
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NodeState {
	AppUnconfig = 2,
	NoAppUnconfig = 3,
	ConfigOnline = 4,
	HardOffline = 6,
	SoftOffline = 0x0C,
	Bypass = 0x8C,
}

const STATE_CONFIGURED_MASK: u8 = 0x04;

/// Why the node last reset; persisted for network management queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResetCause {
	Cleared = 0,
	PowerUp = 1,
	External = 2,
	Watchdog = 3,
	Software = 4,
}

/// Authentication algorithm selected per domain entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AuthType {
	Standard = 0,
	/// Open-media authentication: 12-byte key spanning both domain slots,
	/// destination address folded into the hash.
	Oma = 1,
}

/// One domain table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainEntry {
	pub id: [u8; DOMAIN_ID_LEN],
	pub len: u8,
	pub subnet: u8,
	pub node: u8,
	/// Clone domains deliberately share subnet/node with another device;
	/// loopback suppression must not apply to them.
	pub clone: bool,
	pub invalid: bool,
	pub auth_type: AuthType,
	pub key: [u8; AUTH_KEY_LEN],
}

impl DomainEntry {
	pub const fn unused() -> Self {
		Self {
			id: [0; DOMAIN_ID_LEN],
			len: 0,
			subnet: 0,
			node: 0,
			clone: false,
			invalid: true,
			auth_type: AuthType::Standard,
			key: [0; AUTH_KEY_LEN],
		}
	}

	pub fn id_bytes(&self) -> &[u8] {
		&self.id[..usize::from(self.len)]
	}

	pub fn matches_id(&self, id: &[u8]) -> bool {
		!self.invalid && self.id_bytes() == id
	}
}

/// Retry count and timer codes shared by the bound address-table variants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddressTimers {
	pub retry_count: u8,
	pub rpt_timer_code: u8,
	pub tx_timer_code: u8,
}

/// One address table entry.  The discriminant mirrors the wire `kind` byte
/// of the configuration image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressEntry {
	Unassigned,
	Group {
		domain_index: u8,
		group: u8,
		/// Group size including this node; 0 encodes an open group.
		size: u8,
		member: u8,
		rcv_timer_code: u8,
		timers: AddressTimers,
	},
	SubnetNode {
		domain_index: u8,
		subnet: u8,
		node: u8,
		timers: AddressTimers,
	},
	Broadcast {
		domain_index: u8,
		subnet: u8,
		backlog: u8,
		timers: AddressTimers,
	},
	/// Local turnaround destination; never leaves the node.
	Turnaround { timers: AddressTimers },
}

impl AddressEntry {
	fn kind(&self) -> u8 {
		match self {
			AddressEntry::Unassigned => 0,
			AddressEntry::Group { .. } => 1,
			AddressEntry::SubnetNode { .. } => 2,
			AddressEntry::Broadcast { .. } => 3,
			AddressEntry::Turnaround { .. } => 4,
		}
	}
}

/// Read-only node attributes.  Not covered by the configuration checksum
/// and never modified over the network.
#[derive(Clone, Copy, Debug)]
pub struct ReadOnlyData {
	pub unique_id: [u8; UNIQUE_ID_LEN],
	pub program_id: [u8; PROGRAM_ID_LEN],
	pub node_state: NodeState,
	pub two_domains: bool,
}

/// Mutable configuration attributes (part of the checksummed region).
#[derive(Clone, Copy, Debug)]
pub struct ConfigData {
	pub location: [u8; 6],
	pub non_group_receive_timer_code: u8,
	/// Require authentication on network-management commands.
	pub nm_auth: bool,
	pub node_priority: u8,
	pub channel_priorities: u8,
	pub comm_params: [u8; NUM_COMM_PARAMS],
}

impl Default for ConfigData {
	fn default() -> Self {
		Self {
			location: [0; 6],
			non_group_receive_timer_code: 5,
			nm_auth: false,
			node_priority: 1,
			channel_priorities: 8,
			comm_params: [0; NUM_COMM_PARAMS],
		}
	}
}

/// The persistent node image: everything network management can read or
/// write, plus the checksum guarding the mutable region.
#[derive(Clone, Debug)]
pub struct NodeConfig {
	pub read_only: ReadOnlyData,
	pub config: ConfigData,
	pub domain_table: [DomainEntry; NUM_DOMAINS],
	pub addr_table: Vec<AddressEntry>,
	pub error_log: SystemError,
	pub config_checksum: u8,
}

impl NodeConfig {
	/// Factory-default image: unconfigured, both domains invalid, address
	/// table empty.
	pub fn factory(program_id: [u8; PROGRAM_ID_LEN]) -> Self {
		Self {
			read_only: ReadOnlyData {
				unique_id: [0; UNIQUE_ID_LEN],
				program_id,
				node_state: NodeState::AppUnconfig,
				two_domains: true,
			},
			config: ConfigData::default(),
			domain_table: [DomainEntry::unused(); NUM_DOMAINS],
			addr_table: alloc::vec![AddressEntry::Unassigned; NUM_ADDR_TBL_ENTRIES],
			error_log: SystemError::NoError,
			config_checksum: 0,
		}
	}

	pub fn num_domains(&self) -> u8 {
		if self.read_only.two_domains { 2 } else { 1 }
	}

	pub fn domain(&self, index: u8) -> Option<&DomainEntry> {
		if index < self.num_domains() {
			self.domain_table.get(usize::from(index))
		} else {
			None
		}
	}

	/// True while the node's configuration is valid (online or offline).
	pub fn configured(&self) -> bool {
		u8::from(self.read_only.node_state) & STATE_CONFIGURED_MASK != 0
	}

	/// True unless the node is configured *and* online.  Not the negation
	/// of [`configured`](Self::configured): offline states are configured
	/// but still count as unconfigured for send admission.
	pub fn unconfigured(&self) -> bool {
		self.read_only.node_state != NodeState::ConfigOnline
	}

	/// Membership lookup: the member number of this node in `group` on
	/// `domain_index`, if any address-table entry says so.
	pub fn group_member(&self, domain_index: u8, group: u8) -> Option<u8> {
		self.addr_table.iter().find_map(|entry| match *entry {
			AddressEntry::Group {
				domain_index: d,
				group: g,
				member,
				..
			} if d == domain_index && g == group => Some(member),
			_ => None,
		})
	}

	/// The receive-timer value for a group message: the maximum over all
	/// matching group entries (0 when this node has none).
	pub fn group_receive_timer_ms(&self, group: u8) -> u16 {
		self.addr_table
			.iter()
			.filter_map(|entry| match *entry {
				AddressEntry::Group {
					group: g,
					rcv_timer_code,
					..
				} if g == group => Some(decode_rcv_timer(rcv_timer_code)),
				_ => None,
			})
			.max()
			.unwrap_or(0)
	}

	pub fn non_group_receive_timer_ms(&self) -> u16 {
		decode_rcv_timer(self.config.non_group_receive_timer_code)
	}

	/// Serializes the mutable configuration region.  This byte stream is
	/// both the checksummed region and the payload of the `NetworkImage`
	/// persistent segment, so the two can never disagree about coverage.
	pub fn mutable_image(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(32 + 16 * NUM_DOMAINS + 9 * self.addr_table.len());
		out.extend_from_slice(&self.config.location);
		out.push(self.config.non_group_receive_timer_code);
		out.push(u8::from(self.config.nm_auth));
		out.push(self.config.node_priority);
		out.push(self.config.channel_priorities);
		out.extend_from_slice(&self.config.comm_params);
		for entry in &self.domain_table {
			out.extend_from_slice(&entry.id);
			out.push(entry.len);
			out.push(entry.subnet);
			out.push(u8::from(entry.clone) << 7 | (entry.node & 0x7F));
			out.push(u8::from(entry.invalid) << 7 | u8::from(entry.auth_type) << 3);
			out.extend_from_slice(&entry.key);
		}
		for entry in &self.addr_table {
			let mut rec = [0u8; 9];
			rec[0] = entry.kind();
			match *entry {
				AddressEntry::Unassigned => {}
				AddressEntry::Group {
					domain_index,
					group,
					size,
					member,
					rcv_timer_code,
					timers,
				} => {
					rec[1] = domain_index;
					rec[2] = group;
					rec[3] = size;
					rec[4] = member;
					rec[5] = rcv_timer_code;
					rec[6] = timers.retry_count;
					rec[7] = timers.rpt_timer_code;
					rec[8] = timers.tx_timer_code;
				}
				AddressEntry::SubnetNode {
					domain_index,
					subnet,
					node,
					timers,
				} => {
					rec[1] = domain_index;
					rec[2] = subnet;
					rec[3] = node;
					rec[6] = timers.retry_count;
					rec[7] = timers.rpt_timer_code;
					rec[8] = timers.tx_timer_code;
				}
				AddressEntry::Broadcast {
					domain_index,
					subnet,
					backlog,
					timers,
				} => {
					rec[1] = domain_index;
					rec[2] = subnet;
					rec[3] = backlog;
					rec[6] = timers.retry_count;
					rec[7] = timers.rpt_timer_code;
					rec[8] = timers.tx_timer_code;
				}
				AddressEntry::Turnaround { timers } => {
					rec[6] = timers.retry_count;
					rec[7] = timers.rpt_timer_code;
					rec[8] = timers.tx_timer_code;
				}
			}
			out.extend_from_slice(&rec);
		}
		out
	}

	/// Restores the mutable region from a serialized image.  Returns false
	/// if the image does not parse against the compiled dimensions.
	pub fn restore_mutable(&mut self, image: &[u8]) -> bool {
		let fixed = 6 + 4 + NUM_COMM_PARAMS;
		let expect = fixed + 16 * NUM_DOMAINS + 9 * self.addr_table.len();
		if image.len() != expect {
			return false;
		}
		let (cfg, rest) = image.split_at(fixed);
		self.config.location.copy_from_slice(&cfg[..6]);
		self.config.non_group_receive_timer_code = cfg[6];
		self.config.nm_auth = cfg[7] != 0;
		self.config.node_priority = cfg[8];
		self.config.channel_priorities = cfg[9];
		self.config.comm_params.copy_from_slice(&cfg[10..10 + NUM_COMM_PARAMS]);
		let (domains, addrs) = rest.split_at(16 * NUM_DOMAINS);
		for (i, chunk) in domains.chunks_exact(16).enumerate() {
			let entry = &mut self.domain_table[i];
			entry.id.copy_from_slice(&chunk[..6]);
			entry.len = chunk[6].min(DOMAIN_ID_LEN as u8);
			entry.subnet = chunk[7];
			entry.clone = chunk[8] & 0x80 != 0;
			entry.node = chunk[8] & 0x7F;
			entry.invalid = chunk[9] & 0x80 != 0;
			entry.auth_type = if chunk[9] >> 3 & 0x03 == 1 {
				AuthType::Oma
			} else {
				AuthType::Standard
			};
			entry.key.copy_from_slice(&chunk[10..16]);
		}
		for (i, rec) in addrs.chunks_exact(9).enumerate() {
			let timers = AddressTimers {
				retry_count: rec[6],
				rpt_timer_code: rec[7],
				tx_timer_code: rec[8],
			};
			self.addr_table[i] = match rec[0] {
				1 => AddressEntry::Group {
					domain_index: rec[1],
					group: rec[2],
					size: rec[3],
					member: rec[4],
					rcv_timer_code: rec[5],
					timers,
				},
				2 => AddressEntry::SubnetNode {
					domain_index: rec[1],
					subnet: rec[2],
					node: rec[3],
					timers,
				},
				3 => AddressEntry::Broadcast {
					domain_index: rec[1],
					subnet: rec[2],
					backlog: rec[3],
					timers,
				},
				4 => AddressEntry::Turnaround { timers },
				_ => AddressEntry::Unassigned,
			};
		}
		true
	}

	/// XOR checksum over exactly the mutable configuration region.
	pub fn compute_config_checksum(&self) -> u8 {
		self.mutable_image().iter().fold(0, |acc, b| acc ^ b)
	}

	/// Latches `err` into the error log.  Returns true if the log changed
	/// and needs to be persisted.
	#[must_use]
	pub fn record_error(&mut self, err: SystemError) -> bool {
		if self.error_log != err {
			log::warn!("error log: {err:?}");
			self.error_log = err;
			true
		} else {
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tx_timer_decode_law() {
		assert_eq!(decode_tx_timer(0), 16);
		assert_eq!(decode_tx_timer(1), 24);
		assert_eq!(decode_tx_timer(2), 32);
		assert_eq!(decode_tx_timer(3), 48);
		assert_eq!(decode_tx_timer(4), 64);
		assert_eq!(decode_tx_timer(15), 3072);
	}

	#[test]
	fn checksum_covers_exactly_the_mutable_region() {
		let mut node = NodeConfig::factory([0; 8]);
		let before = node.compute_config_checksum();
		// Read-only attributes are outside the covered region.
		node.read_only.unique_id = [1, 2, 3, 4, 5, 6];
		assert_eq!(node.compute_config_checksum(), before);
		// A domain table byte is inside it.
		node.domain_table[0].subnet = 9;
		assert_ne!(node.compute_config_checksum(), before);
	}

	#[test]
	fn mutable_image_round_trips() {
		let mut node = NodeConfig::factory([1; 8]);
		node.domain_table[0] = DomainEntry {
			id: [0x11, 0x22, 0x33, 0, 0, 0],
			len: 3,
			subnet: 4,
			node: 17,
			clone: false,
			invalid: false,
			auth_type: AuthType::Oma,
			key: [9; 6],
		};
		node.addr_table[0] = AddressEntry::Group {
			domain_index: 0,
			group: 5,
			size: 4,
			member: 2,
			rcv_timer_code: 3,
			timers: AddressTimers {
				retry_count: 3,
				rpt_timer_code: 1,
				tx_timer_code: 2,
			},
		};
		node.addr_table[1] = AddressEntry::Turnaround {
			timers: AddressTimers::default(),
		};
		let image = node.mutable_image();
		let mut restored = NodeConfig::factory([1; 8]);
		assert!(restored.restore_mutable(&image));
		assert_eq!(restored.domain_table, node.domain_table);
		assert_eq!(restored.addr_table, node.addr_table);
		assert_eq!(
			restored.compute_config_checksum(),
			node.compute_config_checksum()
		);
	}

	#[test]
	fn group_membership_and_timers() {
		let mut node = NodeConfig::factory([0; 8]);
		node.addr_table[3] = AddressEntry::Group {
			domain_index: 0,
			group: 7,
			size: 4,
			member: 2,
			rcv_timer_code: 1,
			timers: AddressTimers::default(),
		};
		node.addr_table[5] = AddressEntry::Group {
			domain_index: 1,
			group: 7,
			size: 4,
			member: 1,
			rcv_timer_code: 4,
			timers: AddressTimers::default(),
		};
		assert_eq!(node.group_member(0, 7), Some(2));
		assert_eq!(node.group_member(0, 8), None);
		// Max over all entries for the group, regardless of domain.
		assert_eq!(node.group_receive_timer_ms(7), 512);
	}

	#[test]
	fn error_log_written_only_on_change() {
		let mut node = NodeConfig::factory([0; 8]);
		assert!(node.record_error(SystemError::InvalidDomain));
		assert!(!node.record_error(SystemError::InvalidDomain));
		assert!(node.record_error(SystemError::UnknownPdu));
	}
}
