//! The network layer: NPDU construction for outgoing PDUs, and address
//! filtering plus dispatch for incoming ones.

pub mod addr;
pub mod npdu;

use alloc::vec::Vec;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::collections::PacketQueue;
use crate::config::{NW_IN_BUF_SIZE_CODE, NW_IN_Q_CNT_CODE, NW_OUT_BUF_SIZE_CODE,
	NW_OUT_PRI_Q_CNT_CODE, NW_OUT_Q_CNT_CODE};
use crate::net::addr::{AddrMode, Destination, DestinationAddress, Domain, DomainIndex,
	ReceiveDest, SourceAddress};
use crate::net::npdu::{PduType, ProtocolVersion};
use crate::node::{decode_buffer_cnt, decode_buffer_size};
use crate::stack::Stack;
use crate::stats::{Stat, SystemError};
use crate::transport::{IncomingMessage, Service, TsaReceiveParam};

bitflags! {
	/// Path-selection flags carried alongside every PDU.
	#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
	pub struct AltPathFlags: u8 {
		/// Sent/received on the alternate carrier frequency.
		const ALT_PATH = 0x01;
		/// This transmission is a retry (downlink only).
		const ALT_RETRY = 0x02;
		/// Use the alternate channel when one is available.
		const ALT_CHANNEL = 0x04;
		/// Transmission is locked to the channel selected by `ALT_CHANNEL`.
		const ALT_CHANNEL_LOCK = 0x08;
	}
}

/// One outgoing PDU waiting for the network layer.
#[derive(Clone, Debug)]
pub struct NwSendParam {
	pub dest: DestinationAddress,
	pub pdu_type: PduType,
	pub version: ProtocolVersion,
	pub delta_backlog: u8,
	pub alt_path: AltPathFlags,
	/// Data packets are dropped while the node is unconfigured; acks,
	/// responses, challenges and replies are not.
	pub drop_if_unconfigured: bool,
	/// Completion tag, used only for APDU sends.
	pub tag: u16,
	pub pdu: Vec<u8>,
}

/// One incoming NPDU delivered by the link driver.
#[derive(Clone, Debug)]
pub struct NwReceiveParam {
	pub priority: bool,
	pub alt_path: AltPathFlags,
	pub npdu: Vec<u8>,
}

/// Network-layer queues and buffer dimensions.
pub(crate) struct NetLayer {
	pub in_q: PacketQueue<NwReceiveParam>,
	pub out_q: PacketQueue<NwSendParam>,
	pub out_pri_q: PacketQueue<NwSendParam>,
	pub in_buf_size: usize,
	pub out_buf_size: usize,
}

impl NetLayer {
	pub fn reset() -> Self {
		Self {
			in_q: PacketQueue::with_capacity(decode_buffer_cnt(NW_IN_Q_CNT_CODE).into()),
			out_q: PacketQueue::with_capacity(decode_buffer_cnt(NW_OUT_Q_CNT_CODE).into()),
			out_pri_q: PacketQueue::with_capacity(
				decode_buffer_cnt(NW_OUT_PRI_Q_CNT_CODE).into(),
			),
			in_buf_size: decode_buffer_size(NW_IN_BUF_SIZE_CODE).into(),
			out_buf_size: usize::from(decode_buffer_size(NW_OUT_BUF_SIZE_CODE)) + 12,
		}
	}
}

impl Stack {
	/// Network-layer send step: move one PDU (priority first) into the link
	/// queue as a framed NPDU.
	pub(crate) fn nw_send(&mut self) {
		let priority = if !self.net.out_pri_q.is_empty() && !self.link.out_pri_q.is_full() {
			true
		} else if !self.net.out_q.is_empty() && !self.link.out_q.is_full() {
			false
		} else {
			return;
		};

		// APDU sends produce a completion event either way; hold the PDU
		// until there is room to post it.
		let is_apdu = {
			let q = if priority { &self.net.out_pri_q } else { &self.net.out_q };
			q.front().is_some_and(|p| p.pdu_type == PduType::Apdu)
		};
		if is_apdu && self.app.ce_rsp_q.is_full() {
			log::debug!("nw_send: no room for completion indication");
			return;
		}

		let param = if priority {
			self.net.out_pri_q.dequeue()
		} else {
			self.net.out_q.dequeue()
		}
		.unwrap();

		// Unconfigured nodes may not originate data on their domain tables.
		if param.drop_if_unconfigured
			&& param.dest.domain.index != DomainIndex::Flex
			&& self.node.unconfigured()
		{
			self.nw_send_terminate(param);
			return;
		}

		// Resolve the source address and domain bytes.
		let mut domain_id = [0u8; 6];
		let (src_subnet, src_node, domain_len) = match param.dest.domain.index {
			DomainIndex::Table(index) => {
				let Some(entry) = self.node.domain(index).copied() else {
					self.record_error(SystemError::InvalidDomain);
					self.nw_send_terminate(param);
					return;
				};
				if entry.invalid {
					if param.drop_if_unconfigured {
						self.record_error(SystemError::InvalidDomain);
					}
					log::debug!("nw_send: domain {index} not in use");
					self.nw_send_terminate(param);
					return;
				}
				let len = entry.len;
				domain_id[..usize::from(len)].copy_from_slice(entry.id_bytes());
				(entry.subnet, entry.node, len)
			}
			// Flex: source subnet/node are zero, domain carried verbatim.
			DomainIndex::Flex => {
				let len = param.dest.domain.len;
				domain_id[..usize::from(len)]
					.copy_from_slice(param.dest.domain.id_bytes());
				(0, 0, len)
			}
		};

		let mut wire = SmallVec::new();
		if npdu::build(
			param.version,
			param.pdu_type,
			src_subnet,
			src_node,
			&param.dest.dest,
			&domain_id[..usize::from(domain_len)],
			&param.pdu,
			&mut wire,
		)
		.is_err()
		{
			self.record_error(SystemError::InvalidDomain);
			self.nw_send_terminate(param);
			return;
		}

		if wire.len() > self.net.out_buf_size {
			self.record_error(SystemError::WritePastEndOfNetBuffer);
			self.nw_send_terminate(param);
			return;
		}

		self.stats.increment(Stat::L3Tx);
		self.link.submit_lpdu(priority, param.delta_backlog, param.alt_path, &wire);

		if param.pdu_type == PduType::Apdu {
			self.post_completion(param.tag, true);
		}
	}

	/// Drops the PDU, posting a failure completion if it was an
	/// application datagram.
	fn nw_send_terminate(&mut self, param: NwSendParam) {
		if param.pdu_type == PduType::Apdu {
			self.post_completion(param.tag, false);
		}
	}

	/// Network-layer receive step: parse one NPDU, apply the destination
	/// filter rules, and dispatch the enclosed PDU.
	pub(crate) fn nw_receive(&mut self) {
		let Some(item) = self.net.in_q.dequeue() else {
			return;
		};

		let parsed = match npdu::parse(&item.npdu) {
			Ok(parsed) => parsed,
			Err(err) => {
				log::debug!("nw_receive: discarding npdu: {err}");
				return;
			}
		};

		// Resolve the domain: first matching valid table entry, else flex.
		let configured = self.node.configured();
		let domain_index = (0..self.node.num_domains())
			.find(|&i| {
				configured
					&& self
						.node
						.domain(i)
						.is_some_and(|entry| entry.matches_id(parsed.domain))
			})
			.map_or(DomainIndex::Flex, DomainIndex::Table);
		let flex = domain_index == DomainIndex::Flex;

		let mut domain = Domain {
			index: domain_index,
			len: parsed.domain.len() as u8,
			id: [0; 6],
		};
		domain.id[..parsed.domain.len()].copy_from_slice(parsed.domain);

		// A repeater can hand us our own packet back; drop it.  Clone
		// domains legitimately share the source address, so they are
		// exempt.
		if let DomainIndex::Table(index) = domain_index {
			let entry = &self.node.domain_table[usize::from(index)];
			if !entry.clone
				&& parsed.src_subnet == entry.subnet
				&& parsed.src_node == entry.node
			{
				log::debug!("nw_receive: discarding own packet");
				return;
			}
		}

		let table_entry = match domain_index {
			DomainIndex::Table(index) => Some(&self.node.domain_table[usize::from(index)]),
			DomainIndex::Flex => None,
		};

		// Destination filtering per address mode.
		let dest = match parsed.dest {
			Destination::Broadcast { subnet } => {
				if let Some(entry) = table_entry
					&& subnet != 0 && subnet != entry.subnet
				{
					return;
				}
				ReceiveDest::Broadcast { subnet }
			}
			Destination::Multicast { group } => {
				if let DomainIndex::Table(index) = domain_index
					&& self.node.group_member(index, group).is_none()
				{
					return;
				}
				ReceiveDest::Multicast { group }
			}
			Destination::SubnetNode { subnet, node } => {
				if let Some(entry) = table_entry
					&& (subnet != entry.subnet || node != entry.node)
				{
					return;
				}
				ReceiveDest::SubnetNode
			}
			Destination::MulticastAck {
				subnet,
				node,
				group,
				member,
			} => {
				if let Some(entry) = table_entry
					&& (subnet != entry.subnet || node != entry.node)
				{
					return;
				}
				// The group must be one of ours: either by membership or
				// because the in-flight transaction targets it (a sender
				// need not be a member of the group it addresses).
				if let DomainIndex::Table(index) = domain_index
					&& self.node.group_member(index, group).is_none()
					&& !self.tsa_group_in_flight(group)
				{
					return;
				}
				ReceiveDest::MulticastAck {
					subnet,
					node,
					group,
					member,
				}
			}
			Destination::UniqueId { id, .. } => {
				if id != self.node.read_only.unique_id {
					return;
				}
				ReceiveDest::UniqueId
			}
		};

		// Unconfigured nodes hear only broadcast and unique-ID traffic.
		let mode = dest.mode();
		if !configured && mode != AddrMode::Broadcast && mode != AddrMode::UniqueId {
			return;
		}
		// A configured node hears a foreign domain only via unique-ID.
		if flex && configured && mode != AddrMode::UniqueId {
			return;
		}

		self.stats.increment(Stat::L3Rx);

		let src = SourceAddress {
			subnet: parsed.src_subnet,
			node: parsed.src_node,
			domain,
			dest,
		};

		match parsed.pdu_type {
			PduType::Apdu => {
				if self.app.in_q.is_full() || parsed.payload.len() > self.app.in_buf_size {
					if parsed.payload.len() > self.app.in_buf_size {
						self.record_error(SystemError::WritePastEndOfApplBuffer);
					}
					self.stats.increment(Stat::Lost);
					return;
				}
				let msg = IncomingMessage {
					src,
					service: Service::Unacknowledged,
					priority: item.priority,
					alt_path: item.alt_path,
					auth: self.node.config.nm_auth,
					req_id: 0,
					tag: 0,
					apdu: parsed.payload.to_vec(),
				};
				let _ = self.app.in_q.enqueue(msg);
			}
			PduType::Tpdu | PduType::Spdu | PduType::AuthPdu => {
				if self.tsa.in_q.is_full() || parsed.payload.len() > self.tsa.in_buf_size {
					if parsed.payload.len() > self.tsa.in_buf_size {
						self.record_error(SystemError::WritePastEndOfApplBuffer);
					}
					self.stats.increment(Stat::Lost);
					return;
				}
				let param = TsaReceiveParam {
					pdu_type: parsed.pdu_type,
					src,
					priority: item.priority,
					alt_path: item.alt_path,
					version: parsed.version,
					pdu: parsed.payload.to_vec(),
				};
				let _ = self.tsa.in_q.enqueue(param);
			}
		}
	}
}
