//! Transport, session, and authentication layers.
//!
//! One transmit record per priority level carries the single in-flight
//! outbound transaction; a pool of receive records provides duplicate
//! detection and request/response retention on the inbound side.  The
//! challenge/reply authentication exchange is folded into the same state
//! machines.

pub mod auth;
pub mod tcs;

use alloc::vec::Vec;

use crate::collections::PacketQueue;
use crate::config::{ALT_PATH_COUNT, APP_IN_BUF_SIZE_CODE, APP_IN_Q_CNT_CODE,
	APP_OUT_BUF_SIZE_CODE, APP_OUT_PRI_Q_CNT_CODE, APP_OUT_Q_CNT_CODE, AUTH_KEY_LEN,
	DOMAIN_ID_LEN, MAX_GROUP_MEMBER, RECEIVE_TRANS_COUNT, TS_RESET_DELAY_MS, UNIQUE_ID_LEN,
	UNIQUE_ID_RECV_TIMER_MS};
use crate::net::addr::{AddrMode, Destination, DestinationAddress, Domain, DomainIndex,
	ReceiveDest, SourceAddress};
use crate::net::npdu::{PduType, ProtocolVersion};
use crate::net::{AltPathFlags, NwSendParam};
use crate::node::{AuthType, ResetCause, decode_buffer_cnt, decode_buffer_size,
	decode_rpt_timer, decode_tx_timer};
use crate::stack::Stack;
use crate::stats::{Stat, SystemError};
use crate::time::LonTimer;
use crate::transport::auth::{challenge_oma_address, encrypt, reply_oma_address};

// TPDU message types.
const TP_ACKD: u8 = 0;
const TP_UNACK_RPT: u8 = 1;
const TP_ACK: u8 = 2;
// SPDU message types.
const SN_REQUEST: u8 = 0;
const SN_RESPONSE: u8 = 2;
// Shared by TPDU and SPDU.
const TS_REMINDER: u8 = 4;
const TS_REM_MSG: u8 = 5;
// AuthPDU message types.
const AUTH_CHALLENGE: u8 = 0;
const AUTH_CHALLENGE_OMA: u8 = 1;
const AUTH_REPLY: u8 = 2;
const AUTH_REPLY_OMA: u8 = 3;

/// Delivery service of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
	Acknowledged,
	/// Unacknowledged-repeated: the message is repeated, nobody acks.
	Repeated,
	/// Plain unacknowledged; bypasses the transport layer entirely.
	Unacknowledged,
	Request,
	Response,
}

/// Retry count and timer codes for one submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendTimers {
	pub retry_count: u8,
	pub rpt_timer_code: u8,
	pub tx_timer_code: u8,
}

/// Destination of a submission, mirroring the address-table shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendAddress {
	SubnetNode {
		domain_index: u8,
		subnet: u8,
		node: u8,
		timers: SendTimers,
	},
	Group {
		domain_index: u8,
		group: u8,
		/// Group size including this node; 0 encodes an open group.
		size: u8,
		timers: SendTimers,
	},
	Broadcast {
		domain_index: u8,
		subnet: u8,
		/// Backlog hint; 0 selects the default of 15.
		backlog: u8,
		/// Responses delivered before a broadcast request completes.
		max_responses: u8,
		timers: SendTimers,
	},
	UniqueId {
		domain_index: u8,
		subnet: u8,
		id: [u8; UNIQUE_ID_LEN],
		timers: SendTimers,
	},
	/// Local turnaround binding; nothing goes out on the wire.
	Turnaround { timers: SendTimers },
}

impl SendAddress {
	pub fn timers(&self) -> SendTimers {
		match *self {
			SendAddress::SubnetNode { timers, .. }
			| SendAddress::Group { timers, .. }
			| SendAddress::Broadcast { timers, .. }
			| SendAddress::UniqueId { timers, .. }
			| SendAddress::Turnaround { timers } => timers,
		}
	}

	fn domain_index(&self) -> Option<u8> {
		match *self {
			SendAddress::SubnetNode { domain_index, .. }
			| SendAddress::Group { domain_index, .. }
			| SendAddress::Broadcast { domain_index, .. }
			| SendAddress::UniqueId { domain_index, .. } => Some(domain_index),
			SendAddress::Turnaround { .. } => None,
		}
	}
}

/// Domain selection for a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendDomain {
	/// Use the domain index embedded in the destination address.
	FromAddress,
	Table(u8),
	/// Send on a domain this node does not belong to; source subnet/node
	/// go out as zero.
	Flex { len: u8, id: [u8; DOMAIN_ID_LEN] },
}

/// Alternate authentication key material carried by a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AltKey {
	pub key: [[u8; AUTH_KEY_LEN]; 2],
}

/// An outbound message submitted by the application.
#[derive(Clone, Debug)]
pub struct SendRequest {
	pub tag: u16,
	pub service: Service,
	pub priority: bool,
	pub auth: bool,
	pub dest: SendAddress,
	pub domain: SendDomain,
	/// Pins the alt-path flags instead of the automatic last-retries
	/// policy.
	pub alt_path_override: Option<AltPathFlags>,
	/// Extra wait added to the final retry timer (proxy chaining).
	pub last_retry_extra_ms: u16,
	pub alt_key: Option<AltKey>,
	/// Inherit the transaction number from the receive record whose
	/// request id equals `tag` (proxy chaining).
	pub inherit_tid: bool,
	pub apdu: Vec<u8>,
}

impl SendRequest {
	pub fn new(tag: u16, service: Service, dest: SendAddress, apdu: Vec<u8>) -> Self {
		Self {
			tag,
			service,
			priority: false,
			auth: false,
			dest,
			domain: SendDomain::FromAddress,
			alt_path_override: None,
			last_retry_extra_ms: 0,
			alt_key: None,
			inherit_tid: false,
			apdu,
		}
	}
}

/// A response the application produced for an earlier request.
#[derive(Clone, Debug)]
pub struct ResponseParam {
	pub req_id: u16,
	/// Consume the request without emitting anything.
	pub null_response: bool,
	/// Emit with zeroed source subnet/node.
	pub flex_response: bool,
	pub apdu: Vec<u8>,
}

/// A message delivered to the application.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
	pub src: SourceAddress,
	pub service: Service,
	pub priority: bool,
	pub alt_path: AltPathFlags,
	/// True iff a challenge/reply handshake completed successfully.
	pub auth: bool,
	/// Correlates a request with the response the application submits;
	/// 0 for everything that is not a request.
	pub req_id: u16,
	/// For responses: the tag of the request submission.
	pub tag: u16,
	pub apdu: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionEvent {
	pub tag: u16,
	pub success: bool,
}

/// Events surfaced to the application.
#[derive(Clone, Debug)]
pub enum AppEvent {
	Message(IncomingMessage),
	Completion(CompletionEvent),
	/// The stack went through a reset cascade.
	Reset(crate::node::ResetCause),
}

/// One inbound T/S/Auth PDU handed up by the network layer.
#[derive(Clone, Debug)]
pub struct TsaReceiveParam {
	pub pdu_type: PduType,
	pub src: SourceAddress,
	pub priority: bool,
	pub alt_path: AltPathFlags,
	pub version: ProtocolVersion,
	pub pdu: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Layer {
	Transport,
	Session,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxOwner {
	Unused,
	Transport,
	Session,
}

impl Layer {
	fn tx_owner(self) -> TxOwner {
		match self {
			Layer::Transport => TxOwner::Transport,
			Layer::Session => TxOwner::Session,
		}
	}

	fn rr_owner(self) -> RrOwner {
		match self {
			Layer::Transport => RrOwner::Transport,
			Layer::Session => RrOwner::Session,
		}
	}

	fn pdu_type(self) -> PduType {
		match self {
			Layer::Transport => PduType::Tpdu,
			Layer::Session => PduType::Spdu,
		}
	}
}

/// The per-priority outbound transaction state.
pub(crate) struct TransmitRecord {
	pub owner: TxOwner,
	pub dest: DestinationAddress,
	pub ack_received: [bool; MAX_GROUP_MEMBER + 1],
	pub dest_count: u8,
	pub ack_count: u8,
	pub tid: u16,
	pub xmit_timer_value: u16,
	pub xmit_timer: LonTimer,
	pub retries_left: u8,
	pub apdu: Vec<u8>,
	pub auth: bool,
	pub version: ProtocolVersion,
	// Cached from the submission so retries and termination need not
	// consult it again.
	pub service: Service,
	pub tag: u16,
	pub alt_path_override: Option<AltPathFlags>,
	pub bcast_backlog: u8,
	pub max_responses: u8,
	pub last_retry_extra_ms: u16,
	pub alt_key: Option<AltKey>,
}

impl TransmitRecord {
	fn unused() -> Self {
		Self {
			owner: TxOwner::Unused,
			dest: DestinationAddress {
				domain: Domain::table(0),
				dest: Destination::Broadcast { subnet: 0 },
			},
			ack_received: [false; MAX_GROUP_MEMBER + 1],
			dest_count: 0,
			ack_count: 0,
			tid: 0,
			xmit_timer_value: 0,
			xmit_timer: LonTimer::new(),
			retries_left: 0,
			apdu: Vec::new(),
			auth: false,
			version: ProtocolVersion::Legacy,
			service: Service::Acknowledged,
			tag: 0,
			alt_path_override: None,
			bcast_backlog: 0,
			max_responses: 0,
			last_retry_extra_ms: 0,
			alt_key: None,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RrOwner {
	Unused,
	Transport,
	Session,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransState {
	JustReceived,
	Authenticating,
	Authenticated,
	Delivered,
	Responded,
	Done,
}

/// One receive (duplicate-detection) record.
pub(crate) struct ReceiveRecord {
	pub owner: RrOwner,
	pub src: SourceAddress,
	pub tid: u16,
	pub req_id: u16,
	pub recv_timer: LonTimer,
	pub state: TransState,
	pub priority: bool,
	pub alt_path: AltPathFlags,
	pub auth_ok: bool,
	pub need_auth: bool,
	pub service: Service,
	pub challenge: [u8; 8],
	pub response: Vec<u8>,
	pub apdu: Vec<u8>,
	pub version: ProtocolVersion,
}

impl ReceiveRecord {
	fn unused() -> Self {
		Self {
			owner: RrOwner::Unused,
			src: SourceAddress {
				subnet: 0,
				node: 0,
				domain: Domain::table(0),
				dest: ReceiveDest::SubnetNode,
			},
			tid: 0,
			req_id: 0,
			recv_timer: LonTimer::new(),
			state: TransState::JustReceived,
			priority: false,
			alt_path: AltPathFlags::empty(),
			auth_ok: false,
			need_auth: false,
			service: Service::Acknowledged,
			challenge: [0; 8],
			response: Vec::new(),
			apdu: Vec::new(),
			version: ProtocolVersion::Legacy,
		}
	}
}

/// Transport/session/authentication state: queues, transmit records, and
/// the receive-record pool.
pub(crate) struct Tsa {
	pub in_q: PacketQueue<TsaReceiveParam>,
	pub out_q: PacketQueue<SendRequest>,
	pub out_pri_q: PacketQueue<SendRequest>,
	pub resp_q: PacketQueue<ResponseParam>,
	pub in_buf_size: usize,
	pub out_buf_size: usize,
	pub resp_buf_size: usize,
	pub xmit_rec: TransmitRecord,
	pub pri_xmit_rec: TransmitRecord,
	pub recv_recs: Vec<ReceiveRecord>,
	pub req_id: u16,
	pub ts_delay_timer: LonTimer,
}

impl Tsa {
	pub fn reset() -> Self {
		let in_buf = usize::from(decode_buffer_size(APP_IN_BUF_SIZE_CODE)) + 4;
		let out_buf = usize::from(decode_buffer_size(APP_OUT_BUF_SIZE_CODE)) + 4;
		Self {
			in_q: PacketQueue::with_capacity(decode_buffer_cnt(APP_IN_Q_CNT_CODE).into()),
			out_q: PacketQueue::with_capacity(decode_buffer_cnt(APP_OUT_Q_CNT_CODE).into()),
			out_pri_q: PacketQueue::with_capacity(
				decode_buffer_cnt(APP_OUT_PRI_Q_CNT_CODE).into(),
			),
			resp_q: PacketQueue::with_capacity(decode_buffer_cnt(APP_OUT_Q_CNT_CODE).into()),
			in_buf_size: in_buf.max(10),
			out_buf_size: out_buf.max(10),
			resp_buf_size: decode_buffer_size(APP_OUT_BUF_SIZE_CODE).into(),
			xmit_rec: TransmitRecord::unused(),
			pri_xmit_rec: TransmitRecord::unused(),
			recv_recs: (0..RECEIVE_TRANS_COUNT).map(|_| ReceiveRecord::unused()).collect(),
			req_id: 0,
			ts_delay_timer: LonTimer::new(),
		}
	}
}

fn parse_tid(pdu: &[u8], version: ProtocolVersion) -> Option<(u16, usize)> {
	let header = *pdu.first()?;
	match version {
		ProtocolVersion::Legacy => Some((u16::from(header & 0x0F), 1)),
		ProtocolVersion::Enhanced => {
			let low = *pdu.get(1)?;
			Some((u16::from(header & 0x0F) << 8 | u16::from(low), 2))
		}
	}
}

fn push_tspdu_header(out: &mut Vec<u8>, auth: bool, msg_type: u8, tid: u16,
	version: ProtocolVersion)
{
	match version {
		ProtocolVersion::Legacy => {
			out.push(u8::from(auth) << 7 | (msg_type & 0x07) << 4 | tid as u8 & 0x0F);
		}
		ProtocolVersion::Enhanced => {
			out.push(u8::from(auth) << 7 | (msg_type & 0x07) << 4 | (tid >> 8) as u8 & 0x0F);
			out.push(tid as u8);
		}
	}
}

fn push_authpdu_header(out: &mut Vec<u8>, format: u8, msg_type: u8, tid: u16,
	version: ProtocolVersion)
{
	match version {
		ProtocolVersion::Legacy => {
			out.push((format & 0x03) << 6 | (msg_type & 0x03) << 4 | tid as u8 & 0x0F);
		}
		ProtocolVersion::Enhanced => {
			out.push((format & 0x03) << 6 | (msg_type & 0x03) << 4 | (tid >> 8) as u8 & 0x0F);
			out.push(tid as u8);
		}
	}
}

fn addr_mode_format(mode: AddrMode) -> u8 {
	mode.format() as u8
}

impl Stack {
	/// True while the post-reset quiet period suppresses transport and
	/// session sends.
	fn send_blocked(&mut self) -> bool {
		self.tsa.ts_delay_timer.running(&*self.clock)
	}

	pub(crate) fn start_ts_delay(&mut self, cause: ResetCause) {
		if cause == ResetCause::PowerUp || cause == ResetCause::External {
			self.tsa.ts_delay_timer.set(&*self.clock, TS_RESET_DELAY_MS);
		}
	}

	fn auth_oma(&self) -> bool {
		self.node.domain_table[0].auth_type == AuthType::Oma
	}

	/// Transport-layer send step.
	pub(crate) fn tp_send(&mut self) {
		if self.send_blocked() {
			return;
		}
		if self.tsa.pri_xmit_rec.owner == TxOwner::Transport
			&& !self.tsa.pri_xmit_rec.xmit_timer.running(&*self.clock)
		{
			self.xmit_timer_expiration(Layer::Transport, true);
		} else if self.tsa.pri_xmit_rec.owner == TxOwner::Unused
			&& !self.tsa.out_pri_q.is_empty()
			&& !self.net.out_pri_q.is_full()
		{
			self.send_new_msg(Layer::Transport, true);
		} else if self.tsa.xmit_rec.owner == TxOwner::Transport
			&& !self.tsa.xmit_rec.xmit_timer.running(&*self.clock)
		{
			self.xmit_timer_expiration(Layer::Transport, false);
		} else if self.tsa.xmit_rec.owner == TxOwner::Unused
			&& !self.tsa.out_q.is_empty()
			&& !self.net.out_q.is_full()
		{
			self.send_new_msg(Layer::Transport, false);
		}
	}

	/// Session-layer send step.  Responses go first: they are not
	/// transactions and should not wait behind one.
	pub(crate) fn sn_send(&mut self) {
		if self.send_blocked() {
			return;
		}

		if !self.tsa.resp_q.is_empty() && !self.net.out_q.is_full() {
			let response = self.tsa.resp_q.dequeue().unwrap();
			let Some(index) = self.find_rr(response.req_id) else {
				log::debug!("sn_send: discarding stale response");
				self.stats.increment(Stat::LateAck);
				return;
			};
			if response.apdu.len() > self.tsa.resp_buf_size {
				log::debug!("sn_send: discarding over-long response");
				return;
			}
			let rr = &mut self.tsa.recv_recs[index];
			rr.response = response.apdu;
			rr.state = TransState::Responded;
			self.sn_send_response(index, response.null_response, response.flex_response);
			return;
		}

		if self.tsa.pri_xmit_rec.owner == TxOwner::Session
			&& !self.tsa.pri_xmit_rec.xmit_timer.running(&*self.clock)
		{
			self.xmit_timer_expiration(Layer::Session, true);
		} else if self.tsa.pri_xmit_rec.owner == TxOwner::Unused
			&& !self.tsa.out_pri_q.is_empty()
			&& !self.net.out_pri_q.is_full()
		{
			self.send_new_msg(Layer::Session, true);
		} else if self.tsa.xmit_rec.owner == TxOwner::Session
			&& !self.tsa.xmit_rec.xmit_timer.running(&*self.clock)
		{
			self.xmit_timer_expiration(Layer::Session, false);
		} else if self.tsa.xmit_rec.owner == TxOwner::Unused
			&& !self.tsa.out_q.is_empty()
			&& !self.net.out_q.is_full()
		{
			self.send_new_msg(Layer::Session, false);
		}
	}

	/// Authentication send step: re-issue challenges that could not go out
	/// earlier for lack of network-queue space.
	pub(crate) fn auth_send(&mut self) {
		for index in 0..self.tsa.recv_recs.len() {
			let rr = &self.tsa.recv_recs[index];
			if rr.owner != RrOwner::Unused
				&& rr.need_auth
				&& rr.state == TransState::JustReceived
			{
				self.initiate_challenge(index);
			}
		}
	}

	/// Posts a completion for the submission at the head of the TSA output
	/// queue and consumes it.  Returns false (leaving the submission
	/// queued) when the completion queue is full.
	fn complete_head(&mut self, priority: bool, success: bool) -> bool {
		if self.app.ce_rsp_q.is_full() {
			return false;
		}
		let q = if priority { &mut self.tsa.out_pri_q } else { &mut self.tsa.out_q };
		if let Some(request) = q.dequeue() {
			self.post_completion(request.tag, success);
		}
		true
	}

	/// Arms a transmit record from the submission at the head of the TSA
	/// output queue and emits the first PDU.
	fn send_new_msg(&mut self, layer: Layer, priority: bool) {
		let head = if priority { self.tsa.out_pri_q.front() } else { self.tsa.out_q.front() };
		let Some(head) = head else { return };

		// Each layer processes only its own services; the other layer's
		// head stays queued for it.
		match layer {
			Layer::Transport
				if head.service != Service::Acknowledged
					&& head.service != Service::Repeated =>
			{
				return;
			}
			Layer::Session if head.service != Service::Request => return,
			_ => {}
		}
		let request = head.clone();

		// Open groups (encoded size 0) and singleton groups cannot collect
		// acknowledgements.
		if let SendAddress::Group { size, .. } = request.dest {
			if request.service != Service::Repeated
				&& (size <= 1 || usize::from(size) > MAX_GROUP_MEMBER + 1)
			{
				self.complete_head(priority, false);
				return;
			}
		}
		if matches!(request.dest, SendAddress::Turnaround { .. }) {
			// Turnaround bindings never reach the wire; the datapoint
			// surface owns local delivery.
			self.complete_head(priority, false);
			return;
		}
		if request.apdu.len() + 1 > self.net.out_buf_size {
			self.complete_head(priority, false);
			return;
		}

		// Resolve the network destination.
		let domain = match request.domain {
			SendDomain::FromAddress => {
				Domain::table(request.dest.domain_index().unwrap_or(0))
			}
			SendDomain::Table(index) => Domain::table(index),
			SendDomain::Flex { len, id } => Domain::flex(len, id),
		};
		let dest = match request.dest {
			SendAddress::SubnetNode { subnet, node, .. } => {
				Destination::SubnetNode { subnet, node }
			}
			SendAddress::Group { group, .. } => Destination::Multicast { group },
			SendAddress::Broadcast { subnet, .. } => Destination::Broadcast { subnet },
			SendAddress::UniqueId { subnet, id, .. } => {
				Destination::UniqueId { subnet, id }
			}
			SendAddress::Turnaround { .. } => unreachable!(),
		};
		let dest_addr = DestinationAddress { domain, dest };

		let tid = {
			let allocator = self.tcs.get_mut(priority);
			match allocator.new_trans(&dest_addr, &self.node, &*self.clock) {
				Some(tid) => tid,
				// No transaction number available; retry next tick.
				None => return,
			}
		};

		let timers = request.dest.timers();
		let version = self.protocol_version;

		// Proxy chaining inherits the upstream transaction number.
		let mut tid = tid;
		if request.inherit_tid
			&& let Some(index) = self.find_rr(request.tag)
		{
			tid = self.tsa.recv_recs[index].tid;
			self.tcs.get_mut(priority).override_tid(tid);
		}

		let dest_count = match request.dest {
			SendAddress::Group {
				domain_index,
				group,
				size,
				..
			} => {
				let count = if self.node.group_member(domain_index, group).is_some() {
					size.saturating_sub(1)
				} else {
					size
				};
				count.max(1)
			}
			_ => 1,
		};

		let (bcast_backlog, max_responses) = match request.dest {
			SendAddress::Broadcast {
				backlog,
				max_responses,
				..
			} => (backlog, max_responses.max(1)),
			_ => (0, 0),
		};

		let msg_type = match request.service {
			Service::Repeated => TP_UNACK_RPT,
			_ if layer == Layer::Transport => TP_ACKD,
			_ => SN_REQUEST,
		};

		let mut pdu = Vec::with_capacity(2 + request.apdu.len());
		push_tspdu_header(&mut pdu, request.auth, msg_type, tid, version);
		pdu.extend_from_slice(&request.apdu);

		let delta_backlog = match request.service {
			Service::Repeated => timers.retry_count,
			_ => match dest {
				Destination::Broadcast { .. } => {
					if bcast_backlog != 0 { bcast_backlog } else { 15 }
				}
				Destination::Multicast { .. } => dest_count,
				_ => 1,
			},
		};

		let alt_path = request.alt_path_override.unwrap_or_else(|| {
			let mut flags = AltPathFlags::empty();
			if request.service != Service::Repeated && timers.retry_count <= ALT_PATH_COUNT {
				flags |= AltPathFlags::ALT_PATH;
			}
			flags
		});

		let xmit_timer_value = if request.service == Service::Repeated {
			decode_rpt_timer(timers.rpt_timer_code)
		} else {
			decode_tx_timer(timers.tx_timer_code)
		};

		let rec = if priority { &mut self.tsa.pri_xmit_rec } else { &mut self.tsa.xmit_rec };
		*rec = TransmitRecord {
			owner: layer.tx_owner(),
			dest: dest_addr,
			ack_received: [false; MAX_GROUP_MEMBER + 1],
			dest_count,
			ack_count: 0,
			tid,
			xmit_timer_value,
			xmit_timer: LonTimer::new(),
			retries_left: timers.retry_count,
			apdu: request.apdu.clone(),
			auth: request.auth,
			version,
			service: request.service,
			tag: request.tag,
			alt_path_override: request.alt_path_override,
			bcast_backlog,
			max_responses,
			last_retry_extra_ms: request.last_retry_extra_ms,
			alt_key: request.alt_key,
		};
		rec.xmit_timer.set(&*self.clock, xmit_timer_value);

		let param = NwSendParam {
			dest: dest_addr,
			pdu_type: layer.pdu_type(),
			version,
			delta_backlog,
			alt_path,
			drop_if_unconfigured: true,
			tag: request.tag,
			pdu,
		};
		let q = if priority { &mut self.net.out_pri_q } else { &mut self.net.out_q };
		let _ = q.enqueue(param);

		// The submission is now carried by the transmit record.
		let out = if priority { &mut self.tsa.out_pri_q } else { &mut self.tsa.out_q };
		out.dequeue();

		log::debug!(
			"tsa: armed {:?} tid {tid} to {:?} ({} destinations)",
			request.service,
			dest,
			dest_count
		);
	}

	/// Handles a transmit-timer expiry: retry, reminder synthesis, or
	/// transaction termination.
	fn xmit_timer_expiration(&mut self, layer: Layer, priority: bool) {
		let rec = if priority { &self.tsa.pri_xmit_rec } else { &self.tsa.xmit_rec };
		let mode = rec.dest.dest.mode();
		let done = rec.retries_left == 0
			|| rec.dest_count == rec.ack_count
			|| (mode == AddrMode::Broadcast && rec.ack_count >= 1);
		if done {
			self.terminate_trans(priority);
			return;
		}

		// A retry is lost locally when the network queue has no space.
		let q_full = if priority { self.net.out_pri_q.is_full() } else { self.net.out_q.is_full() };
		if q_full {
			let rec =
				if priority { &mut self.tsa.pri_xmit_rec } else { &mut self.tsa.xmit_rec };
			rec.retries_left -= 1;
			let value = rec.xmit_timer_value;
			rec.xmit_timer.set(&*self.clock, value);
			log::debug!("tsa: retry lost, network queue full");
			return;
		}

		let rec = if priority { &self.tsa.pri_xmit_rec } else { &self.tsa.xmit_rec };
		let version = rec.version;
		let service = rec.service;
		let auth = rec.auth;
		let tid = rec.tid;
		let dest_addr = rec.dest;

		enum RetryPdu {
			Plain(u8),
			RemMsg { mlist_len: u8 },
			ReminderPair { mlist_len: u8 },
		}

		let shape = if service == Service::Repeated {
			RetryPdu::Plain(TP_UNACK_RPT)
		} else if mode != AddrMode::Multicast {
			let msg_type = match layer {
				Layer::Transport => TP_ACKD,
				Layer::Session => SN_REQUEST,
			};
			RetryPdu::Plain(msg_type)
		} else {
			// Reminder framing: a bitmask of members already heard from,
			// padded up to the highest member seen.
			let mlist_len = if rec.ack_count == 0 {
				0
			} else {
				match rec.ack_received.iter().rposition(|&acked| acked) {
					Some(highest) => (highest / 8 + 1) as u8,
					None => {
						// ackCount said someone acked; the bitmap disagrees.
						let rec = if priority {
							&mut self.tsa.pri_xmit_rec
						} else {
							&mut self.tsa.xmit_rec
						};
						rec.retries_left = 0;
						log::error!("tsa: ack bitmap inconsistent with ack count");
						return;
					}
				}
			};
			if mlist_len <= 2 {
				RetryPdu::RemMsg { mlist_len }
			} else {
				RetryPdu::ReminderPair { mlist_len }
			}
		};

		let rec = if priority { &self.tsa.pri_xmit_rec } else { &self.tsa.xmit_rec };
		let retries_left = rec.retries_left;
		let alt_override = rec.alt_path_override;
		let base_alt = {
			let mut flags = alt_override.unwrap_or_default();
			if alt_override.is_none() {
				flags.remove(AltPathFlags::ALT_PATH);
				if service != Service::Repeated
					&& retries_left <= ALT_PATH_COUNT + 1
				{
					flags |= AltPathFlags::ALT_PATH;
				}
			}
			flags | AltPathFlags::ALT_RETRY
		};

		let delta_backlog = match service {
			Service::Repeated => 0,
			_ => match mode {
				AddrMode::Broadcast => {
					if rec.bcast_backlog != 0 { rec.bcast_backlog } else { 15 }
				}
				AddrMode::Multicast => rec.dest_count - rec.ack_count,
				_ => 1,
			},
		};

		let mut mlist = [0u8; 8];
		let mlist_len = match shape {
			RetryPdu::RemMsg { mlist_len } | RetryPdu::ReminderPair { mlist_len } => {
				for (member, &acked) in rec.ack_received.iter().enumerate() {
					if member < usize::from(mlist_len) * 8 && acked {
						mlist[member / 8] |= 1 << (member % 8);
					}
				}
				mlist_len
			}
			RetryPdu::Plain(_) => 0,
		};

		match shape {
			RetryPdu::Plain(msg_type) => {
				let mut pdu = Vec::with_capacity(2 + rec.apdu.len());
				push_tspdu_header(&mut pdu, auth, msg_type, tid, version);
				pdu.extend_from_slice(&rec.apdu);
				let param = NwSendParam {
					dest: dest_addr,
					pdu_type: layer.pdu_type(),
					version,
					delta_backlog,
					alt_path: base_alt,
					drop_if_unconfigured: true,
					tag: 0,
					pdu,
				};
				let q = if priority { &mut self.net.out_pri_q } else { &mut self.net.out_q };
				let _ = q.enqueue(param);
			}
			RetryPdu::RemMsg { .. } => {
				// Short member list: a single REM/MSG carries both the
				// bitmap and the APDU.
				let mut pdu = Vec::with_capacity(4 + usize::from(mlist_len) + rec.apdu.len());
				push_tspdu_header(&mut pdu, auth, TS_REM_MSG, tid, version);
				pdu.push(mlist_len);
				pdu.extend_from_slice(&mlist[..usize::from(mlist_len)]);
				pdu.extend_from_slice(&rec.apdu);
				let param = NwSendParam {
					dest: dest_addr,
					pdu_type: layer.pdu_type(),
					version,
					delta_backlog,
					alt_path: base_alt,
					drop_if_unconfigured: true,
					tag: 0,
					pdu,
				};
				let q = if priority { &mut self.net.out_pri_q } else { &mut self.net.out_q };
				let _ = q.enqueue(param);
			}
			RetryPdu::ReminderPair { .. } => {
				// Long member list: a REMINDER (no APDU) followed by the
				// plain retry.  Emit neither unless both fit.
				let q = if priority { &self.net.out_pri_q } else { &self.net.out_q };
				if q.free() < 2 {
					let rec = if priority {
						&mut self.tsa.pri_xmit_rec
					} else {
						&mut self.tsa.xmit_rec
					};
					rec.retries_left -= 1;
					let value = rec.xmit_timer_value;
					rec.xmit_timer.set(&*self.clock, value);
					log::debug!("tsa: reminder pair lost, network queue full");
					return;
				}

				let mut reminder = Vec::with_capacity(3 + usize::from(mlist_len));
				push_tspdu_header(&mut reminder, auth, TS_REMINDER, tid, version);
				reminder.push(mlist_len);
				reminder.extend_from_slice(&mlist[..usize::from(mlist_len)]);
				let reminder_param = NwSendParam {
					dest: dest_addr,
					pdu_type: layer.pdu_type(),
					version,
					delta_backlog: 0,
					alt_path: base_alt,
					drop_if_unconfigured: true,
					tag: 0,
					pdu: reminder,
				};

				let msg_type = match layer {
					Layer::Transport => TP_ACKD,
					Layer::Session => SN_REQUEST,
				};
				let mut pdu = Vec::with_capacity(2 + rec.apdu.len());
				push_tspdu_header(&mut pdu, auth, msg_type, tid, version);
				pdu.extend_from_slice(&rec.apdu);
				let param = NwSendParam {
					dest: dest_addr,
					pdu_type: layer.pdu_type(),
					version,
					delta_backlog,
					alt_path: base_alt,
					drop_if_unconfigured: true,
					tag: 0,
					pdu,
				};

				let q = if priority { &mut self.net.out_pri_q } else { &mut self.net.out_q };
				let _ = q.enqueue(reminder_param);
				let _ = q.enqueue(param);
			}
		}

		if service != Service::Repeated {
			self.stats.increment(Stat::Retry);
		}

		let rec = if priority { &mut self.tsa.pri_xmit_rec } else { &mut self.tsa.xmit_rec };
		rec.retries_left -= 1;
		if rec.retries_left == 0 {
			// The final retry waits longer where a proxy chain needs time
			// to propagate a failing response.
			rec.xmit_timer_value = rec.xmit_timer_value.saturating_add(rec.last_retry_extra_ms);
		}
		let value = rec.xmit_timer_value;
		rec.xmit_timer.set(&*self.clock, value);
	}

	/// Ends the in-flight transaction and posts its completion event.  If
	/// the completion queue is full, nothing happens and the next tick
	/// tries again.
	fn terminate_trans(&mut self, priority: bool) {
		if self.app.ce_rsp_q.is_full() {
			return;
		}
		let rec = if priority { &mut self.tsa.pri_xmit_rec } else { &mut self.tsa.xmit_rec };
		let success = rec.service == Service::Repeated
			|| rec.dest_count == rec.ack_count
			|| (rec.dest.dest.mode() == AddrMode::Broadcast && rec.ack_count >= 1);
		let tag = rec.tag;
		rec.owner = TxOwner::Unused;
		rec.xmit_timer.stop();
		if !success {
			self.stats.increment(Stat::TxFailure);
		}
		self.tcs.get_mut(priority).trans_done();
		self.post_completion(tag, success);
		log::debug!("tsa: transaction {tag} terminated, success={success}");
	}

	/// Transport-layer receive step.
	pub(crate) fn tp_receive(&mut self) {
		for index in 0..self.tsa.recv_recs.len() {
			let rr = &mut self.tsa.recv_recs[index];
			if rr.owner == RrOwner::Transport && rr.recv_timer.expired(&*self.clock) {
				rr.owner = RrOwner::Unused;
			}
		}

		let Some(front) = self.tsa.in_q.front() else { return };
		if front.pdu_type != PduType::Tpdu {
			return;
		}
		if front.pdu.is_empty() {
			self.tsa.in_q.dequeue();
			return;
		}
		match front.pdu[0] >> 4 & 0x07 {
			TP_ACK => self.tp_receive_ack(),
			TP_ACKD | TP_UNACK_RPT => self.receive_new_msg(Layer::Transport),
			TS_REMINDER | TS_REM_MSG => self.receive_rem(Layer::Transport),
			_ => {
				self.tsa.in_q.dequeue();
				self.record_error(SystemError::UnknownPdu);
			}
		}
	}

	/// Session-layer receive step.
	pub(crate) fn sn_receive(&mut self) {
		for index in 0..self.tsa.recv_recs.len() {
			let rr = &mut self.tsa.recv_recs[index];
			if rr.owner == RrOwner::Session && rr.recv_timer.expired(&*self.clock) {
				rr.owner = RrOwner::Unused;
			}
		}

		let Some(front) = self.tsa.in_q.front() else { return };
		if front.pdu_type != PduType::Spdu {
			return;
		}
		if front.pdu.is_empty() {
			self.tsa.in_q.dequeue();
			return;
		}
		match front.pdu[0] >> 4 & 0x07 {
			SN_RESPONSE => self.sn_receive_response(),
			SN_REQUEST => self.receive_new_msg(Layer::Session),
			TS_REMINDER | TS_REM_MSG => self.receive_rem(Layer::Session),
			_ => {
				self.tsa.in_q.dequeue();
				self.record_error(SystemError::UnknownPdu);
			}
		}
	}

	/// Authentication receive step: challenges and replies.
	pub(crate) fn auth_receive(&mut self) {
		let Some(front) = self.tsa.in_q.front() else { return };
		if front.pdu_type != PduType::AuthPdu {
			return;
		}
		if front.pdu.is_empty() {
			self.tsa.in_q.dequeue();
			return;
		}
		match front.pdu[0] >> 4 & 0x03 {
			AUTH_CHALLENGE => self.send_reply_to_challenge(false),
			AUTH_CHALLENGE_OMA => self.send_reply_to_challenge(true),
			AUTH_REPLY => self.process_reply(false),
			_ => self.process_reply(true),
		}
	}

	/// Matches an ACK against the in-flight transmit record.
	fn tp_receive_ack(&mut self) {
		let Some(param) = self.tsa.in_q.front().cloned() else { return };
		let priority = param.priority;
		let Some((tid, _)) = parse_tid(&param.pdu, param.version) else {
			self.tsa.in_q.dequeue();
			return;
		};

		if !self.tcs.get(priority).validate(tid) {
			self.tsa.in_q.dequeue();
			self.stats.increment(Stat::LateAck);
			return;
		}

		let rec = if priority { &self.tsa.pri_xmit_rec } else { &self.tsa.xmit_rec };
		if rec.owner != TxOwner::Transport
			|| rec.dest.domain.index != param.src.domain.index
			|| !self.ack_matches_record(rec, &param)
		{
			self.tsa.in_q.dequeue();
			self.stats.increment(Stat::LateAck);
			return;
		}

		match rec.dest.dest.mode() {
			AddrMode::Broadcast | AddrMode::SubnetNode | AddrMode::UniqueId => {
				let rec = if priority {
					&mut self.tsa.pri_xmit_rec
				} else {
					&mut self.tsa.xmit_rec
				};
				rec.ack_count += 1;
				self.terminate_trans(priority);
			}
			AddrMode::Multicast => {
				if let ReceiveDest::MulticastAck { member, .. } = param.src.dest {
					if usize::from(member) > MAX_GROUP_MEMBER {
						log::debug!("tp_receive_ack: invalid member number");
					} else {
						let rec = if priority {
							&mut self.tsa.pri_xmit_rec
						} else {
							&mut self.tsa.xmit_rec
						};
						if !rec.ack_received[usize::from(member)] {
							rec.ack_received[usize::from(member)] = true;
							rec.ack_count += 1;
						}
						if rec.dest_count == rec.ack_count {
							self.terminate_trans(priority);
						}
					}
				}
			}
			AddrMode::MulticastAck => {}
		}

		self.tsa.in_q.dequeue();

		let rec = if priority { &mut self.tsa.pri_xmit_rec } else { &mut self.tsa.xmit_rec };
		if rec.owner != TxOwner::Unused {
			let value = rec.xmit_timer_value;
			rec.xmit_timer.set(&*self.clock, value);
		}
	}

	/// Source-address checks shared by ack and response matching.
	fn ack_matches_record(&self, rec: &TransmitRecord, param: &TsaReceiveParam) -> bool {
		match rec.dest.dest {
			Destination::SubnetNode { subnet, node } => {
				param.src.subnet == subnet && param.src.node == node
			}
			Destination::Multicast { group } => match param.src.dest {
				ReceiveDest::MulticastAck { group: g, .. } => g == group,
				_ => false,
			},
			Destination::Broadcast { subnet } => {
				// Unconfigured nodes ack broadcasts with subnet 0; routers
				// may substitute their own subnet.  Accept those.
				param.src.subnet == 0 || subnet == 0 || subnet == param.src.subnet
			}
			Destination::UniqueId { .. } => true,
			Destination::MulticastAck { .. } => false,
		}
	}

	/// Matches a response against the in-flight request.
	fn sn_receive_response(&mut self) {
		let Some(param) = self.tsa.in_q.front().cloned() else { return };
		let priority = param.priority;
		let Some((tid, hdr_len)) = parse_tid(&param.pdu, param.version) else {
			self.tsa.in_q.dequeue();
			return;
		};

		if !self.tcs.get(priority).validate(tid) {
			self.tsa.in_q.dequeue();
			self.stats.increment(Stat::LateAck);
			return;
		}

		let rec = if priority { &self.tsa.pri_xmit_rec } else { &self.tsa.xmit_rec };
		if rec.owner != TxOwner::Session
			|| rec.dest.domain.index != param.src.domain.index
			|| !self.response_matches_record(rec, &param)
		{
			self.tsa.in_q.dequeue();
			self.stats.increment(Stat::LateAck);
			return;
		}

		// The response event needs a completion-queue slot; wait if full.
		if self.app.ce_rsp_q.is_full() {
			return;
		}

		let tag = rec.tag;
		let message = IncomingMessage {
			src: param.src,
			service: Service::Response,
			priority,
			alt_path: param.alt_path,
			auth: false,
			req_id: 0,
			tag,
			apdu: param.pdu[hdr_len..].to_vec(),
		};

		match rec.dest.dest.mode() {
			AddrMode::Broadcast => {
				let max_responses = rec.max_responses;
				let rec = if priority {
					&mut self.tsa.pri_xmit_rec
				} else {
					&mut self.tsa.xmit_rec
				};
				if rec.ack_count < max_responses {
					rec.ack_count += 1;
					let reached = rec.ack_count == max_responses;
					let _ = self.app.ce_rsp_q.enqueue(AppEvent::Message(message));
					if reached {
						self.terminate_trans(priority);
					}
				}
			}
			AddrMode::SubnetNode | AddrMode::UniqueId => {
				let rec = if priority {
					&mut self.tsa.pri_xmit_rec
				} else {
					&mut self.tsa.xmit_rec
				};
				if rec.ack_count == 0 {
					rec.ack_count += 1;
					let _ = self.app.ce_rsp_q.enqueue(AppEvent::Message(message));
					self.terminate_trans(priority);
				}
			}
			AddrMode::Multicast => {
				if let ReceiveDest::MulticastAck { member, .. } = param.src.dest {
					if usize::from(member) > MAX_GROUP_MEMBER {
						log::debug!("sn_receive_response: invalid member number");
					} else {
						let rec = if priority {
							&mut self.tsa.pri_xmit_rec
						} else {
							&mut self.tsa.xmit_rec
						};
						if !rec.ack_received[usize::from(member)] {
							rec.ack_received[usize::from(member)] = true;
							rec.ack_count += 1;
							let _ = self.app.ce_rsp_q.enqueue(AppEvent::Message(message));
						}
						let rec = if priority {
							&self.tsa.pri_xmit_rec
						} else {
							&self.tsa.xmit_rec
						};
						if rec.dest_count == rec.ack_count {
							self.terminate_trans(priority);
						}
					}
				}
			}
			AddrMode::MulticastAck => {}
		}

		self.tsa.in_q.dequeue();

		let rec = if priority { &mut self.tsa.pri_xmit_rec } else { &mut self.tsa.xmit_rec };
		if rec.owner != TxOwner::Unused {
			let value = rec.xmit_timer_value;
			rec.xmit_timer.set(&*self.clock, value);
		}
	}

	fn response_matches_record(&self, rec: &TransmitRecord, param: &TsaReceiveParam) -> bool {
		match rec.dest.dest {
			Destination::SubnetNode { subnet, node } => {
				param.src.subnet == subnet && param.src.node == node
			}
			Destination::Multicast { group } => match param.src.dest {
				ReceiveDest::MulticastAck { group: g, .. } => g == group,
				_ => false,
			},
			// Responses to broadcasts may come from unconfigured nodes or
			// through routers; skip the subnet test entirely.
			Destination::Broadcast { .. } | Destination::UniqueId { .. } => true,
			Destination::MulticastAck { .. } => false,
		}
	}

	/// Admits a new ACKD / UnackRpt / Request message: allocate or re-use
	/// the receive record, authenticate if demanded, deliver, and answer.
	fn receive_new_msg(&mut self, layer: Layer) {
		let Some(param) = self.tsa.in_q.front().cloned() else { return };
		let Some((tid, hdr_len)) = parse_tid(&param.pdu, param.version) else {
			self.tsa.in_q.dequeue();
			return;
		};
		let apdu = &param.pdu[hdr_len..];
		let msg_type = param.pdu[0] >> 4 & 0x07;

		let existing = self.retrieve_rr(&param.src, param.priority);
		let (index, init) = match existing {
			None => match self.allocate_rr() {
				None => {
					self.stats.increment(Stat::RxTxFull);
					log::debug!("receive_new_msg: no receive record available");
					self.tsa.in_q.dequeue();
					return;
				}
				Some(index) => (index, true),
			},
			Some(index) => {
				let rr = &self.tsa.recv_recs[index];
				if rr.tid != tid || rr.owner != layer.rr_owner() || rr.apdu != apdu {
					// A differing transaction from the same source evicts
					// the old record.
					if !matches!(
						rr.state,
						TransState::Delivered | TransState::Done | TransState::Responded
					) {
						self.stats.increment(Stat::Lost);
					}
					(index, true)
				} else {
					(index, false)
				}
			}
		};

		if init {
			let service = match layer {
				Layer::Transport => {
					if msg_type == TP_ACKD {
						Service::Acknowledged
					} else {
						Service::Repeated
					}
				}
				Layer::Session => Service::Request,
			};
			let req_id = match layer {
				Layer::Transport => 0,
				Layer::Session => self.next_req_id(),
			};
			let recv_timer_ms = self.compute_recv_timer(&param.src);
			let rr = &mut self.tsa.recv_recs[index];
			rr.owner = layer.rr_owner();
			rr.src = param.src;
			rr.tid = tid;
			rr.state = TransState::JustReceived;
			rr.priority = param.priority;
			rr.alt_path = param.alt_path;
			rr.version = param.version;
			rr.auth_ok = false;
			rr.req_id = req_id;
			rr.service = service;
			rr.apdu = apdu.to_vec();
			rr.response.clear();
			rr.recv_timer.set(&*self.clock, recv_timer_ms);
		} else {
			// Keep acks and challenges on the path the latest copy used.
			self.tsa.recv_recs[index].alt_path |= param.alt_path;
		}

		self.tsa.in_q.dequeue();

		let need_auth = self.node.configured() && param.pdu[0] & 0x80 != 0;
		self.tsa.recv_recs[index].need_auth = need_auth;

		let state = self.tsa.recv_recs[index].state;
		if need_auth
			&& (state == TransState::JustReceived || state == TransState::Authenticating)
		{
			self.initiate_challenge(index);
			return;
		}

		if !matches!(
			state,
			TransState::Delivered | TransState::Responded | TransState::Done
		) {
			self.deliver(index);
		}

		let rr = &self.tsa.recv_recs[index];
		match layer {
			Layer::Transport => {
				if rr.state == TransState::Delivered && rr.service == Service::Acknowledged {
					self.tp_send_ack(index);
				}
			}
			Layer::Session => {
				if rr.state == TransState::Responded {
					// A duplicate of a request we already answered;
					// re-emit the saved response.
					self.sn_send_response(index, false, false);
				}
			}
		}
	}

	/// Handles REMINDER and REM/MSG packets.
	fn receive_rem(&mut self, layer: Layer) {
		let Some(param) = self.tsa.in_q.front().cloned() else { return };
		let Some((tid, hdr_len)) = parse_tid(&param.pdu, param.version) else {
			self.tsa.in_q.dequeue();
			return;
		};
		let msg_type = param.pdu[0] >> 4 & 0x07;
		let is_reminder = msg_type == TS_REMINDER;
		let Some(&mlist_len) = param.pdu.get(hdr_len) else {
			self.tsa.in_q.dequeue();
			return;
		};
		let mlist_end = hdr_len + 1 + usize::from(mlist_len);
		if param.pdu.len() < mlist_end {
			self.tsa.in_q.dequeue();
			return;
		}
		let mlist = &param.pdu[hdr_len + 1..mlist_end];
		let apdu: Option<&[u8]> = if is_reminder { None } else { Some(&param.pdu[mlist_end..]) };

		let mut index = self.retrieve_rr(&param.src, param.priority);

		if index.is_none() && is_reminder {
			// An unsolicited reminder refers to nothing we know.
			self.tsa.in_q.dequeue();
			return;
		}

		if let Some(i) = index {
			let rr = &mut self.tsa.recv_recs[i];
			let mismatch = rr.src.mode() != AddrMode::Multicast
				|| rr.tid != tid
				|| rr.owner != layer.rr_owner()
				|| apdu.is_some_and(|a| a != rr.apdu);
			if mismatch {
				if is_reminder {
					self.tsa.in_q.dequeue();
					return;
				}
				// A REM/MSG that does not line up is a fresh admission.
				if rr.state == TransState::Delivered || rr.state == TransState::Done {
					rr.owner = RrOwner::Unused;
				}
				index = None;
			}
		}

		if let Some(i) = index
			&& self.tsa.recv_recs[i].service == Service::Repeated
		{
			if is_reminder {
				self.tsa.in_q.dequeue();
				return;
			}
			index = None;
		}

		if let Some(i) = index {
			let rr = &self.tsa.recv_recs[i];
			let domain_index = match rr.src.domain.index {
				DomainIndex::Table(t) => t,
				DomainIndex::Flex => {
					self.tsa.in_q.dequeue();
					return;
				}
			};
			let Some(group) = rr.src.group() else {
				self.tsa.in_q.dequeue();
				return;
			};
			let Some(member) = self.node.group_member(domain_index, group) else {
				log::debug!("receive_rem: not a member of group {group}");
				self.tsa.in_q.dequeue();
				return;
			};

			let asked = mlist_len == 0
				|| usize::from(member / 8) >= mlist.len()
				|| mlist[usize::from(member / 8)] & 1 << (member % 8) == 0;
			if asked {
				// Our ack or response never arrived.  A bare reminder is
				// followed by the retry itself, so it alone asks nothing.
				if is_reminder {
					self.tsa.in_q.dequeue();
					return;
				}
				let rr = &self.tsa.recv_recs[i];
				if rr.need_auth
					&& (rr.state == TransState::JustReceived
						|| rr.state == TransState::Authenticating)
				{
					self.initiate_challenge(i);
					self.tsa.in_q.dequeue();
					return;
				}
				if !matches!(
					self.tsa.recv_recs[i].state,
					TransState::Delivered | TransState::Responded | TransState::Done
				) {
					self.deliver(i);
				}
				let state = self.tsa.recv_recs[i].state;
				if state == TransState::Delivered || state == TransState::Responded {
					self.tsa.in_q.dequeue();
					match layer {
						Layer::Transport => self.tp_send_ack(i),
						Layer::Session => {
							if state == TransState::Responded {
								self.sn_send_response(i, false, false);
							}
						}
					}
				} else {
					self.tsa.in_q.dequeue();
				}
			} else {
				// Our bit is set: the sender has heard us.
				let rr = &mut self.tsa.recv_recs[i];
				if rr.state == TransState::Delivered || rr.state == TransState::Responded {
					rr.state = TransState::Done;
				}
				self.tsa.in_q.dequeue();
			}
			return;
		}

		// A REM/MSG with no matching record is a fresh admission.
		let Some(apdu) = apdu else {
			self.tsa.in_q.dequeue();
			return;
		};
		let Some(i) = self.allocate_rr() else {
			return;
		};
		let service = match layer {
			Layer::Transport => Service::Acknowledged,
			Layer::Session => Service::Request,
		};
		let req_id = match layer {
			Layer::Transport => 0,
			Layer::Session => self.next_req_id(),
		};
		let recv_timer_ms = self.compute_recv_timer(&param.src);
		let need_auth = param.pdu[0] & 0x80 != 0;
		{
			let rr = &mut self.tsa.recv_recs[i];
			rr.owner = layer.rr_owner();
			rr.src = param.src;
			rr.tid = tid;
			rr.state = TransState::JustReceived;
			rr.priority = param.priority;
			rr.alt_path = param.alt_path;
			rr.version = param.version;
			rr.auth_ok = false;
			rr.req_id = req_id;
			rr.service = service;
			rr.apdu = apdu.to_vec();
			rr.response.clear();
			rr.recv_timer.set(&*self.clock, recv_timer_ms);
			rr.need_auth = need_auth;
		}
		self.tsa.in_q.dequeue();

		if need_auth {
			self.initiate_challenge(i);
			return;
		}
		self.deliver(i);
		if layer == Layer::Transport && self.tsa.recv_recs[i].state == TransState::Delivered {
			self.tp_send_ack(i);
		}
	}

	/// Hands the message in receive record `index` to the application.
	fn deliver(&mut self, index: usize) {
		let rr = &self.tsa.recv_recs[index];
		if rr.need_auth && rr.state != TransState::Authenticated {
			// Authentication was demanded but never completed.
			self.tsa.recv_recs[index].state = TransState::Done;
			return;
		}
		if self.app.in_q.is_full() {
			// Dropping preserves in-order delivery; the peer's retry will
			// come back around.
			self.stats.increment(Stat::Lost);
			log::debug!("deliver: application queue full");
			return;
		}
		if rr.apdu.len() > self.app.in_buf_size {
			self.record_error(SystemError::WritePastEndOfApplBuffer);
			return;
		}
		let rr = &self.tsa.recv_recs[index];
		let message = IncomingMessage {
			src: rr.src,
			service: rr.service,
			priority: rr.priority,
			alt_path: rr.alt_path,
			auth: rr.auth_ok,
			req_id: rr.req_id,
			tag: 0,
			apdu: rr.apdu.clone(),
		};
		let _ = self.app.in_q.enqueue(message);
		self.tsa.recv_recs[index].state = TransState::Delivered;
	}

	/// Synthesizes the ACK for an acknowledged message: subnet-node
	/// addressed for unicast originals, multicast-ack with our member
	/// number for group originals.
	fn tp_send_ack(&mut self, index: usize) {
		let rr = &self.tsa.recv_recs[index];
		let priority = rr.priority;
		let q_full = if priority { self.net.out_pri_q.is_full() } else { self.net.out_q.is_full() };
		if q_full {
			return;
		}

		let Some(dest) = self.reply_destination(index) else { return };
		let rr = &self.tsa.recv_recs[index];
		let mut pdu = Vec::with_capacity(2);
		push_tspdu_header(&mut pdu, false, TP_ACK, rr.tid, rr.version);
		let param = NwSendParam {
			dest,
			pdu_type: PduType::Tpdu,
			version: rr.version,
			delta_backlog: 0,
			alt_path: rr.alt_path | AltPathFlags::ALT_CHANNEL_LOCK,
			drop_if_unconfigured: false,
			tag: 0,
			pdu,
		};
		let q = if priority { &mut self.net.out_pri_q } else { &mut self.net.out_q };
		let _ = q.enqueue(param);
	}

	/// Emits the stored response for a request, or consumes it silently
	/// for a null response.
	fn sn_send_response(&mut self, index: usize, null_response: bool, flex_response: bool) {
		let rr = &self.tsa.recv_recs[index];
		let priority = rr.priority;
		let q_full = if priority { self.net.out_pri_q.is_full() } else { self.net.out_q.is_full() };
		if q_full && !null_response {
			return;
		}
		if rr.state != TransState::Responded && rr.state != TransState::Done {
			log::debug!("sn_send_response: no response stored yet");
			return;
		}
		if null_response {
			self.tsa.recv_recs[index].state = TransState::Done;
			return;
		}
		if rr.response.len() + 1 > self.net.out_buf_size {
			log::debug!("sn_send_response: response exceeds network buffer");
			return;
		}

		let Some(mut dest) = self.reply_destination(index) else { return };
		if flex_response {
			// Zero source subnet/node on the way out.
			dest.domain.index = DomainIndex::Flex;
		}
		let rr = &self.tsa.recv_recs[index];
		let mut pdu = Vec::with_capacity(2 + rr.response.len());
		push_tspdu_header(&mut pdu, false, SN_RESPONSE, rr.tid, rr.version);
		pdu.extend_from_slice(&rr.response);
		let param = NwSendParam {
			dest,
			pdu_type: PduType::Spdu,
			version: rr.version,
			delta_backlog: 0,
			alt_path: rr.alt_path | AltPathFlags::ALT_CHANNEL_LOCK,
			drop_if_unconfigured: false,
			tag: 0,
			pdu,
		};
		let q = if priority { &mut self.net.out_pri_q } else { &mut self.net.out_q };
		let _ = q.enqueue(param);
	}

	/// Destination for acks, responses and challenges: back to the source,
	/// multicast-ack formatted when the original was multicast.
	fn reply_destination(&self, index: usize) -> Option<DestinationAddress> {
		let rr = &self.tsa.recv_recs[index];
		let domain = rr.src.domain;
		match rr.src.dest {
			ReceiveDest::Multicast { group } => {
				let domain_index = match domain.index {
					DomainIndex::Table(i) => i,
					DomainIndex::Flex => return None,
				};
				let member = self.node.group_member(domain_index, group)?;
				Some(DestinationAddress {
					domain,
					dest: Destination::MulticastAck {
						subnet: rr.src.subnet,
						node: rr.src.node,
						group,
						member,
					},
				})
			}
			_ => Some(DestinationAddress {
				domain,
				dest: Destination::SubnetNode {
					subnet: rr.src.subnet,
					node: rr.src.node,
				},
			}),
		}
	}

	/// Sends (or re-sends) a challenge for receive record `index`.
	fn initiate_challenge(&mut self, index: usize) {
		let priority = self.tsa.recv_recs[index].priority;
		let q_full = if priority { self.net.out_pri_q.is_full() } else { self.net.out_q.is_full() };
		if q_full {
			return;
		}

		// Fresh random bytes only for the first challenge of a message;
		// re-sends repeat the stored ones.
		if self.tsa.recv_recs[index].state != TransState::Authenticating {
			let challenge = self.rng.next_challenge(&*self.clock);
			self.tsa.recv_recs[index].challenge = challenge;
		}

		let Some(dest) = self.reply_destination(index) else { return };
		let rr = &self.tsa.recv_recs[index];
		let format = addr_mode_format(rr.src.mode());
		let msg_type = if self.auth_oma() { AUTH_CHALLENGE_OMA } else { AUTH_CHALLENGE };
		let mut pdu = Vec::with_capacity(11);
		push_authpdu_header(&mut pdu, format, msg_type, rr.tid, rr.version);
		pdu.extend_from_slice(&rr.challenge);
		if let Some(group) = rr.src.group() {
			pdu.push(group);
		}
		let param = NwSendParam {
			dest,
			pdu_type: PduType::AuthPdu,
			version: rr.version,
			delta_backlog: 0,
			alt_path: rr.alt_path | AltPathFlags::ALT_CHANNEL_LOCK,
			drop_if_unconfigured: false,
			tag: 0,
			pdu,
		};
		let q = if priority { &mut self.net.out_pri_q } else { &mut self.net.out_q };
		let _ = q.enqueue(param);
		self.tsa.recv_recs[index].state = TransState::Authenticating;
		log::debug!("auth: challenge sent for record {index}");
	}

	/// Answers a challenge for our own in-flight transaction.
	fn send_reply_to_challenge(&mut self, use_oma: bool) {
		let Some(param) = self.tsa.in_q.front().cloned() else { return };
		let priority = param.priority;
		let Some((tid, hdr_len)) = parse_tid(&param.pdu, param.version) else {
			self.tsa.in_q.dequeue();
			return;
		};
		if param.pdu.len() < hdr_len + 8 {
			self.tsa.in_q.dequeue();
			return;
		}
		let mut rand = [0u8; 8];
		rand.copy_from_slice(&param.pdu[hdr_len..hdr_len + 8]);
		let format = param.pdu[0] >> 6 & 0x03;
		let challenge_group = param.pdu.get(hdr_len + 8).copied();

		// Challenges are never issued on a flex domain.
		if param.src.domain.index == DomainIndex::Flex {
			self.tsa.in_q.dequeue();
			return;
		}

		let rec = if priority { &self.tsa.pri_xmit_rec } else { &self.tsa.xmit_rec };
		let group_mismatch = format == 1
			&& match rec.dest.dest {
				Destination::Multicast { group } => challenge_group != Some(group),
				_ => true,
			};
		if rec.owner == TxOwner::Unused
			|| !rec.auth
			|| tid != rec.tid
			|| rec.dest.dest.mode().format() as u8 != format
			|| group_mismatch
		{
			self.tsa.in_q.dequeue();
			self.stats.increment(Stat::LateAck);
			return;
		}

		let q_full = if priority { self.net.out_pri_q.is_full() } else { self.net.out_q.is_full() };
		if q_full {
			return;
		}

		// Key material: the submission's alternate key, or the domain
		// table (both slots, starting at the challenge's domain for
		// classic, at 0 for OMA).
		let key = match rec.alt_key {
			Some(alt) => alt.key,
			None => {
				let mut key = [[0u8; AUTH_KEY_LEN]; 2];
				let mut table_index = if use_oma {
					0
				} else {
					match param.src.domain.index {
						DomainIndex::Table(i) => i,
						DomainIndex::Flex => 0,
					}
				};
				for slot in &mut key {
					if let Some(entry) = self.node.domain_table.get(usize::from(table_index)) {
						*slot = entry.key;
					}
					table_index += 1;
				}
				key
			}
		};
		let mut flat_key = [0u8; AUTH_KEY_LEN * 2];
		flat_key[..AUTH_KEY_LEN].copy_from_slice(&key[0]);
		flat_key[AUTH_KEY_LEN..].copy_from_slice(&key[1]);

		let oma_dest = challenge_oma_address(&self.node, &rec.dest);
		let crypto = encrypt(
			&rand,
			&rec.apdu,
			&flat_key,
			use_oma.then_some(&oma_dest),
		);

		let msg_type = if use_oma { AUTH_REPLY_OMA } else { AUTH_REPLY };
		let version = rec.version;
		let rec_tid = rec.tid;
		let rec_dest = rec.dest;
		let mut pdu = Vec::with_capacity(11);
		push_authpdu_header(&mut pdu, format, msg_type, rec_tid, version);
		pdu.extend_from_slice(&crypto);
		if format == 1
			&& let Some(group) = challenge_group
		{
			pdu.push(group);
		}

		// Reply subnet-node addressed to the challenger, unless the
		// challenge came from node 0 of a unique-ID-addressed original.
		let dest = if param.src.node == 0 && format == 3 {
			DestinationAddress {
				domain: param.src.domain,
				dest: rec_dest.dest,
			}
		} else {
			DestinationAddress {
				domain: param.src.domain,
				dest: Destination::SubnetNode {
					subnet: param.src.subnet,
					node: param.src.node,
				},
			}
		};

		let nw_param = NwSendParam {
			dest,
			pdu_type: PduType::AuthPdu,
			version,
			delta_backlog: 0,
			alt_path: param.alt_path | AltPathFlags::ALT_CHANNEL_LOCK,
			drop_if_unconfigured: false,
			tag: 0,
			pdu,
		};
		let q = if priority { &mut self.net.out_pri_q } else { &mut self.net.out_q };
		let _ = q.enqueue(nw_param);
		self.tsa.in_q.dequeue();
		log::debug!("auth: reply sent for tid {rec_tid}");

		let rec = if priority { &mut self.tsa.pri_xmit_rec } else { &mut self.tsa.xmit_rec };
		let value = rec.xmit_timer_value;
		rec.xmit_timer.set(&*self.clock, value);
	}

	/// Verifies a reply against the challenge we issued.
	fn process_reply(&mut self, use_oma: bool) {
		let Some(param) = self.tsa.in_q.front().cloned() else { return };
		let Some((tid, hdr_len)) = parse_tid(&param.pdu, param.version) else {
			self.tsa.in_q.dequeue();
			return;
		};
		if param.pdu.len() < hdr_len + 8 {
			self.tsa.in_q.dequeue();
			return;
		}
		let mut crypto = [0u8; 8];
		crypto.copy_from_slice(&param.pdu[hdr_len..hdr_len + 8]);
		let format = param.pdu[0] >> 6 & 0x03;
		let reply_group = param.pdu.get(hdr_len + 8).copied();

		// The reply names the original address format; rebuild the
		// receive-record key from it before searching.
		let mut lookup = param.src;
		lookup.dest = match format {
			0 => ReceiveDest::Broadcast { subnet: 0 },
			1 => match reply_group {
				Some(group) => ReceiveDest::Multicast { group },
				None => {
					self.tsa.in_q.dequeue();
					return;
				}
			},
			2 => ReceiveDest::SubnetNode,
			_ => ReceiveDest::UniqueId,
		};

		let Some(index) = self.retrieve_rr(&lookup, param.priority) else {
			self.tsa.in_q.dequeue();
			self.stats.increment(Stat::LateAck);
			return;
		};

		let rr = &self.tsa.recv_recs[index];
		if rr.state != TransState::Authenticating {
			// Probably a duplicate reply.
			self.tsa.in_q.dequeue();
			return;
		}
		if format == 1 && rr.src.group() != reply_group {
			self.tsa.in_q.dequeue();
			return;
		}
		if tid != rr.tid {
			self.tsa.in_q.dequeue();
			return;
		}

		// Recompute the hash with our stored challenge and APDU.
		let mut flat_key = [0u8; AUTH_KEY_LEN * 2];
		if use_oma {
			flat_key[..AUTH_KEY_LEN].copy_from_slice(&self.node.domain_table[0].key);
			flat_key[AUTH_KEY_LEN..].copy_from_slice(&self.node.domain_table[1].key);
		} else {
			let table_index = match rr.src.domain.index {
				DomainIndex::Table(i) => i,
				// Flex-domain classic authentication uses the first
				// configured domain's key.
				DomainIndex::Flex => u8::from(self.node.domain_table[0].invalid),
			};
			if let Some(entry) = self.node.domain_table.get(usize::from(table_index)) {
				flat_key[..AUTH_KEY_LEN].copy_from_slice(&entry.key);
			}
		}
		let key_len = if use_oma { AUTH_KEY_LEN * 2 } else { AUTH_KEY_LEN };
		let oma_addr = reply_oma_address(&self.node, &rr.src, format, reply_group);
		let expected = encrypt(
			&rr.challenge,
			&rr.apdu,
			&flat_key[..key_len],
			use_oma.then_some(&oma_addr),
		);

		let auth_ok = expected == crypto;
		if !auth_ok {
			self.record_error(SystemError::AuthenticationMismatch);
		}
		let rr = &mut self.tsa.recv_recs[index];
		rr.auth_ok = auth_ok;
		rr.state = TransState::Authenticated;

		self.deliver(index);

		let rr = &self.tsa.recv_recs[index];
		if rr.owner == RrOwner::Transport
			&& rr.service == Service::Acknowledged
			&& rr.state == TransState::Delivered
		{
			self.tp_send_ack(index);
		}

		self.tsa.in_q.dequeue();
	}

	/// True when either transmit record carries a multicast transaction to
	/// `group`; used by the network filter to admit group acks addressed
	/// to a non-member sender.
	pub(crate) fn tsa_group_in_flight(&self, group: u8) -> bool {
		[&self.tsa.xmit_rec, &self.tsa.pri_xmit_rec].iter().any(|rec| {
			rec.owner != TxOwner::Unused
				&& matches!(rec.dest.dest, Destination::Multicast { group: g } if g == group)
		})
	}

	/// Finds the receive record keyed by source and priority.
	fn retrieve_rr(&self, src: &SourceAddress, priority: bool) -> Option<usize> {
		self.tsa.recv_recs.iter().position(|rr| {
			rr.owner != RrOwner::Unused
				&& rr.priority == priority
				&& rr.src.same_transaction_key(src)
		})
	}

	fn allocate_rr(&self) -> Option<usize> {
		self.tsa
			.recv_recs
			.iter()
			.position(|rr| rr.owner == RrOwner::Unused)
	}

	/// Finds the session receive record for a delivered request by its id.
	fn find_rr(&self, req_id: u16) -> Option<usize> {
		let index = self
			.tsa
			.recv_recs
			.iter()
			.position(|rr| rr.owner == RrOwner::Session && rr.req_id == req_id)?;
		let rr = &self.tsa.recv_recs[index];
		(rr.service == Service::Request && rr.state == TransState::Delivered).then_some(index)
	}

	fn next_req_id(&mut self) -> u16 {
		// 0 is reserved so a stale response can never match.
		if self.tsa.req_id == 0 {
			self.tsa.req_id = 1;
		}
		let id = self.tsa.req_id;
		self.tsa.req_id = self.tsa.req_id.wrapping_add(1);
		id
	}

	/// Receive-timer value for an inbound transaction: fixed for unique-ID
	/// addressing, the group maximum for multicast, the node default
	/// otherwise.
	fn compute_recv_timer(&self, src: &SourceAddress) -> u16 {
		match src.dest {
			ReceiveDest::UniqueId => UNIQUE_ID_RECV_TIMER_MS,
			ReceiveDest::Multicast { group } => self.node.group_receive_timer_ms(group),
			_ => self.node.non_group_receive_timer_ms(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tspdu_header_legacy_layout() {
		let mut pdu = Vec::new();
		push_tspdu_header(&mut pdu, true, TP_ACKD, 7, ProtocolVersion::Legacy);
		assert_eq!(pdu, [0x87]);
		assert_eq!(parse_tid(&pdu, ProtocolVersion::Legacy), Some((7, 1)));
	}

	#[test]
	fn tspdu_header_enhanced_carries_twelve_bits() {
		let mut pdu = Vec::new();
		push_tspdu_header(&mut pdu, false, TP_ACK, 0x0ABC, ProtocolVersion::Enhanced);
		assert_eq!(pdu, [0x2A, 0xBC]);
		assert_eq!(parse_tid(&pdu, ProtocolVersion::Enhanced), Some((0x0ABC, 2)));
	}

	#[test]
	fn authpdu_header_layout() {
		let mut pdu = Vec::new();
		push_authpdu_header(&mut pdu, 1, AUTH_REPLY_OMA, 4, ProtocolVersion::Legacy);
		assert_eq!(pdu, [0x40 | 0x30 | 0x04]);
	}

	#[test]
	fn enhanced_tid_maximum() {
		assert_eq!(ProtocolVersion::Legacy.max_tid(), 15);
		assert_eq!(ProtocolVersion::Enhanced.max_tid(), 4095);
		let mut pdu = Vec::new();
		push_tspdu_header(&mut pdu, false, TP_ACKD, 4095, ProtocolVersion::Enhanced);
		assert_eq!(parse_tid(&pdu, ProtocolVersion::Enhanced), Some((4095, 2)));
	}
}
