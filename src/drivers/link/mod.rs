//! Link driver for U-series USB network interfaces.
//!
//! Owns the serial link to one or more interfaces and presents the network
//! layer a symmetric pair of packet queues.  The interface does CRC on the
//! wire; this driver frames LPDUs into network-interface control blocks,
//! classifies uplink frames, acquires the node's Unique ID at startup, and
//! samples power-line transceiver parameters.

pub mod frame;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use thiserror::Error;

use crate::collections::PacketQueue;
use crate::config::{NUM_COMM_PARAMS, NW_OUT_PRI_Q_CNT_CODE, NW_OUT_Q_CNT_CODE, UNIQUE_ID_LEN,
	UID_FETCH_INTERVAL_MS, XCVR_FETCH_INTERVAL_MS};
use crate::drivers::link::frame::{
	L2Frame, ND_QUERY_XCVR, NM_READ_MEMORY, NiCommand, READ_ONLY_RELATIVE, is_error_command,
	local_nm_request, nd_resp_success, nm_resp_success,
};
use crate::net::{AltPathFlags, NwReceiveParam};
use crate::node::decode_buffer_cnt;
use crate::stack::Stack;
use crate::stats::Stat;
use crate::time::{Clock, LonTimer};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
	#[error("link i/o failed")]
	Io,
	#[error("link not open")]
	NotOpen,
}

/// One serial USB network interface.
///
/// `read_frame` is non-blocking: it returns `Ok(None)` when no complete
/// control block is pending.  `write_frame` either writes the whole block
/// or fails; a partial write is a failure (the remainder is discarded and
/// counted).
pub trait LinkPort {
	fn name(&self) -> &str;
	/// Power-line interfaces get the UID handshake, transceiver-parameter
	/// sampling, and phase management.
	fn is_power_line(&self) -> bool;
	fn read_frame(&mut self) -> Result<Option<L2Frame>, LinkError>;
	fn write_frame(&mut self, frame: &L2Frame) -> Result<(), LinkError>;
}

/// Adapts a byte-stream serial device (in `embedded-io` terms) into a
/// [`LinkPort`], reassembling `{cmd, length, pdu}` control blocks from the
/// stream.
pub struct SerialLinkPort<T> {
	io: T,
	name: String,
	power_line: bool,
	rx: VecDeque<u8>,
}

impl<T> SerialLinkPort<T> {
	pub fn new(io: T, name: String, power_line: bool) -> Self {
		Self {
			io,
			name,
			power_line,
			rx: VecDeque::new(),
		}
	}
}

impl<T> LinkPort for SerialLinkPort<T>
where
	T: embedded_io::Read + embedded_io::Write + embedded_io::ReadReady,
{
	fn name(&self) -> &str {
		&self.name
	}

	fn is_power_line(&self) -> bool {
		self.power_line
	}

	fn read_frame(&mut self) -> Result<Option<L2Frame>, LinkError> {
		let mut buf = [0u8; 64];
		while self.io.read_ready().map_err(|_| LinkError::Io)? {
			let n = self.io.read(&mut buf).map_err(|_| LinkError::Io)?;
			if n == 0 {
				break;
			}
			self.rx.extend(&buf[..n]);
		}
		if self.rx.len() < 2 {
			return Ok(None);
		}
		let len = usize::from(self.rx[1]);
		if self.rx.len() < 2 + len {
			return Ok(None);
		}
		let cmd = self.rx.pop_front().unwrap();
		self.rx.pop_front();
		let pdu: Vec<u8> = self.rx.drain(..len).collect();
		Ok(Some(L2Frame { cmd, pdu }))
	}

	fn write_frame(&mut self, frame: &L2Frame) -> Result<(), LinkError> {
		self.io
			.write_all(&frame.encode())
			.map_err(|_| LinkError::Io)?;
		self.io.flush().map_err(|_| LinkError::Io)
	}
}

/// One LPDU queued for the wire.
#[derive(Clone, Debug)]
pub struct LkSendParam {
	pub delta_backlog: u8,
	pub alt_path: AltPathFlags,
	pub npdu: Vec<u8>,
}

struct PortState {
	port: Box<dyn LinkPort>,
	have_uid: bool,
	uid_timer: LonTimer,
	fetch_xcvr: bool,
	set_phase: bool,
	xcvr_params: [u8; NUM_COMM_PARAMS],
}

/// Link-layer queues plus per-interface state.
pub(crate) struct LinkDriver {
	ports: Vec<PortState>,
	pub out_q: PacketQueue<LkSendParam>,
	pub out_pri_q: PacketQueue<LkSendParam>,
	xcvr_fetch_timer: LonTimer,
}

impl LinkDriver {
	pub fn new(ports: Vec<Box<dyn LinkPort>>) -> Self {
		let mut driver = Self {
			ports: ports
				.into_iter()
				.map(|port| PortState {
					port,
					have_uid: false,
					uid_timer: LonTimer::new(),
					fetch_xcvr: false,
					set_phase: false,
					xcvr_params: [0; NUM_COMM_PARAMS],
				})
				.collect(),
			out_q: PacketQueue::with_capacity(0),
			out_pri_q: PacketQueue::with_capacity(0),
			xcvr_fetch_timer: LonTimer::new(),
		};
		driver.reset_queues();
		driver
	}

	/// Reallocates the queues and restarts the startup state machines.
	pub fn reset(&mut self, clock: &dyn Clock) {
		self.reset_queues();
		let mut any_power_line = false;
		for state in &mut self.ports {
			if state.port.is_power_line() {
				any_power_line = true;
				state.have_uid = false;
				state.uid_timer.set(clock, UID_FETCH_INTERVAL_MS);
				state.fetch_xcvr = false;
				state.set_phase = true;
			}
		}
		if any_power_line {
			self.xcvr_fetch_timer
				.set_repeating(clock, XCVR_FETCH_INTERVAL_MS, XCVR_FETCH_INTERVAL_MS);
		}
	}

	fn reset_queues(&mut self) {
		self.out_q =
			PacketQueue::with_capacity(decode_buffer_cnt(NW_OUT_Q_CNT_CODE).into());
		self.out_pri_q =
			PacketQueue::with_capacity(decode_buffer_cnt(NW_OUT_PRI_Q_CNT_CODE).into());
	}

	/// True once every power-line interface has reported the Unique ID (or
	/// there is none to ask).
	pub fn unique_id_acquired(&self) -> bool {
		self.ports
			.iter()
			.all(|state| !state.port.is_power_line() || state.have_uid)
	}

	/// Stored transceiver parameters for interface `index`.
	pub fn xcvr_params(&self, index: usize) -> Option<&[u8; NUM_COMM_PARAMS]> {
		self.ports.get(index).map(|state| &state.xcvr_params)
	}

	/// Queues one NPDU for the wire.  The caller has already checked the
	/// queue for space.
	pub fn submit_lpdu(
		&mut self,
		priority: bool,
		delta_backlog: u8,
		alt_path: AltPathFlags,
		npdu: &[u8],
	) {
		let param = LkSendParam {
			delta_backlog,
			alt_path,
			npdu: npdu.to_vec(),
		};
		let q = if priority { &mut self.out_pri_q } else { &mut self.out_q };
		if q.enqueue(param).is_err() {
			log::error!("link queue overflow despite caller check");
		}
	}
}

impl Stack {
	/// Link send step: service the power-line housekeeping (transceiver
	/// sampling, phase set, UID fetch), then move one LPDU to the wire,
	/// priority queue first.
	pub(crate) fn lk_send(&mut self) {
		let fetch_expired = self.link.xcvr_fetch_timer.expired(&*self.clock);
		for state in &mut self.link.ports {
			if !state.port.is_power_line() {
				continue;
			}
			if state.fetch_xcvr || fetch_expired {
				let query = local_nm_request(ND_QUERY_XCVR, &[]);
				// On write failure leave the flag set and retry next tick.
				state.fetch_xcvr = state.port.write_frame(&query).is_err();
			}
			if state.set_phase {
				let phase = L2Frame::new(u8::from(NiCommand::PhaseSet) | 2, Vec::new());
				state.set_phase = state.port.write_frame(&phase).is_err();
			}
			if !state.have_uid && state.uid_timer.expired(&*self.clock) {
				let request = local_nm_request(
					NM_READ_MEMORY,
					&[READ_ONLY_RELATIVE, 0, 0, UNIQUE_ID_LEN as u8],
				);
				if state.port.write_frame(&request).is_err() {
					log::debug!("{}: unique id request failed", state.port.name());
				}
				state.uid_timer.set(&*self.clock, UID_FETCH_INTERVAL_MS);
			}
		}

		let (priority, param) = if !self.link.out_pri_q.is_empty() {
			(true, self.link.out_pri_q.dequeue().unwrap())
		} else if !self.link.out_q.is_empty() {
			(false, self.link.out_q.dequeue().unwrap())
		} else {
			return;
		};

		let header = u8::from(priority) << 7
			| u8::from(param.alt_path.contains(AltPathFlags::ALT_PATH)) << 6
			| param.delta_backlog & 0x3F;
		let mut pdu = Vec::with_capacity(1 + param.npdu.len());
		pdu.push(header);
		pdu.extend_from_slice(&param.npdu);
		let block = L2Frame::new(NiCommand::OutgoingL2.into(), pdu);

		for state in &mut self.link.ports {
			if state.port.write_frame(&block).is_err() {
				self.stats.increment(Stat::TxFailure);
			}
		}
	}

	/// Link receive step: read at most one frame from the first interface
	/// with data, classify it, and hand valid L2 packets upward.
	pub(crate) fn lk_receive(&mut self) {
		let mut found = None;
		for (index, state) in self.link.ports.iter_mut().enumerate() {
			match state.port.read_frame() {
				Ok(Some(frame)) => {
					found = Some((index, frame));
					break;
				}
				Ok(None) => {}
				Err(err) => log::debug!("{}: read failed: {err}", state.port.name()),
			}
		}
		let Some((index, frame)) = found else {
			return;
		};
		let state = &mut self.link.ports[index];
		let power_line = state.port.is_power_line();

		// Transceiver-status responses are stored locally, never forwarded.
		if power_line && frame.is_local_response(nd_resp_success(ND_QUERY_XCVR)) {
			let n = NUM_COMM_PARAMS.min(frame.pdu.len().saturating_sub(15));
			state.xcvr_params[..n].copy_from_slice(&frame.pdu[15..15 + n]);
			return;
		}

		// Unique ID handshake response.
		if power_line
			&& !state.have_uid
			&& frame.is_local_response(nm_resp_success(NM_READ_MEMORY))
			&& frame.pdu.len() >= 15 + UNIQUE_ID_LEN
		{
			self.node
				.read_only
				.unique_id
				.copy_from_slice(&frame.pdu[15..15 + UNIQUE_ID_LEN]);
			state.have_uid = true;
			state.uid_timer.stop();
			state.fetch_xcvr = true;
			log::info!(
				"{}: unique id {:02x?}",
				state.port.name(),
				self.node.read_only.unique_id
			);
			return;
		}

		// A mode-2 interface reports a wire CRC failure as a short packet.
		let lpdu_size = frame.pdu.len().saturating_sub(3);
		let incoming_l2m2 = frame.cmd == u8::from(NiCommand::IncomingL2M2);
		if (incoming_l2m2 && lpdu_size < 8) || is_error_command(frame.cmd) {
			self.stats.increment(Stat::TxError);
			return;
		}
		if !incoming_l2m2 {
			if power_line
				&& (frame.cmd == u8::from(NiCommand::Reset)
					|| frame.cmd == u8::from(NiCommand::IncomingL2)
					|| frame.cmd == u8::from(NiCommand::IncomingL2M1))
			{
				// The interface lost its phase setting.
				state.set_phase = true;
			}
			return;
		}

		if power_line {
			// Splice the packet-specific register bytes from the frame tail.
			let len = frame.pdu.len();
			state.xcvr_params[2] = frame.pdu[len - 2];
			state.xcvr_params[3] = frame.pdu[len - 1];
			state.xcvr_params[4] = frame.pdu[len - 1];
		}

		// CRC was checked by the interface; this is a valid L2 packet.
		self.stats.increment(Stat::L2Rx);

		if frame.pdu[0] != u8::from(NiCommand::LocalNm) {
			self.stats.increment(Stat::Missed);
			return;
		}
		if lpdu_size < 8 {
			self.stats.increment(Stat::RxError);
			return;
		}

		let header = frame.pdu[1];
		let npdu_len = lpdu_size - 3;
		let npdu = &frame.pdu[2..2 + npdu_len];
		if self.net.in_q.is_full() {
			self.stats.increment(Stat::Missed);
			return;
		}
		if npdu_len > self.net.in_buf_size {
			log::warn!("lk_receive: npdu larger than network buffer");
			return;
		}
		let mut alt_path = AltPathFlags::empty();
		if header & 0x40 != 0 {
			alt_path |= AltPathFlags::ALT_PATH;
		}
		let _ = self.net.in_q.enqueue(NwReceiveParam {
			priority: header & 0x80 != 0,
			alt_path,
			npdu: npdu.to_vec(),
		});
	}
}
