//! Network-interface control-block framing.
//!
//! Every exchange with the USB network interface is a control block:
//! a 1-byte command, a 1-byte length, and `length` bytes of PDU.  The
//! interface performs CRC generation and checking on the wire side.

use alloc::vec;
use alloc::vec::Vec;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::config::LOCAL_NM_TAG;

/// Network-interface command codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NiCommand {
	/// Host → interface: emit this LPDU on the wire.
	OutgoingL2 = 0x12,
	/// Interface → host: response to a local NM command.
	Response = 0x16,
	/// Raw layer-2 ingress (mode 0).
	IncomingL2 = 0x1A,
	/// Mode-1 ingress.
	IncomingL2M1 = 0x1B,
	/// Mode-2 ingress; the normal receive path.
	IncomingL2M2 = 0x1C,
	/// Local network-management command.
	LocalNm = 0x22,
	/// Framing/CRC error report.
	Error = 0x30,
	/// Phase-mode announcement.
	Phase = 0x40,
	/// Interface reset.
	Reset = 0x50,
	/// Phase configuration.
	PhaseSet = 0xC0,
	/// Set layer-5 mode.
	ModeL5 = 0xD0,
	/// Set layer-2 mode.
	ModeL2 = 0xD1,
}

/// The error command is a family; the low nibble carries detail.
pub fn is_error_command(cmd: u8) -> bool {
	cmd & 0xF0 == u8::from(NiCommand::Error) & 0xF0
}

/// Network management read-memory request, read-only-relative mode.
pub const NM_READ_MEMORY: u8 = 0x6D;
/// Network diagnostics transceiver-status query.
pub const ND_QUERY_XCVR: u8 = 0x54;
/// Address-mode byte selecting read-only-relative memory reads.
pub const READ_ONLY_RELATIVE: u8 = 0x01;

/// Success response code for a network-management request
/// (`0x20 | code & 0x1F`).
pub fn nm_resp_success(request: u8) -> u8 {
	0x20 | request & 0x1F
}

/// Success response code for a network-diagnostic request
/// (`0x30 | code & 0x0F`).
pub fn nd_resp_success(request: u8) -> u8 {
	0x30 | request & 0x0F
}

/// One control block exchanged with the network interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L2Frame {
	pub cmd: u8,
	pub pdu: Vec<u8>,
}

impl L2Frame {
	pub fn new(cmd: u8, pdu: Vec<u8>) -> Self {
		Self { cmd, pdu }
	}

	/// Serializes to the `{cmd, length, pdu}` wire layout.
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(2 + self.pdu.len());
		out.push(self.cmd);
		out.push(self.pdu.len() as u8);
		out.extend_from_slice(&self.pdu);
		out
	}

	pub fn decode(bytes: &[u8]) -> Option<Self> {
		let (&cmd, rest) = bytes.split_first()?;
		let (&len, pdu) = rest.split_first()?;
		if pdu.len() < usize::from(len) {
			return None;
		}
		Some(Self {
			cmd,
			pdu: pdu[..usize::from(len)].to_vec(),
		})
	}

	/// True for local-NM responses carrying our reserved tag.
	pub fn is_local_response(&self, response_code: u8) -> bool {
		self.cmd == u8::from(NiCommand::Response)
			&& self.pdu.first().is_some_and(|b| b & 0x0F == LOCAL_NM_TAG)
			&& self.pdu.get(14) == Some(&response_code)
	}
}

/// Builds a local network-management request control block: the reserved
/// tag, a zeroed 11-byte address block, then the opcode and its arguments.
pub fn local_nm_request(opcode: u8, args: &[u8]) -> L2Frame {
	let msg_len = 1 + args.len();
	let mut pdu = vec![0u8; 14 + msg_len];
	pdu[0] = 0x70 | LOCAL_NM_TAG;
	pdu[2] = msg_len as u8;
	pdu[14] = opcode;
	pdu[15..].copy_from_slice(args);
	L2Frame::new(NiCommand::LocalNm.into(), pdu)
}

/// CRC-16/CCITT over `data`, as appended to LPDUs by interfaces that leave
/// CRC generation to the host.
pub fn crc16(data: &[u8]) -> [u8; 2] {
	let poly: u16 = 0x1021;
	let mut crc: u16 = 0xFFFF;
	for &byte in data {
		let mut byte = byte;
		for _ in 0..8 {
			let crc_bit = crc & 0x8000 != 0;
			let data_bit = byte & 0x80 != 0;
			crc <<= 1;
			if crc_bit != data_bit {
				crc ^= poly;
			}
			byte <<= 1;
		}
	}
	crc ^= 0xFFFF;
	crc.to_be_bytes()
}
