//! NPDU framing.
//!
//! The fixed header byte packs `{protocol_version[7:6], pdu_type[5:4],
//! address_format[3:2], domain_length[1:0]}`.  All bit fields on the wire
//! are MSB-first; every accessor here is explicit mask+shift.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;
use thiserror::Error;

use crate::config::{DOMAIN_ID_LEN, UNIQUE_ID_LEN};
use crate::net::addr::Destination;

/// PDU type dispatched by the network layer.  The values go on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PduType {
	Tpdu = 0,
	Spdu = 1,
	AuthPdu = 2,
	Apdu = 3,
}

/// Protocol version (2-bit field).  Enhanced mode widens transaction
/// numbers to 12 bits with a continuation byte after the T/S/Auth header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ProtocolVersion {
	#[default]
	Legacy = 0,
	Enhanced = 2,
}

impl ProtocolVersion {
	/// Bytes the transaction number occupies after the header byte's 4-bit
	/// field: 0 in legacy mode, 1 continuation byte in enhanced mode.
	pub fn tid_extra_bytes(self) -> usize {
		match self {
			ProtocolVersion::Legacy => 0,
			ProtocolVersion::Enhanced => 1,
		}
	}

	pub fn max_tid(self) -> u16 {
		match self {
			ProtocolVersion::Legacy => 15,
			ProtocolVersion::Enhanced => 4095,
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NpduError {
	#[error("domain length {0} is not encodable")]
	BadDomainLength(u8),
	#[error("unsupported protocol version {0}")]
	BadVersion(u8),
	#[error("unknown pdu type")]
	BadPduType,
	#[error("truncated npdu")]
	Truncated,
}

/// Encodes a domain length (bytes) into the 2-bit header field.
pub fn encode_domain_length(len: u8) -> Result<u8, NpduError> {
	match len {
		0 => Ok(0),
		1 => Ok(1),
		3 => Ok(2),
		6 => Ok(3),
		other => Err(NpduError::BadDomainLength(other)),
	}
}

/// Decodes the 2-bit header field into a domain length in bytes.
pub fn decode_domain_length(code: u8) -> u8 {
	match code & 0x03 {
		0 => 0,
		1 => 1,
		2 => 3,
		_ => 6,
	}
}

/// An NPDU parsed off the wire, before any local filtering.  Borrowed
/// fields point into the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct RawNpdu<'a> {
	pub version: ProtocolVersion,
	pub pdu_type: PduType,
	pub src_subnet: u8,
	pub src_node: u8,
	pub dest: Destination,
	pub domain: &'a [u8],
	pub payload: &'a [u8],
}

/// Builds an NPDU.  `src_node` carries only the 7-bit node number; the sel
/// bit is derived from the destination (0 for multicast-ack, 1 otherwise).
#[allow(clippy::too_many_arguments)]
pub fn build(
	version: ProtocolVersion,
	pdu_type: PduType,
	src_subnet: u8,
	src_node: u8,
	dest: &Destination,
	domain: &[u8],
	payload: &[u8],
	out: &mut SmallVec<[u8; 64]>,
) -> Result<(), NpduError> {
	let domain_code = encode_domain_length(domain.len() as u8)?;
	let format = dest.mode().format();
	out.clear();
	out.push(u8::from(version) << 6 | u8::from(pdu_type) << 4 | (format as u8) << 2 | domain_code);
	let sel = u8::from(!matches!(dest, Destination::MulticastAck { .. }));
	out.push(src_subnet);
	out.push(sel << 7 | (src_node & 0x7F));
	match *dest {
		Destination::Broadcast { subnet } => out.push(subnet),
		Destination::Multicast { group } => out.push(group),
		Destination::SubnetNode { subnet, node } => {
			out.push(subnet);
			out.push(0x80 | (node & 0x7F));
		}
		Destination::MulticastAck {
			subnet,
			node,
			group,
			member,
		} => {
			out.push(subnet);
			out.push(0x80 | (node & 0x7F));
			out.push(group);
			out.push(member);
		}
		Destination::UniqueId { subnet, id } => {
			out.push(subnet);
			out.extend_from_slice(&id);
		}
	}
	out.extend_from_slice(domain);
	out.extend_from_slice(payload);
	Ok(())
}

/// Parses an NPDU.  The mirror of [`build`]; format 2 is split into
/// subnet-node vs multicast-ack by the sel bit of the source node byte.
pub fn parse(npdu: &[u8]) -> Result<RawNpdu<'_>, NpduError> {
	let header = *npdu.first().ok_or(NpduError::Truncated)?;
	let version = ProtocolVersion::try_from(header >> 6)
		.map_err(|_| NpduError::BadVersion(header >> 6))?;
	let pdu_type = PduType::try_from(header >> 4 & 0x03).map_err(|_| NpduError::BadPduType)?;
	let format = header >> 2 & 0x03;
	let domain_len = usize::from(decode_domain_length(header));

	let data = &npdu[1..];
	if data.len() < 2 {
		return Err(NpduError::Truncated);
	}
	let src_subnet = data[0];
	let sel = data[1] & 0x80 != 0;
	let src_node = data[1] & 0x7F;

	let (dest, after) = match format {
		0 => (
			Destination::Broadcast {
				subnet: *data.get(2).ok_or(NpduError::Truncated)?,
			},
			3,
		),
		1 => (
			Destination::Multicast {
				group: *data.get(2).ok_or(NpduError::Truncated)?,
			},
			3,
		),
		2 => {
			if sel {
				if data.len() < 4 {
					return Err(NpduError::Truncated);
				}
				(
					Destination::SubnetNode {
						subnet: data[2],
						node: data[3] & 0x7F,
					},
					4,
				)
			} else {
				if data.len() < 6 {
					return Err(NpduError::Truncated);
				}
				(
					Destination::MulticastAck {
						subnet: data[2],
						node: data[3] & 0x7F,
						group: data[4],
						member: data[5],
					},
					6,
				)
			}
		}
		_ => {
			if data.len() < 3 + UNIQUE_ID_LEN {
				return Err(NpduError::Truncated);
			}
			let mut id = [0; UNIQUE_ID_LEN];
			id.copy_from_slice(&data[3..3 + UNIQUE_ID_LEN]);
			(
				Destination::UniqueId {
					subnet: data[2],
					id,
				},
				3 + UNIQUE_ID_LEN,
			)
		}
	};

	if data.len() < after + domain_len {
		return Err(NpduError::Truncated);
	}
	let domain = &data[after..after + domain_len];
	let payload = &data[after + domain_len..];
	if payload.is_empty() {
		return Err(NpduError::Truncated);
	}
	debug_assert!(domain.len() <= DOMAIN_ID_LEN);
	Ok(RawNpdu {
		version,
		pdu_type,
		src_subnet,
		src_node,
		dest,
		domain,
		payload,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip(dest: Destination, domain: &[u8]) {
		let payload = [0x2D, 0xAA, 0x01];
		let mut wire = SmallVec::new();
		build(
			ProtocolVersion::Legacy,
			PduType::Tpdu,
			3,
			17,
			&dest,
			domain,
			&payload,
			&mut wire,
		)
		.unwrap();
		let parsed = parse(&wire).unwrap();
		assert_eq!(parsed.version, ProtocolVersion::Legacy);
		assert_eq!(parsed.pdu_type, PduType::Tpdu);
		assert_eq!(parsed.src_subnet, 3);
		assert_eq!(parsed.src_node, 17);
		assert_eq!(parsed.dest, dest);
		assert_eq!(parsed.domain, domain);
		assert_eq!(parsed.payload, &payload);
	}

	#[test]
	fn build_parse_round_trips_every_format() {
		round_trip(Destination::Broadcast { subnet: 0 }, &[]);
		round_trip(Destination::Broadcast { subnet: 7 }, &[0x51]);
		round_trip(Destination::Multicast { group: 200 }, &[1, 2, 3]);
		round_trip(
			Destination::SubnetNode {
				subnet: 3,
				node: 17,
			},
			&[1, 2, 3, 4, 5, 6],
		);
		round_trip(
			Destination::MulticastAck {
				subnet: 3,
				node: 17,
				group: 5,
				member: 2,
			},
			&[0x51],
		);
		round_trip(
			Destination::UniqueId {
				subnet: 0,
				id: [1, 2, 3, 4, 5, 6],
			},
			&[],
		);
	}

	#[test]
	fn domain_length_codec() {
		for len in [0u8, 1, 3, 6] {
			assert_eq!(decode_domain_length(encode_domain_length(len).unwrap()), len);
		}
		for len in [2u8, 4, 5, 7, 255] {
			assert_eq!(
				encode_domain_length(len),
				Err(NpduError::BadDomainLength(len))
			);
		}
	}

	#[test]
	fn sel_bit_distinguishes_formats_2a_2b() {
		let mut wire = SmallVec::new();
		build(
			ProtocolVersion::Legacy,
			PduType::Tpdu,
			1,
			2,
			&Destination::MulticastAck {
				subnet: 3,
				node: 4,
				group: 5,
				member: 6,
			},
			&[],
			&[0xFF],
			&mut wire,
		)
		.unwrap();
		// Source node byte carries sel = 0 for a multicast ack.
		assert_eq!(wire[2] & 0x80, 0);

		let mut wire2 = SmallVec::new();
		build(
			ProtocolVersion::Legacy,
			PduType::Tpdu,
			1,
			2,
			&Destination::SubnetNode { subnet: 3, node: 4 },
			&[],
			&[0xFF],
			&mut wire2,
		)
		.unwrap();
		assert_eq!(wire2[2] & 0x80, 0x80);
	}

	#[test]
	fn unsupported_version_is_rejected() {
		let mut wire = SmallVec::new();
		build(
			ProtocolVersion::Legacy,
			PduType::Apdu,
			1,
			2,
			&Destination::Broadcast { subnet: 0 },
			&[],
			&[0x00],
			&mut wire,
		)
		.unwrap();
		wire[0] = wire[0] & 0x3F | 1 << 6;
		assert_eq!(parse(&wire), Err(NpduError::BadVersion(1)));
	}
}
