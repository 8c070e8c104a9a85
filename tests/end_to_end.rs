//! End-to-end transaction scenarios driven through a scripted network
//! interface and a manual clock.

mod common;

use common::wire::{Dest, npdu, uplink};
use common::{Bench, OUR_NODE, OUR_SUBNET, TEST_DOMAIN, TEST_KEY, bench};
use lon_stack::net::npdu::{PduType, parse};
use lon_stack::node::{NodeState, ResetCause};
use lon_stack::transport::auth::encrypt;
use lon_stack::{
	AppEvent, ResponseParam, SendAddress, SendRequest, SendTimers, Service, Stat, SystemError,
};

const TPDU: u8 = 0;
const SPDU: u8 = 1;
const AUTHPDU: u8 = 2;

fn ackd_to_subnet_node(tag: u16, subnet: u8, node: u8, apdu: &[u8]) -> SendRequest {
	SendRequest::new(
		tag,
		Service::Acknowledged,
		SendAddress::SubnetNode {
			domain_index: 0,
			subnet,
			node,
			timers: SendTimers {
				retry_count: 3,
				rpt_timer_code: 0,
				tx_timer_code: 4, // 64 ms
			},
		},
		apdu.to_vec(),
	)
}

fn drain_completions(bench: &mut Bench) -> Vec<(u16, bool)> {
	let mut out = Vec::new();
	while let Some(event) = bench.stack.poll_event() {
		if let AppEvent::Completion(c) = event {
			out.push((c.tag, c.success));
		}
	}
	out
}

#[test]
fn acknowledged_unicast_first_try() {
	let mut b = bench();
	b.stack
		.submit(ackd_to_subnet_node(11, 3, 17, &[0x2D, 0xAA]))
		.unwrap();
	b.stack.service();

	let lpdus = b.port.take_lpdus();
	assert_eq!(lpdus.len(), 1);
	let parsed = parse(&lpdus[0].1).unwrap();
	assert_eq!(parsed.pdu_type, PduType::Tpdu);
	assert_eq!(parsed.src_subnet, OUR_SUBNET);
	assert_eq!(parsed.src_node, OUR_NODE);
	// ACKD_MSG, no auth, tid 1.
	assert_eq!(parsed.payload[0], 0x01);
	assert_eq!(&parsed.payload[1..], &[0x2D, 0xAA]);

	// The ack comes back from (3,17) with the same tid.
	let ack = npdu(
		TPDU,
		(3, 17),
		Dest::SubnetNode {
			subnet: OUR_SUBNET,
			node: OUR_NODE,
		},
		&[TEST_DOMAIN],
		&[0x21],
	);
	b.port.push(uplink(false, &ack));
	b.stack.service();

	assert_eq!(drain_completions(&mut b), vec![(11, true)]);
	assert_eq!(b.stack.stat(Stat::TxFailure), 0);
}

#[test]
fn acknowledged_unicast_retries_exhausted() {
	let mut b = bench();
	b.stack
		.submit(ackd_to_subnet_node(12, 3, 17, &[0x2D, 0xAA]))
		.unwrap();
	b.stack.service();
	assert_eq!(b.port.take_lpdus().len(), 1);

	// Three retries at 64 ms intervals, nothing ever acks.
	let mut alt_flags = Vec::new();
	for _ in 0..3 {
		b.clock.advance(64);
		b.stack.service();
		let lpdus = b.port.take_lpdus();
		assert_eq!(lpdus.len(), 1);
		alt_flags.push(lpdus[0].0 & 0x40 != 0);
	}
	// The last retries travel the alternate path.
	assert!(alt_flags[2]);

	// One more timer expiry ends the transaction.
	b.clock.advance(64);
	b.stack.service();
	assert!(b.port.take_lpdus().is_empty());
	assert_eq!(drain_completions(&mut b), vec![(12, false)]);
	assert_eq!(b.stack.stat(Stat::Retry), 3);
	assert_eq!(b.stack.stat(Stat::TxFailure), 1);
}

#[test]
fn multicast_partial_acks_then_reminder() {
	let mut b = bench();
	b.stack
		.submit(SendRequest::new(
			13,
			Service::Acknowledged,
			SendAddress::Group {
				domain_index: 0,
				group: 5,
				size: 4,
				timers: SendTimers {
					retry_count: 3,
					rpt_timer_code: 0,
					tx_timer_code: 4,
				},
			},
			vec![0x2D, 0xAA],
		))
		.unwrap();
	b.stack.service();
	let lpdus = b.port.take_lpdus();
	assert_eq!(lpdus.len(), 1);
	let tid = parse(&lpdus[0].1).unwrap().payload[0] & 0x0F;

	// Members 1 and 3 acknowledge.
	for member in [1u8, 3] {
		let ack = npdu(
			TPDU,
			(4, 10 + member),
			Dest::MulticastAck {
				subnet: OUR_SUBNET,
				node: OUR_NODE,
				group: 5,
				member,
			},
			&[TEST_DOMAIN],
			&[0x20 | tid],
		);
		b.port.push(uplink(false, &ack));
		b.stack.service();
	}
	assert!(drain_completions(&mut b).is_empty());

	// The first retry is a REM/MSG carrying the ack bitmap 0b0000_1010.
	b.clock.advance(64);
	b.stack.service();
	let lpdus = b.port.take_lpdus();
	assert_eq!(lpdus.len(), 1);
	let parsed = parse(&lpdus[0].1).unwrap();
	assert_eq!(parsed.payload[0] >> 4 & 0x07, 5); // REM_MSG_MSG
	assert_eq!(parsed.payload[1], 1); // M_LIST length
	assert_eq!(parsed.payload[2], 0x0A); // members 1 and 3
	assert_eq!(&parsed.payload[3..], &[0x2D, 0xAA]);

	// Remaining retries pass without the missing acks.
	for _ in 0..3 {
		b.clock.advance(64);
		b.stack.service();
		b.port.take_lpdus();
	}
	assert_eq!(drain_completions(&mut b), vec![(13, false)]);
}

#[test]
fn multicast_all_acks_succeed() {
	let mut b = bench();
	b.stack
		.submit(SendRequest::new(
			14,
			Service::Acknowledged,
			SendAddress::Group {
				domain_index: 0,
				group: 5,
				size: 4,
				timers: SendTimers {
					retry_count: 3,
					rpt_timer_code: 0,
					tx_timer_code: 4,
				},
			},
			vec![0x10],
		))
		.unwrap();
	b.stack.service();
	let tid = parse(&b.port.take_lpdus()[0].1).unwrap().payload[0] & 0x0F;

	for member in 0..4u8 {
		let ack = npdu(
			TPDU,
			(4, 20 + member),
			Dest::MulticastAck {
				subnet: OUR_SUBNET,
				node: OUR_NODE,
				group: 5,
				member,
			},
			&[TEST_DOMAIN],
			&[0x20 | tid],
		);
		b.port.push(uplink(false, &ack));
		b.stack.service();
	}

	// Freed immediately on the fourth ack.
	assert_eq!(drain_completions(&mut b), vec![(14, true)]);
}

#[test]
fn duplicate_inbound_is_suppressed() {
	let mut b = bench();
	let msg = npdu(
		TPDU,
		(2, 5),
		Dest::SubnetNode {
			subnet: OUR_SUBNET,
			node: OUR_NODE,
		},
		&[TEST_DOMAIN],
		&[0x07, 0x2D, 0x99], // ACKD_MSG tid 7 + apdu
	);
	b.port.push(uplink(false, &msg));
	b.stack.service();
	b.stack.service(); // the synthesized ack leaves on the next send phase

	let mut deliveries = 0;
	while let Some(event) = b.stack.poll_event() {
		if let AppEvent::Message(m) = event {
			assert_eq!(m.apdu, vec![0x2D, 0x99]);
			deliveries += 1;
		}
	}
	assert_eq!(deliveries, 1);
	let acks = b.port.take_lpdus();
	assert_eq!(acks.len(), 1);
	assert_eq!(parse(&acks[0].1).unwrap().payload[0], 0x27); // ACK tid 7

	// The identical message again: no redelivery, the cached ack repeats.
	b.port.push(uplink(false, &msg));
	b.stack.service();
	b.stack.service();
	assert!(b.stack.poll_event().is_none());
	let acks = b.port.take_lpdus();
	assert_eq!(acks.len(), 1);
	assert_eq!(parse(&acks[0].1).unwrap().payload[0], 0x27);
}

#[test]
fn authenticated_request_round_trip() {
	let mut b = bench();
	let request_apdu = [0x60, 0x01];
	let request = npdu(
		SPDU,
		(2, 5),
		Dest::SubnetNode {
			subnet: OUR_SUBNET,
			node: OUR_NODE,
		},
		&[TEST_DOMAIN],
		&[0x84, request_apdu[0], request_apdu[1]], // REQUEST, auth=1, tid 4
	);
	b.port.push(uplink(false, &request));
	b.stack.service();
	b.stack.service(); // the challenge leaves on the next send phase

	// Nothing delivered yet; a challenge goes back to (2,5).
	assert!(b.stack.poll_event().is_none());
	let lpdus = b.port.take_lpdus();
	assert_eq!(lpdus.len(), 1);
	let challenge = parse(&lpdus[0].1).unwrap();
	assert_eq!(challenge.pdu_type, PduType::AuthPdu);
	assert_eq!(challenge.payload[0], 0x84); // fmt 2, CHALLENGE, tid 4
	let mut rand = [0u8; 8];
	rand.copy_from_slice(&challenge.payload[1..9]);

	// The peer answers with the matching hash.
	let crypto = encrypt(&rand, &request_apdu, &TEST_KEY, None);
	let mut reply_payload = vec![0xA4]; // fmt 2, REPLY, tid 4
	reply_payload.extend_from_slice(&crypto);
	let reply = npdu(
		AUTHPDU,
		(2, 5),
		Dest::SubnetNode {
			subnet: OUR_SUBNET,
			node: OUR_NODE,
		},
		&[TEST_DOMAIN],
		&reply_payload,
	);
	b.port.push(uplink(false, &reply));
	b.stack.service();

	let Some(AppEvent::Message(delivered)) = b.stack.poll_event() else {
		panic!("request was not delivered");
	};
	assert!(delivered.auth);
	assert_eq!(delivered.service, Service::Request);
	assert_eq!(delivered.apdu, request_apdu);
	assert_ne!(delivered.req_id, 0);

	// The application responds; a RESPONSE_MSG goes out with tid 4.
	b.stack
		.respond(ResponseParam {
			req_id: delivered.req_id,
			null_response: false,
			flex_response: false,
			apdu: vec![0x22, 0x33],
		})
		.unwrap();
	b.stack.service();
	let lpdus = b.port.take_lpdus();
	assert_eq!(lpdus.len(), 1);
	let response = parse(&lpdus[0].1).unwrap();
	assert_eq!(response.pdu_type, PduType::Spdu);
	assert_eq!(response.payload[0], 0x24); // RESPONSE, tid 4
	assert_eq!(&response.payload[1..], &[0x22, 0x33]);
}

#[test]
fn wrong_reply_delivers_unauthenticated() {
	let mut b = bench();
	let request = npdu(
		SPDU,
		(2, 5),
		Dest::SubnetNode {
			subnet: OUR_SUBNET,
			node: OUR_NODE,
		},
		&[TEST_DOMAIN],
		&[0x84, 0x42],
	);
	b.port.push(uplink(false, &request));
	b.stack.service();
	b.port.take_lpdus();

	let mut reply_payload = vec![0xA4];
	reply_payload.extend_from_slice(&[0xDE; 8]);
	let reply = npdu(
		AUTHPDU,
		(2, 5),
		Dest::SubnetNode {
			subnet: OUR_SUBNET,
			node: OUR_NODE,
		},
		&[TEST_DOMAIN],
		&reply_payload,
	);
	b.port.push(uplink(false, &reply));
	b.stack.service();

	let Some(AppEvent::Message(delivered)) = b.stack.poll_event() else {
		panic!("request was not delivered");
	};
	assert!(!delivered.auth);
	assert_eq!(b.stack.error_log(), SystemError::AuthenticationMismatch);
}

#[test]
fn config_checksum_corruption_forces_unconfigured_reset() {
	let mut b = bench();
	let uid = b.stack.unique_id();

	// Corrupt one byte of the mutable configuration behind the stack's
	// back.
	b.stack.node_mut().domain_table[0].subnet ^= 0xFF;

	b.clock.advance(1100);
	b.stack.service(); // checksum tick detects the mismatch
	assert_eq!(b.stack.error_log(), SystemError::ConfigChecksumError);
	b.stack.service(); // the pending software reset runs

	assert_eq!(b.stack.node().read_only.node_state, NodeState::AppUnconfig);
	assert_eq!(b.stack.unique_id(), uid);
	let saw_reset = std::iter::from_fn(|| b.stack.poll_event())
		.any(|event| matches!(event, AppEvent::Reset(ResetCause::Software)));
	assert!(saw_reset);
}

#[test]
fn unconfigured_node_ignores_subnet_node_traffic() {
	let mut b = bench();
	b.stack.node_mut().read_only.node_state = NodeState::AppUnconfig;
	b.stack.commit_config();

	let msg = npdu(
		TPDU,
		(2, 5),
		Dest::SubnetNode {
			subnet: OUR_SUBNET,
			node: OUR_NODE,
		},
		&[TEST_DOMAIN],
		&[0x07, 0x11],
	);
	b.port.push(uplink(false, &msg));
	b.stack.service();
	assert!(b.stack.poll_event().is_none());
	assert!(b.port.take_lpdus().is_empty());
}

#[test]
fn own_packets_via_repeater_are_dropped() {
	let mut b = bench();
	// Our own subnet/node as the source: a repeater echo.
	let msg = npdu(
		TPDU,
		(OUR_SUBNET, OUR_NODE),
		Dest::SubnetNode {
			subnet: OUR_SUBNET,
			node: OUR_NODE,
		},
		&[TEST_DOMAIN],
		&[0x07, 0x11],
	);
	b.port.push(uplink(false, &msg));
	b.stack.service();
	assert!(b.stack.poll_event().is_none());
	assert!(b.port.take_lpdus().is_empty());
}

#[test]
fn late_ack_is_counted_and_ignored() {
	let mut b = bench();
	// No transaction in flight; a stray ack arrives.
	let ack = npdu(
		TPDU,
		(3, 17),
		Dest::SubnetNode {
			subnet: OUR_SUBNET,
			node: OUR_NODE,
		},
		&[TEST_DOMAIN],
		&[0x21],
	);
	b.port.push(uplink(false, &ack));
	b.stack.service();
	assert_eq!(b.stack.stat(Stat::LateAck), 1);
	assert!(b.stack.poll_event().is_none());
}

#[test]
fn oversized_apdu_is_rejected_at_submit() {
	let mut b = bench();
	let request = ackd_to_subnet_node(1, 3, 17, &[0u8; 229]);
	assert!(b.stack.submit(request).is_err());
	// The boundary size passes the submit check.
	let request = ackd_to_subnet_node(1, 3, 17, &[0u8; 228]);
	assert!(b.stack.submit(request).is_ok());
}
