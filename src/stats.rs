//! Volatile statistics counters and the persisted error log byte.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Per-stack statistic counters.  All counters saturate at `u32::MAX`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Stat {
	TxError,
	TxFailure,
	RxTxFull,
	Lost,
	Missed,
	L2Rx,
	L3Rx,
	L3Tx,
	Retry,
	BacklogOverflow,
	LateAck,
	Collision,
	RxError,
}

const NUM_STATS: usize = Stat::Collision as usize + 1;

#[derive(Clone, Copy, Debug, Default)]
pub struct Statistics {
	counts: [u32; NUM_STATS],
}

impl Statistics {
	pub const fn new() -> Self {
		Self {
			counts: [0; NUM_STATS],
		}
	}

	pub fn increment(&mut self, stat: Stat) {
		let c = &mut self.counts[stat as usize];
		*c = c.saturating_add(1);
	}

	pub fn get(&self, stat: Stat) -> u32 {
		self.counts[stat as usize]
	}

	pub fn clear(&mut self) {
		self.counts = [0; NUM_STATS];
	}
}

/// Latchable error conditions, persisted as a single byte.  The numeric
/// values are the on-the-wire error codes reported to network management
/// tools and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SystemError {
	NoError = 0,
	BadAddressType = 133,
	InvalidDomain = 138,
	WritePastEndOfMsg = 140,
	InvalidAddrTableIndex = 141,
	UnknownPdu = 146,
	MemoryAllocFailure = 150,
	WritePastEndOfNetBuffer = 151,
	ConfigChecksumError = 153,
	WritePastEndOfApplBuffer = 156,
	AuthenticationMismatch = 160,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_saturate() {
		let mut stats = Statistics::new();
		stats.increment(Stat::Retry);
		assert_eq!(stats.get(Stat::Retry), 1);
		for _ in 0..4 {
			stats.increment(Stat::Retry);
		}
		assert_eq!(stats.get(Stat::Retry), 5);

		let mut s = Statistics::new();
		s.counts[Stat::Lost as usize] = u32::MAX;
		s.increment(Stat::Lost);
		assert_eq!(s.get(Stat::Lost), u32::MAX);
	}

	#[test]
	fn error_codes_round_trip() {
		assert_eq!(u8::from(SystemError::ConfigChecksumError), 153);
		assert_eq!(
			SystemError::try_from(160u8).unwrap(),
			SystemError::AuthenticationMismatch
		);
	}
}
