//! Challenge-byte generation for the authentication handshake.
//!
//! Uses a ChaCha-based generator seeded once by the host.  The output is
//! additionally mixed with the previous challenge and the millisecond tick,
//! so repeated seeding in tests still exercises the mixing path.

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::{Rng, SeedableRng};

use crate::time::Clock;

pub struct ChallengeRng {
	pool: ChaCha20Rng,
	prev_challenge: [u8; 8],
}

impl ChallengeRng {
	pub fn new(seed: [u8; 32]) -> Self {
		Self {
			pool: ChaCha20Rng::from_seed(seed),
			prev_challenge: [0; 8],
		}
	}

	/// Clears the previous-challenge memory.  Called on first reset only;
	/// later resets keep the chain so consecutive challenges stay distinct.
	pub fn clear_history(&mut self) {
		self.prev_challenge = [0; 8];
	}

	/// Produces the next 8 challenge bytes:
	/// `prev[i] + rng[i] + now` per byte, remembered for the next call.
	pub fn next_challenge(&mut self, clock: &dyn Clock) -> [u8; 8] {
		let mut fresh = [0u8; 8];
		self.pool.fill_bytes(&mut fresh);
		let now = clock.now_ms() as u8;
		let mut out = [0u8; 8];
		for i in 0..8 {
			out[i] = self.prev_challenge[i]
				.wrapping_add(fresh[i])
				.wrapping_add(now);
			self.prev_challenge[i] = out[i];
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::cell::Cell;

	struct FixedClock(Cell<u32>);

	impl Clock for FixedClock {
		fn now_ms(&self) -> u32 {
			self.0.get()
		}
	}

	#[test]
	fn deterministic_for_fixed_seed_and_clock() {
		let clock = FixedClock(Cell::new(1234));
		let mut a = ChallengeRng::new([7; 32]);
		let mut b = ChallengeRng::new([7; 32]);
		assert_eq!(a.next_challenge(&clock), b.next_challenge(&clock));
	}

	#[test]
	fn consecutive_challenges_differ() {
		let clock = FixedClock(Cell::new(0));
		let mut rng = ChallengeRng::new([0; 32]);
		let first = rng.next_challenge(&clock);
		let second = rng.next_challenge(&clock);
		assert_ne!(first, second);
	}
}
