//! A small, fast, non-cryptographic PRNG.
//!
//! Used to jitter client-driver simulations in the test suite and to
//! pick rotating catchup helpers; never used where cryptographic
//! randomness is required (see `crypto::signature` / `rand_core::OsRng`
//! for that).

use rand_core::{OsRng, RngCore};

/// State of a xorshift PRNG.
pub struct State(u64);

impl State {
    /// Creates a new PRNG state, seeded from the OS entropy source.
    pub fn new() -> Self {
        let mut seed = 0;
        while seed == 0 {
            seed = OsRng.next_u64();
        }
        Self(seed)
    }

    /// Creates a new PRNG state from the given (non-zero) seed.
    pub fn from_seed(seed: u64) -> Self {
        Self(if seed == 0 { 1 } else { seed })
    }

    /// Returns the next pseudo-random value, advancing the state.
    pub fn next_state(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Returns a pseudo-random value in `0..bound`.
    pub fn next_bounded(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            0
        } else {
            self.next_state() % bound
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::State;

    #[test]
    fn test_deterministic_from_seed() {
        let mut a = State::from_seed(42);
        let mut b = State::from_seed(42);
        for _ in 0..16 {
            assert_eq!(a.next_state(), b.next_state());
        }
    }

    #[test]
    fn test_bounded_in_range() {
        let mut s = State::from_seed(7);
        for _ in 0..256 {
            assert!(s.next_bounded(5) < 5);
        }
    }
}
