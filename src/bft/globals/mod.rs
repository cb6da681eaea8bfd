//! Tiny global-state helpers shared by the rest of the crate.

use std::sync::atomic::{AtomicBool, Ordering};

/// A one-shot, thread-safe boolean flag.
///
/// Used to guard idempotent global initialization, e.g. `bft::init`.
pub struct Flag(AtomicBool);

impl Flag {
    /// Creates a new, unset `Flag`.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Checks if the flag is set.
    pub fn test(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sets the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Unsets the flag.
    pub fn unset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::Flag;

    #[test]
    fn test_flag_roundtrip() {
        let flag = Flag::new();
        assert!(!flag.test());
        flag.set();
        assert!(flag.test());
        flag.unset();
        assert!(!flag.test());
    }
}
