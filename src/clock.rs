//! Monotonic time source for the loop.
//!
//! All loop timestamps are [`Duration`] offsets from an [`Instant`] captured
//! at driver construction, so expirations registered at different times stay
//! comparable without ever touching the wall clock.

use std::time::{Duration, Instant};

/// Monotonic clock anchored at driver construction.
#[derive(Debug, Clone)]
pub(crate) struct Clock {
    origin: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time elapsed since the clock's origin.
    pub(crate) fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = Clock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first, "clock readings must never go backwards");
    }
}
