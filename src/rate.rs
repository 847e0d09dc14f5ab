//! Drift-free periodic sleep.
//!
//! A [`RateHandle`] remembers the deadline of its *next* wake-up rather than
//! a fixed duration, so a loop that calls `sleep(rate)` on every iteration
//! wakes at `t0 + k*period` regardless of how long each iteration's own
//! work took -- as long as that work stays under one period. A handler that
//! overruns a period skips straight to the next future multiple instead of
//! firing a burst of catch-up wake-ups.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A caller-owned timer for drift-free periodic sleep, created by
/// `Runtime::period`.
pub struct RateHandle {
    period: Duration,
    next_deadline: Mutex<Instant>,
}

impl RateHandle {
    /// Create a handle for the given period, anchored to the current
    /// instant: the first `sleep(rate)` call wakes one period from now.
    pub fn new(period: Duration) -> Self {
        RateHandle {
            period,
            next_deadline: Mutex::new(Instant::now() + period),
        }
    }

    /// Advance `next_deadline` by whole periods until it is strictly in the
    /// future, and return the duration from now until that deadline.
    pub(crate) fn advance(&self) -> Duration {
        let now = Instant::now();
        let mut deadline = self.next_deadline.lock();
        while *deadline <= now {
            *deadline += self.period;
        }
        *deadline - now
    }
}
