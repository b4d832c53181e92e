//! # Clock
//!
//! Monotonic time source for the heuristics that reason about time
//! (thrashing lapse, epochs, pin and throttle deadlines).

use core::sync::atomic::{AtomicU64, Ordering};

/// Nanoseconds per microsecond
pub const NSEC_PER_USEC: u64 = 1_000;
/// Nanoseconds per millisecond
pub const NSEC_PER_MSEC: u64 = 1_000_000;
/// Nanoseconds per second
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Monotonic nanosecond clock
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds
    fn now_ns(&self) -> u64;
}

/// Clock advanced explicitly by its owner
///
/// Used by hosts without a hardware timer and by tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `start_ns`
    pub const fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    /// Move time forward
    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::AcqRel);
    }

    /// Set the absolute time; never moves backwards
    pub fn set(&self, ns: u64) {
        self.now.fetch_max(ns, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
