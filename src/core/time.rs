//! Tick and clock utilities.
//!
//! The scheduler never samples wall-clock time directly. Retry deadlines,
//! history timestamps and refresh bookkeeping are expressed as [`Tick`]
//! values obtained from a [`Clock`], so tests can drive time explicitly
//! through [`ManualClock`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A point in scheduler time, in milliseconds since the clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick {
    /// Milliseconds since the clock epoch.
    pub ms: u64,
}

impl Tick {
    /// Create a new tick with the given millisecond value.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// Create a tick representing the clock epoch.
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Add milliseconds to this tick, saturating at `u64::MAX`.
    pub const fn add_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_add(ms),
        }
    }

    /// Add a duration to this tick.
    pub fn add_duration(self, duration: Duration) -> Self {
        self.add_ms(duration.as_millis().min(u64::MAX as u128) as u64)
    }

    /// Check if this tick is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Tick) -> bool {
        self.ms >= deadline.ms
    }

    /// Milliseconds until a deadline.
    ///
    /// Returns 0 if the deadline has already passed.
    pub fn ms_until(self, deadline: Tick) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tick({}ms)", self.ms)
    }
}

/// Source of scheduler time.
pub trait Clock: Send + Sync {
    /// Current tick.
    fn now(&self) -> Tick;
}

/// Monotonic clock measuring milliseconds since it was created.
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Create a clock whose epoch is the current instant.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        let elapsed = self.epoch.elapsed().as_millis().min(u64::MAX as u128) as u64;
        Tick::new(elapsed)
    }
}

/// Clock advanced only by explicit calls.
///
/// Used by tests and simulations that need deterministic retry deadlines.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at the given tick.
    pub fn new(start: Tick) -> Self {
        Self {
            ms: AtomicU64::new(start.ms),
        }
    }

    /// Advance the clock by `ms` milliseconds and return the new tick.
    pub fn advance(&self, ms: u64) -> Tick {
        let now = self.ms.fetch_add(ms, Ordering::AcqRel).saturating_add(ms);
        Tick::new(now)
    }

    /// Jump the clock to an absolute tick. Time never moves backwards.
    pub fn set(&self, tick: Tick) {
        self.ms.fetch_max(tick.ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        Tick::new(self.ms.load(Ordering::Acquire))
    }
}
