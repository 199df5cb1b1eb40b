//! Monotonic + wall clock abstraction (spec.md §6), injected so deadlines
//! and entry timestamps are testable without real sleeps.

use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic instant, used for deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for `created_at`/`last_verified_at` stamps.
    fn utc_now(&self) -> chrono::DateTime<chrono::Utc>;

    fn deadline_from(&self, duration: Duration) -> Instant {
        self.now() + duration
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

/// Test-only clock pinned to a fixed wall time, with `now()` still backed by
/// a real `Instant` (deadlines in tests still need monotonic time to pass).
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    wall: chrono::DateTime<chrono::Utc>,
    base: Instant,
}

#[cfg(any(test, feature = "test-util"))]
impl FixedClock {
    pub fn new(wall: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            wall,
            base: Instant::now(),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Clock for FixedClock {
    fn now(&self) -> Instant {
        self.base
    }

    fn utc_now(&self) -> chrono::DateTime<chrono::Utc> {
        self.wall
    }
}
