//! Clock abstraction for scheduling decisions
//!
//! Periodic components and the fetch interval policy take a clock so tests
//! can move time forward deterministically.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::sync::recover_poison;

/// Source of wall-clock time
pub trait TimeProvider: Send + Sync {
    /// Current wall-clock time in UTC
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time
#[derive(Debug, Default, Clone)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start the clock at the given instant
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Start the clock at the current system time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut current = recover_poison(self.current.lock());
        let next = ChronoDuration::from_std(duration)
            .ok()
            .and_then(|delta| current.checked_add_signed(delta));
        if let Some(next) = next {
            *current = next;
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *recover_poison(self.current.lock()) = instant;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *recover_poison(self.current.lock())
    }
}
