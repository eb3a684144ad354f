//! Adaptive spacing between fetches of one repository

use std::time::Duration;

/// Multiplicative backoff clamped to `[min, max]`.
///
/// A fetch that moved refs shrinks the interval, a fetch that found nothing
/// grows it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchIntervalPolicy {
    min: Duration,
    max: Duration,
    growth: f64,
    shrink: f64,
}

impl FetchIntervalPolicy {
    pub const DEFAULT_GROWTH: f64 = 2.0;
    pub const DEFAULT_SHRINK: f64 = 0.5;

    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            growth: Self::DEFAULT_GROWTH,
            shrink: Self::DEFAULT_SHRINK,
        }
    }

    /// Interval for a repository that has never been fetched
    pub fn initial(&self) -> Duration {
        self.min
    }

    pub fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min, self.max)
    }

    pub fn next(&self, current: Duration, changed: bool) -> Duration {
        let factor = if changed { self.shrink } else { self.growth };
        let scaled = current.as_secs_f64() * factor;
        let scaled = if scaled.is_finite() && scaled < self.max.as_secs_f64() {
            Duration::from_secs_f64(scaled.max(0.0))
        } else {
            self.max
        };
        self.clamp(scaled)
    }

    /// [`next`](Self::next) on whole seconds, as stored per repository
    pub fn next_secs(&self, current_secs: u64, changed: bool) -> u64 {
        self.next(Duration::from_secs(current_secs), changed).as_secs()
    }
}
