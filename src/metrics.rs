//! Metrics emission
//!
//! Components receive an [`Emitter`] at construction. Names are dotted,
//! counters are monotonic, gauges are absolute.

use crate::core::sync::recover_poison;
use std::collections::HashMap;
use std::sync::Mutex;

pub const SCANNER_VIOLATIONS: &str = "scanner.violations";
pub const SCANNER_CREDENTIALS: &str = "scanner.credentials";
pub const CLONER_FAILURES: &str = "cloner.failures";
pub const FETCH_FAILURES: &str = "changes.fetch_failures";
pub const PUSH_DEAD_LETTERED: &str = "push.dead_lettered";

pub const GAUGE_REPOSITORIES: &str = "repositories";
pub const GAUGE_DISABLED: &str = "repositories.disabled";
pub const GAUGE_FAILING: &str = "repositories.failing";
pub const GAUGE_FETCHES: &str = "fetches";
pub const GAUGE_CREDENTIALS: &str = "credentials";
pub const GAUGE_HEAD_CREDENTIALS: &str = "credentials.head";

pub trait Emitter: Send + Sync {
    fn gauge(&self, name: &str, value: u64);

    fn counter(&self, name: &str, delta: u64);
}

/// Emits metrics as log lines under the `metrics` target
#[derive(Debug, Default, Clone)]
pub struct LogEmitter;

impl Emitter for LogEmitter {
    fn gauge(&self, name: &str, value: u64) {
        log::info!(target: "metrics", "gauge {}={}", name, value);
    }

    fn counter(&self, name: &str, delta: u64) {
        log::debug!(target: "metrics", "counter {}+={}", name, delta);
    }
}

/// Keeps the latest gauges and counter totals in memory
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    gauges: Mutex<HashMap<String, u64>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge_value(&self, name: &str) -> Option<u64> {
        recover_poison(self.gauges.lock()).get(name).copied()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        recover_poison(self.counters.lock())
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl Emitter for MemoryEmitter {
    fn gauge(&self, name: &str, value: u64) {
        recover_poison(self.gauges.lock()).insert(name.to_string(), value);
    }

    fn counter(&self, name: &str, delta: u64) {
        *recover_poison(self.counters.lock())
            .entry(name.to_string())
            .or_insert(0) += delta;
    }
}
