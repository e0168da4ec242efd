//! Run statistics.
//!
//! The executor reports per-unit lifecycle events to a [`StatsSink`]; the
//! bundled [`RunStats`] keeps thread-safe counters with a per-label
//! breakdown for end-of-run reporting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// Per-unit lifecycle events the executor reports.
pub trait StatsSink: Send + Sync {
    fn record_start(&self, unit_key: &str);

    fn record_finish(&self, unit_key: &str);

    fn record_failure(&self, unit_key: &str);
}

#[derive(Debug, Default, Clone)]
struct Counters {
    started: u64,
    finished: u64,
    failed: u64,
}

#[derive(Debug)]
struct StatsState {
    started_at: DateTime<Utc>,
    total: Counters,
    by_key: HashMap<String, Counters>,
}

/// Immutable view of the collected counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
}

/// Thread-safe default stats sink. Cloning shares the same counters.
#[derive(Clone)]
pub struct RunStats {
    inner: Arc<Mutex<StatsState>>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatsState {
                started_at: Utc::now(),
                total: Counters::default(),
                by_key: HashMap::new(),
            })),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.inner.lock().expect("stats lock poisoned");
        StatsSnapshot {
            started_at: state.started_at,
            started: state.total.started,
            finished: state.total.finished,
            failed: state.total.failed,
        }
    }

    fn update(&self, unit_key: &str, f: impl Fn(&mut Counters)) {
        let mut state = self.inner.lock().expect("stats lock poisoned");
        f(&mut state.total);
        let entry = state.by_key.entry(unit_key.to_string()).or_default();
        f(entry);
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSink for RunStats {
    fn record_start(&self, unit_key: &str) {
        self.update(unit_key, |c| c.started += 1);
    }

    fn record_finish(&self, unit_key: &str) {
        self.update(unit_key, |c| c.finished += 1);
    }

    fn record_failure(&self, unit_key: &str) {
        self.update(unit_key, |c| c.failed += 1);
    }
}
