//! Monotonic data-path counters.
//!
//! Every error class the data path can absorb lands in one of these
//! counters instead of propagating; `report` logs a per-window rate summary
//! and `snapshot` feeds the public stats API. All counters are lock-free
//! atomics so the worker and readers never contend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

/// A monotonic counter that also tracks a delta window: `delta` returns the
/// increase since the previous `delta` call and starts a new window.
#[derive(Debug, Default)]
pub struct Metric {
    total: AtomicU64,
    reported: AtomicU64,
}

impl Metric {
    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Increase since the previous `delta` call.
    pub fn delta(&self) -> u64 {
        let total = self.total.load(Ordering::Relaxed);
        let prev = self.reported.swap(total, Ordering::Relaxed);
        total.saturating_sub(prev)
    }
}

/// Counter set for the HTTP data path.
#[derive(Debug)]
pub struct Telemetry {
    /// Unix seconds at which the current report window opened.
    then: AtomicI64,

    pub hits_1xx: Metric,
    pub hits_2xx: Metric,
    pub hits_3xx: Metric,
    pub hits_4xx: Metric,
    pub hits_5xx: Metric,
    /// Transactions lost to producer overrun or dropped notifications.
    pub misses: Metric,
    /// Transactions discarded because the aggregation table was full.
    pub dropped: Metric,
    /// Transactions discarded by the user-defined reject filter.
    pub rejected: Metric,
    /// Transactions without the expected format (unknown method, bad path,
    /// inconsistent timestamps).
    pub malformed: Metric,
    /// Distinct endpoint keys created in the aggregation table.
    pub aggregations: Metric,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            then: AtomicI64::new(unix_now()),
            hits_1xx: Metric::default(),
            hits_2xx: Metric::default(),
            hits_3xx: Metric::default(),
            hits_4xx: Metric::default(),
            hits_5xx: Metric::default(),
            misses: Metric::default(),
            dropped: Metric::default(),
            rejected: Metric::default(),
            malformed: Metric::default(),
            aggregations: Metric::default(),
        }
    }

    /// Bumps the hit counter for a status class (100..=500). Other values
    /// are ignored; validation happens before aggregation.
    pub fn count_hit(&self, status_class: u16) {
        match status_class {
            100 => self.hits_1xx.inc(),
            200 => self.hits_2xx.inc(),
            300 => self.hits_3xx.inc(),
            400 => self.hits_4xx.inc(),
            500 => self.hits_5xx.inc(),
            _ => {}
        }
    }

    /// Current totals, keyed the way the public stats API exposes them.
    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        HashMap::from([
            ("hits1xx", self.hits_1xx.get()),
            ("hits2xx", self.hits_2xx.get()),
            ("hits3xx", self.hits_3xx.get()),
            ("hits4xx", self.hits_4xx.get()),
            ("hits5xx", self.hits_5xx.get()),
            ("misses", self.misses.get()),
            ("dropped", self.dropped.get()),
            ("rejected", self.rejected.get()),
            ("malformed", self.malformed.get()),
            ("aggregations", self.aggregations.get()),
        ])
    }

    /// Logs a rate summary for the window since the previous report and
    /// opens a new window.
    pub fn report(&self) {
        let now = unix_now();
        let then = self.then.swap(now, Ordering::Relaxed);
        let elapsed = (now - then).max(1) as f64;

        let hits = self.hits_1xx.delta()
            + self.hits_2xx.delta()
            + self.hits_3xx.delta()
            + self.hits_4xx.delta()
            + self.hits_5xx.delta();
        let misses = self.misses.delta();
        let dropped = self.dropped.delta();
        let rejected = self.rejected.delta();
        let malformed = self.malformed.delta();
        let aggregations = self.aggregations.delta();

        debug!(
            requests_processed = hits,
            requests_per_s = format_args!("{:.2}", hits as f64 / elapsed),
            requests_missed = misses,
            missed_per_s = format_args!("{:.2}", misses as f64 / elapsed),
            requests_dropped = dropped,
            dropped_per_s = format_args!("{:.2}", dropped as f64 / elapsed),
            requests_rejected = rejected,
            rejected_per_s = format_args!("{:.2}", rejected as f64 / elapsed),
            requests_malformed = malformed,
            malformed_per_s = format_args!("{:.2}", malformed as f64 / elapsed),
            aggregations,
            "http stats summary",
        );
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
