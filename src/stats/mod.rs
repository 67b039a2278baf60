//! Per-endpoint statistics aggregation.
//!
//! Folds the transaction stream into a `{path, method}` keyed table of
//! status-class buckets. The table is guarded by a mutex: the monitor's
//! worker writes, arbitrary reader threads take consistent snapshots via the
//! destructive [`Aggregator::flush`].

pub mod histogram;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::telemetry::Telemetry;
use crate::transaction::{Method, Transaction};

use self::histogram::Histogram;

/// Number of status classes tracked (1xx through 5xx).
pub const STATUS_CLASS_COUNT: usize = 5;

/// Aggregation key: one endpoint as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub path: String,
    pub method: Method,
}

/// Accumulated statistics for one `(endpoint, status class)` pair.
#[derive(Debug, Clone, Default)]
pub struct ClassStats {
    pub count: u64,
    /// Latency digest over `response_last_seen - request_started`.
    pub latency: Histogram,
    /// Request-start timestamp (ns) of the earliest transaction folded in.
    pub first_seen_ns: u64,
    /// Request-start timestamp (ns) of the latest transaction folded in.
    pub last_seen_ns: u64,
    /// Union of probe-assigned tag bits.
    pub static_tags: u64,
    /// Union of userspace-resolved tags.
    pub dynamic_tags: HashSet<String>,
}

/// Per-endpoint statistics: one bucket per status class.
#[derive(Debug, Clone, Default)]
pub struct RequestStats {
    classes: [Option<ClassStats>; STATUS_CLASS_COUNT],
}

impl RequestStats {
    fn class_index(status_class: u16) -> Option<usize> {
        match status_class {
            100 | 200 | 300 | 400 | 500 => Some(usize::from(status_class / 100) - 1),
            _ => None,
        }
    }

    /// Folds one validated transaction into the matching class bucket.
    fn record(&mut self, tx: &Transaction) {
        let Some(idx) = Self::class_index(tx.status_class()) else {
            return;
        };

        let bucket = self.classes[idx].get_or_insert_with(ClassStats::default);
        bucket.count += 1;
        bucket.latency.record(tx.latency_ns());

        // Zero is a legal request-start timestamp, so the first transaction
        // seeds both bounds rather than sentinel-testing against 0.
        let ts = tx.request_started;
        if bucket.count == 1 {
            bucket.first_seen_ns = ts;
            bucket.last_seen_ns = ts;
        } else {
            if ts < bucket.first_seen_ns {
                bucket.first_seen_ns = ts;
            }
            if ts > bucket.last_seen_ns {
                bucket.last_seen_ns = ts;
            }
        }

        bucket.static_tags |= tx.static_tags;
        for tag in &tx.dynamic_tags {
            if !bucket.dynamic_tags.contains(tag) {
                bucket.dynamic_tags.insert(tag.clone());
            }
        }
    }

    /// The bucket for a status class (100, 200, ...), if any transaction of
    /// that class was recorded.
    pub fn class(&self, status_class: u16) -> Option<&ClassStats> {
        Self::class_index(status_class).and_then(|i| self.classes[i].as_ref())
    }

    /// Whether any transaction with this exact-or-sibling status was seen.
    pub fn has_stats(&self, status_code: u16) -> bool {
        self.class((status_code / 100) * 100)
            .is_some_and(|b| b.count > 0)
    }

    /// Total transactions across all classes.
    pub fn total_count(&self) -> u64 {
        self.classes
            .iter()
            .flatten()
            .map(|b| b.count)
            .sum()
    }
}

/// The endpoint statistics table.
pub struct Aggregator {
    table: Mutex<HashMap<Key, RequestStats>>,
    max_entries: usize,
    reject_prefixes: Vec<String>,
    telemetry: Arc<Telemetry>,
}

impl Aggregator {
    pub fn new(max_entries: usize, reject_prefixes: Vec<String>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            max_entries,
            reject_prefixes,
            telemetry,
        }
    }

    /// Folds a batch of transactions into the table.
    ///
    /// Nothing here is fatal: transactions that fail validation are counted
    /// into `malformed`, reject-filter matches into `rejected`, and
    /// capacity overflow into `dropped`; the stream always advances.
    pub fn aggregate(&self, txs: Vec<Transaction>) {
        if txs.is_empty() {
            return;
        }

        let mut table = self.table.lock();

        for tx in txs {
            if tx.method == Method::Unknown || tx.incomplete() {
                self.telemetry.malformed.inc();
                continue;
            }

            if tx.response_last_seen < tx.request_started {
                self.telemetry.malformed.inc();
                continue;
            }

            if !(100..=599).contains(&tx.status_code) {
                self.telemetry.malformed.inc();
                continue;
            }

            let Some(path) = tx.path() else {
                self.telemetry.malformed.inc();
                continue;
            };
            let path = String::from_utf8_lossy(path).into_owned();

            if self.reject_prefixes.iter().any(|p| path.starts_with(p)) {
                self.telemetry.rejected.inc();
                continue;
            }

            let key = Key {
                path,
                method: tx.method,
            };

            let is_new = !table.contains_key(&key);
            if is_new && table.len() >= self.max_entries {
                self.telemetry.dropped.inc();
                continue;
            }

            table.entry(key).or_default().record(&tx);
            if is_new {
                self.telemetry.aggregations.inc();
            }
            self.telemetry.count_hit(tx.status_class());
        }
    }

    /// Adds lost transactions (dirty pages, skipped notifications) to the
    /// miss counter.
    pub fn record_misses(&self, n: u64) {
        if n > 0 {
            self.telemetry.misses.add(n);
        }
    }

    /// Atomically swaps the table for a fresh one and returns the old
    /// contents. Two successive calls with no aggregation in between return
    /// an empty map the second time.
    pub fn flush(&self) -> HashMap<Key, RequestStats> {
        std::mem::take(&mut *self.table.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{ConnTuple, IpFamily};

    fn telemetry() -> Arc<Telemetry> {
        Arc::new(Telemetry::new())
    }

    fn aggregator(telemetry: &Arc<Telemetry>) -> Aggregator {
        Aggregator::new(100_000, Vec::new(), Arc::clone(telemetry))
    }

    fn tx(path: &str, method: Method, status: u16) -> Transaction {
        Transaction {
            tuple: ConnTuple {
                src_ip_high: 0,
                src_ip_low: 0x7f00_0001,
                dst_ip_high: 0,
                dst_ip_low: 0x7f00_0001,
                src_port: 40_000,
                dst_port: 8080,
                family: IpFamily::V4,
            },
            method,
            status_code: status,
            request_started: 1_000,
            response_last_seen: 51_000,
            request_fragment: format!("{} {} HTTP/1.1", method.as_str(), path).into_bytes(),
            owner_src_port: 40_000,
            tcp_seq: 0,
            static_tags: 0,
            dynamic_tags: Vec::new(),
        }
    }

    #[test]
    fn test_aggregate_and_flush() {
        let t = telemetry();
        let agg = aggregator(&t);

        let txs: Vec<Transaction> = (0..10)
            .flat_map(|i| {
                let path = format!("/endpoint/{i}");
                (0..10).map(move |_| tx(&path, Method::Get, 200))
            })
            .collect();
        agg.aggregate(txs);

        let stats = agg.flush();
        assert_eq!(stats.len(), 10);
        for entry in stats.values() {
            assert_eq!(entry.total_count(), 10);
        }
        assert_eq!(t.hits_2xx.get(), 100);
        assert_eq!(t.aggregations.get(), 10);

        // Flush is destructive.
        assert!(agg.flush().is_empty());
    }

    #[test]
    fn test_unknown_method_is_malformed() {
        let t = telemetry();
        let agg = aggregator(&t);

        agg.aggregate(vec![tx("/x", Method::Unknown, 200)]);

        assert!(agg.flush().is_empty());
        assert_eq!(t.malformed.get(), 1);
        assert_eq!(t.hits_2xx.get(), 0);
    }

    #[test]
    fn test_incomplete_is_malformed() {
        let t = telemetry();
        let agg = aggregator(&t);

        let mut missing_status = tx("/x", Method::Get, 200);
        missing_status.status_code = 0;
        let mut missing_response = tx("/x", Method::Get, 200);
        missing_response.response_last_seen = 0;

        agg.aggregate(vec![missing_status, missing_response]);

        assert!(agg.flush().is_empty());
        assert_eq!(t.malformed.get(), 2);
    }

    #[test]
    fn test_inverted_timestamps_are_malformed() {
        let t = telemetry();
        let agg = aggregator(&t);

        let mut bad = tx("/x", Method::Get, 200);
        bad.request_started = 9_000;
        bad.response_last_seen = 1_000;
        agg.aggregate(vec![bad]);

        assert!(agg.flush().is_empty());
        assert_eq!(t.malformed.get(), 1);
    }

    #[test]
    fn test_status_out_of_range_is_malformed() {
        let t = telemetry();
        let agg = aggregator(&t);

        let mut bad = tx("/x", Method::Get, 200);
        bad.status_code = 99;
        let mut bad2 = tx("/x", Method::Get, 200);
        bad2.status_code = 700;
        agg.aggregate(vec![bad, bad2]);

        assert!(agg.flush().is_empty());
        assert_eq!(t.malformed.get(), 2);
    }

    #[test]
    fn test_unparsable_path_is_malformed() {
        let t = telemetry();
        let agg = aggregator(&t);

        let mut bad = tx("/x", Method::Get, 200);
        bad.request_fragment = b"garbage-without-a-path".to_vec();
        agg.aggregate(vec![bad]);

        assert!(agg.flush().is_empty());
        assert_eq!(t.malformed.get(), 1);
    }

    #[test]
    fn test_reject_filter() {
        let t = telemetry();
        let agg = Aggregator::new(100_000, vec!["/internal/".into()], Arc::clone(&t));

        agg.aggregate(vec![
            tx("/internal/healthz", Method::Get, 200),
            tx("/api/users", Method::Get, 200),
        ]);

        let stats = agg.flush();
        assert_eq!(stats.len(), 1);
        assert_eq!(t.rejected.get(), 1);
        assert_eq!(t.hits_2xx.get(), 1);
    }

    #[test]
    fn test_capacity_drops_new_keys_only() {
        let t = telemetry();
        let agg = Aggregator::new(2, Vec::new(), Arc::clone(&t));

        agg.aggregate(vec![
            tx("/a", Method::Get, 200),
            tx("/b", Method::Get, 200),
            tx("/c", Method::Get, 200), // table full: dropped
            tx("/a", Method::Get, 500), // existing key: still aggregated
        ]);

        let stats = agg.flush();
        assert_eq!(stats.len(), 2);
        assert_eq!(t.dropped.get(), 1);

        let a = &stats[&Key {
            path: "/a".into(),
            method: Method::Get,
        }];
        assert!(a.has_stats(200));
        assert!(a.has_stats(500));
    }

    #[test]
    fn test_status_class_buckets() {
        let t = telemetry();
        let agg = aggregator(&t);

        agg.aggregate(vec![
            tx("/a", Method::Get, 200),
            tx("/a", Method::Get, 204),
            tx("/a", Method::Get, 404),
        ]);

        let stats = agg.flush();
        let a = &stats[&Key {
            path: "/a".into(),
            method: Method::Get,
        }];
        assert_eq!(a.class(200).map(|b| b.count), Some(2));
        assert_eq!(a.class(400).map(|b| b.count), Some(1));
        assert!(a.class(500).is_none());
        assert_eq!(a.total_count(), 3);
    }

    #[test]
    fn test_methods_key_separately() {
        let t = telemetry();
        let agg = aggregator(&t);

        agg.aggregate(vec![
            tx("/a", Method::Get, 200),
            tx("/a", Method::Post, 200),
        ]);

        assert_eq!(agg.flush().len(), 2);
    }

    #[test]
    fn test_latency_digest_and_timestamps() {
        let t = telemetry();
        let agg = aggregator(&t);

        let mut fast = tx("/a", Method::Get, 200);
        fast.request_started = 2_000;
        fast.response_last_seen = 4_000; // 2us
        let mut slow = tx("/a", Method::Get, 200);
        slow.request_started = 500;
        slow.response_last_seen = 200_000_500; // 200ms

        agg.aggregate(vec![fast, slow]);

        let stats = agg.flush();
        let bucket = stats[&Key {
            path: "/a".into(),
            method: Method::Get,
        }]
        .class(200)
        .expect("bucket exists")
        .clone();

        assert_eq!(bucket.latency.count(), 2);
        assert_eq!(bucket.latency.buckets()[1], 1); // 1us-10us
        assert_eq!(bucket.latency.buckets()[6], 1); // 100ms-1s
        assert_eq!(bucket.first_seen_ns, 500);
        assert_eq!(bucket.last_seen_ns, 2_000);
    }

    #[test]
    fn test_zero_request_start_keeps_first_seen() {
        let t = telemetry();
        let agg = aggregator(&t);

        // request_started == 0 is a legal timestamp and must survive as the
        // earliest bound once a later transaction arrives.
        let mut boot = tx("/a", Method::Get, 200);
        boot.request_started = 0;
        boot.response_last_seen = 1_000;
        let mut later = tx("/a", Method::Get, 200);
        later.request_started = 500;
        later.response_last_seen = 2_000;

        agg.aggregate(vec![boot, later]);

        let stats = agg.flush();
        let bucket = stats[&Key {
            path: "/a".into(),
            method: Method::Get,
        }]
        .class(200)
        .expect("bucket exists")
        .clone();

        assert_eq!(bucket.first_seen_ns, 0);
        assert_eq!(bucket.last_seen_ns, 500);
    }

    #[test]
    fn test_tag_unions() {
        let t = telemetry();
        let agg = aggregator(&t);

        let mut a = tx("/a", Method::Get, 200);
        a.static_tags = 0b01;
        a.dynamic_tags = vec!["tls.openssl".into()];
        let mut b = tx("/a", Method::Get, 200);
        b.static_tags = 0b10;
        b.dynamic_tags = vec!["tls.openssl".into(), "tls.v1.3".into()];

        agg.aggregate(vec![a, b]);

        let stats = agg.flush();
        let bucket = stats[&Key {
            path: "/a".into(),
            method: Method::Get,
        }]
        .class(200)
        .expect("bucket exists")
        .clone();

        assert_eq!(bucket.static_tags, 0b11);
        assert_eq!(bucket.dynamic_tags.len(), 2);
    }

    #[test]
    fn test_record_misses() {
        let t = telemetry();
        let agg = aggregator(&t);

        agg.record_misses(15);
        agg.record_misses(0);
        assert_eq!(t.misses.get(), 15);
    }

    #[test]
    fn test_hit_counters_bounded_by_ingested() {
        let t = telemetry();
        let agg = aggregator(&t);

        agg.aggregate(vec![
            tx("/a", Method::Get, 200),
            tx("/b", Method::Get, 404),
            tx("/c", Method::Unknown, 200),
        ]);

        let snap = t.snapshot();
        let hits: u64 = ["hits1xx", "hits2xx", "hits3xx", "hits4xx", "hits5xx"]
            .iter()
            .map(|k| snap[k])
            .sum();
        assert_eq!(hits, 2);
        assert_eq!(snap["malformed"], 1);
    }
}
