/// Number of histogram buckets.
pub const NUM_BUCKETS: usize = 10;

/// Histogram bucket boundaries in nanoseconds.
/// 10 buckets: <1us, 1us-10us, 10us-100us, 100us-1ms, 1ms-10ms,
/// 10ms-100ms, 100ms-1s, 1s-10s, 10s-100s, 100s+.
const BOUNDARIES: [u64; 9] = [
    1_000,           // 1 microsecond
    10_000,          // 10 microseconds
    100_000,         // 100 microseconds
    1_000_000,       // 1 millisecond
    10_000_000,      // 10 milliseconds
    100_000_000,     // 100 milliseconds
    1_000_000_000,   // 1 second
    10_000_000_000,  // 10 seconds
    100_000_000_000, // 100 seconds
];

/// Exponential latency histogram used as the per-endpoint latency digest.
/// Lives inside the aggregation table, so mutation happens under the
/// aggregator's lock and needs no atomics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    buckets: [u64; NUM_BUCKETS],
    sum_ns: u64,
    count: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a latency value in nanoseconds.
    pub fn record(&mut self, value_ns: u64) {
        self.buckets[bucket_index(value_ns)] += 1;
        self.sum_ns = self.sum_ns.saturating_add(value_ns);
        self.count += 1;
    }

    /// Folds another histogram into this one.
    pub fn merge(&mut self, other: &Histogram) {
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
        self.sum_ns = self.sum_ns.saturating_add(other.sum_ns);
        self.count += other.count;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum_ns(&self) -> u64 {
        self.sum_ns
    }

    /// Returns the bucket counts: [<1us, 1us-10us, ..., 100s+].
    pub fn buckets(&self) -> [u64; NUM_BUCKETS] {
        self.buckets
    }
}

/// Returns the bucket index for a given value in nanoseconds.
fn bucket_index(value_ns: u64) -> usize {
    // Linear scan is fine for 9 boundaries.
    for (i, &boundary) in BOUNDARIES.iter().enumerate() {
        if value_ns < boundary {
            return i;
        }
    }
    9 // +inf bucket
}

/// Returns the upper bounds for each bucket in nanoseconds.
/// The last bucket (index 9) is unbounded (+inf, represented as 0).
pub fn bucket_boundaries() -> [u64; NUM_BUCKETS] {
    [
        BOUNDARIES[0],
        BOUNDARIES[1],
        BOUNDARIES[2],
        BOUNDARIES[3],
        BOUNDARIES[4],
        BOUNDARIES[5],
        BOUNDARIES[6],
        BOUNDARIES[7],
        BOUNDARIES[8],
        0, // +inf
    ]
}
