pub mod wire;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::time::Duration;

use thiserror::Error;

use crate::transaction::Transaction;

/// Number of transactions a completed page carries.
pub const PAGE_SIZE: usize = 15;

/// Number of page slots in each CPU's ring. A page with sequence `idx`
/// occupies slot `idx % PAGE_COUNT`.
pub const PAGE_COUNT: usize = 15;

/// Record emitted by the kernel probe when a page fills. Delivered per-CPU
/// in strict `idx` order; gaps mean notifications were dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub cpu: u32,
    pub idx: u64,
}

/// A point-in-time copy of one page of the kernel batch map.
///
/// `idx` is the monotonic page sequence for the owning CPU, `pos` the number
/// of transactions the kernel has written so far. `txs` always holds
/// `PAGE_SIZE` decoded records; entries at and beyond `pos` are stale or
/// zeroed and must not be consumed.
#[derive(Debug, Clone)]
pub struct Page {
    pub idx: u64,
    pub pos: u8,
    pub txs: Vec<Transaction>,
}

/// Failure to read a page out of the kernel map.
#[derive(Error, Debug)]
#[error("page lookup failed for cpu={cpu} page={page_num}: {reason}")]
pub struct MapLookupError {
    pub cpu: u32,
    pub page_num: u32,
    pub reason: String,
}

/// Read access to the kernel's per-CPU page ring.
///
/// `lookup` must return a copy and must be safe to call concurrently with
/// kernel writes; the producer is never blocked. Correctness against
/// concurrent overwrites is entirely the caller's job (the cursor/dirty
/// protocol in [`crate::batch`]).
pub trait PageStore: Send + 'static {
    /// Copy the page at `(cpu, page_num)` out of the store.
    /// `page_num` is the ring slot, i.e. `idx % PAGE_COUNT`.
    fn lookup(&self, cpu: u32, page_num: u32) -> Result<Page, MapLookupError>;

    /// Number of CPUs the producer writes pages for.
    fn num_cpus(&self) -> usize;

    /// Drop in-flight (incomplete) kernel-side entries idle for longer than
    /// `ttl`. Returns the number of purged entries. Stores without an
    /// in-flight table purge nothing.
    fn purge_idle(&self, _ttl: Duration) -> usize {
        0
    }
}
