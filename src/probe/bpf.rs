//! Kernel probe loading, attachment, and page map access.
//!
//! Implements [`PageStore`] on top of the probe's BPF maps using aya and
//! bridges the per-CPU perf channel into a tokio mpsc channel of
//! [`Notification`]s. All code is gated behind `#[cfg(feature = "bpf")]`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::hash_map::HashMap as BpfHashMap;
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::MapData;
use aya::programs::KProbe;
use aya::util::online_cpus;
use aya::Ebpf;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::wire::{self, NOTIFICATION_SIZE, PAGE_BYTES, TX_RECORD_SIZE};
use super::{MapLookupError, Notification, Page, PageStore};

/// Map holding the per-CPU page rings, keyed by `(cpu, page_num)`.
const PAGES_MAP: &str = "http_pages";
/// Perf event array carrying page-fill notifications.
const NOTIFICATIONS_MAP: &str = "http_notifications";
/// Map of in-progress transactions keyed by connection tuple.
const IN_FLIGHT_MAP: &str = "http_in_flight";

/// Kprobe programs the probe object must contain, with their attach symbols.
/// `kretprobe_` sections are detected by aya and attached as return probes.
const KPROBES: &[(&str, &str)] = &[
    ("kprobe_tcp_sendmsg", "tcp_sendmsg"),
    ("kretprobe_tcp_sendmsg", "tcp_sendmsg"),
    ("kprobe_tcp_recvmsg", "tcp_recvmsg"),
    ("kretprobe_tcp_recvmsg", "tcp_recvmsg"),
    ("kprobe_tcp_close", "tcp_close"),
];

/// Capacity of the bridged notification channel. Perf-side drops surface as
/// `idx` gaps, which the batch manager already tolerates.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 4096;

/// BPF map key for the pages map (matches `http_page_key_t` in the probe).
#[repr(C)]
#[derive(Clone, Copy)]
struct RawPageKey {
    cpu: u32,
    num: u32,
}

// SAFETY: RawPageKey is a plain C struct with no padding.
unsafe impl aya::Pod for RawPageKey {}

/// BPF map value for the pages map: one raw page buffer.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawPage {
    bytes: [u8; PAGE_BYTES],
}

// SAFETY: RawPage is a byte array; any bit pattern is valid.
unsafe impl aya::Pod for RawPage {}

/// BPF map key for the in-flight map: an opaque connection tuple.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawConnKey {
    bytes: [u8; 40],
}

// SAFETY: RawConnKey is a byte array; any bit pattern is valid.
unsafe impl aya::Pod for RawConnKey {}

/// BPF map value for the in-flight map: one raw transaction record.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawTxRecord {
    bytes: [u8; TX_RECORD_SIZE],
}

// SAFETY: RawTxRecord is a byte array; any bit pattern is valid.
unsafe impl aya::Pod for RawTxRecord {}

/// Manages the loaded BPF object and the notification reader tasks.
pub struct BpfProbe {
    perf_buffer_pages: usize,
    ebpf: Option<Arc<parking_lot::Mutex<Ebpf>>>,
    read_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl BpfProbe {
    pub fn new(perf_buffer_pages: usize) -> Self {
        Self {
            perf_buffer_pages,
            ebpf: None,
            read_tasks: Vec::new(),
        }
    }

    /// Loads the probe object, attaches its programs, and starts the
    /// notification readers. Returns the page store handle and the bridged
    /// notification channel.
    pub async fn start(
        &mut self,
        object_path: &Path,
        ctx: CancellationToken,
    ) -> Result<(BpfPageStore, mpsc::Receiver<Notification>)> {
        let mut ebpf = Ebpf::load_file(object_path)
            .with_context(|| format!("loading BPF object {}", object_path.display()))?;

        for (prog_name, symbol) in KPROBES {
            attach_kprobe(&mut ebpf, prog_name, symbol)?;
        }

        let cpus = online_cpus().map_err(|e| anyhow::anyhow!("reading online CPUs: {e:?}"))?;
        let num_cpus = cpus.len();

        // Take the perf map out for the reader tasks.
        let notifications_map = ebpf
            .take_map(NOTIFICATIONS_MAP)
            .ok_or_else(|| anyhow::anyhow!("{NOTIFICATIONS_MAP} map not found"))?;
        let mut perf = AsyncPerfEventArray::try_from(notifications_map)
            .context("creating perf event array")?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);

        for cpu in cpus {
            let mut buf = perf
                .open(cpu, Some(self.perf_buffer_pages))
                .with_context(|| format!("opening perf buffer for cpu {cpu}"))?;
            let tx = tx.clone();
            let ctx = ctx.clone();

            self.read_tasks.push(tokio::spawn(async move {
                // Sized well past NOTIFICATION_SIZE; aya counts events that
                // do not fit a buffer as lost.
                let mut buffers: Vec<BytesMut> = (0..16)
                    .map(|_| BytesMut::with_capacity(NOTIFICATION_SIZE + 512))
                    .collect();

                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => return,
                        events = buf.read_events(&mut buffers) => {
                            let events = match events {
                                Ok(events) => events,
                                Err(e) => {
                                    tracing::warn!(cpu, error = %e, "perf read error");
                                    continue;
                                }
                            };

                            if events.lost > 0 {
                                tracing::warn!(
                                    cpu,
                                    lost = events.lost,
                                    "perf buffer overflow, notifications dropped",
                                );
                            }

                            for buffer in buffers.iter().take(events.read) {
                                match wire::parse_notification(buffer) {
                                    Ok(n) => {
                                        if tx.try_send(n).is_err() {
                                            tracing::warn!(
                                                cpu,
                                                "notification channel full, dropping",
                                            );
                                        }
                                    }
                                    Err(e) => {
                                        tracing::debug!(cpu, error = %e, "bad notification");
                                    }
                                }
                            }
                        }
                    }
                }
            }));
        }

        let ebpf = Arc::new(parking_lot::Mutex::new(ebpf));
        self.ebpf = Some(Arc::clone(&ebpf));

        tracing::info!(num_cpus, "BPF probe started");

        Ok((BpfPageStore { ebpf, num_cpus }, rx))
    }

    /// Waits for the reader tasks and drops the BPF object, detaching all
    /// programs. The reader tasks exit when the CancellationToken fires.
    pub async fn stop(&mut self) {
        for task in self.read_tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "perf reader join failed");
            }
        }

        self.ebpf = None;

        tracing::info!("BPF probe stopped");
    }
}

/// [`PageStore`] backed by the probe's BPF maps.
#[derive(Clone)]
pub struct BpfPageStore {
    ebpf: Arc<parking_lot::Mutex<Ebpf>>,
    num_cpus: usize,
}

impl PageStore for BpfPageStore {
    fn lookup(&self, cpu: u32, page_num: u32) -> Result<Page, MapLookupError> {
        let err = |reason: String| MapLookupError {
            cpu,
            page_num,
            reason,
        };

        let ebpf = self.ebpf.lock();
        let map = ebpf
            .map(PAGES_MAP)
            .ok_or_else(|| err(format!("{PAGES_MAP} map not found")))?;
        let pages: BpfHashMap<&MapData, RawPageKey, RawPage> =
            BpfHashMap::try_from(map).map_err(|e| err(e.to_string()))?;

        let raw = pages
            .get(&RawPageKey { cpu, num: page_num }, 0)
            .map_err(|e| err(e.to_string()))?;

        wire::parse_page(&raw.bytes).map_err(|e| err(e.to_string()))
    }

    fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    fn purge_idle(&self, ttl: Duration) -> usize {
        let cutoff = monotonic_ns().saturating_sub(ttl.as_nanos() as u64);
        let mut ebpf = self.ebpf.lock();

        // Phase 1: collect expired keys.
        let expired: Vec<RawConnKey> = {
            let Some(map) = ebpf.map(IN_FLIGHT_MAP) else {
                return 0;
            };
            let Ok(in_flight) =
                BpfHashMap::<&MapData, RawConnKey, RawTxRecord>::try_from(map)
            else {
                return 0;
            };

            in_flight
                .iter()
                .filter_map(|entry| entry.ok())
                .filter(|(_, raw)| {
                    let tx = wire::parse_transaction(&raw.bytes);
                    tx.incomplete() && tx.request_started < cutoff
                })
                .map(|(key, _)| key)
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        // Phase 2: delete.
        let Some(map) = ebpf.map_mut(IN_FLIGHT_MAP) else {
            return 0;
        };
        let Ok(mut in_flight) =
            BpfHashMap::<&mut MapData, RawConnKey, RawTxRecord>::try_from(map)
        else {
            return 0;
        };

        let mut purged = 0;
        for key in &expired {
            match in_flight.remove(key) {
                Ok(()) => purged += 1,
                Err(e) => {
                    tracing::debug!(error = %e, "in-flight entry removal failed");
                }
            }
        }

        purged
    }
}

/// Attach a kprobe or kretprobe program by name.
fn attach_kprobe(ebpf: &mut Ebpf, prog_name: &str, symbol: &str) -> Result<()> {
    let prog: &mut KProbe = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("kprobe program '{prog_name}' not found"))?
        .try_into()
        .with_context(|| format!("'{prog_name}' is not a kprobe program"))?;
    prog.load()
        .with_context(|| format!("loading kprobe {symbol}"))?;
    prog.attach(symbol, 0)
        .with_context(|| format!("attaching kprobe {symbol}"))?;

    tracing::debug!(program = prog_name, symbol, "attached kprobe");
    Ok(())
}

/// Returns current CLOCK_MONOTONIC value in nanoseconds, the clock the
/// probe stamps transactions with.
fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and does
    // not require any Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}
