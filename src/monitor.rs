//! Monitor: bridges the notification channel and the poll timer into the
//! batch manager, feeds the aggregator, and exposes the public read API.
//!
//! One background worker owns the batch manager (and with it every cursor);
//! readers only touch the aggregator's lock and the telemetry atomics, so
//! `http_stats`/`telemetry_stats` are safe from any thread while the worker
//! runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchError, BatchManager};
use crate::config::Config;
use crate::health::HealthMetrics;
use crate::probe::{Notification, PageStore};
use crate::stats::{Aggregator, Key, RequestStats};
use crate::telemetry::Telemetry;

/// Upper bound on notifications handled per worker wakeup.
const NOTIFICATION_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Stopped,
}

/// Everything the worker takes ownership of at start.
struct Ingest<S> {
    manager: BatchManager<S>,
    notifications: mpsc::Receiver<Notification>,
}

/// Timer settings the worker runs with.
#[derive(Clone, Copy)]
struct Cadence {
    poll_interval: Duration,
    map_cleaner_interval: Duration,
    idle_connection_ttl: Duration,
    report_interval: Duration,
}

pub struct Monitor<S> {
    state: State,
    cadence: Cadence,
    telemetry: Arc<Telemetry>,
    aggregator: Arc<Aggregator>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    ingest: Option<Ingest<S>>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl<S: PageStore> Monitor<S> {
    /// Wires a monitor to a page store and a notification channel.
    /// Fails fast on invalid configuration; no background work starts here.
    pub fn new(
        cfg: &Config,
        store: S,
        notifications: mpsc::Receiver<Notification>,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        cfg.validate()?;

        if store.num_cpus() == 0 {
            bail!("page store reports zero CPUs");
        }

        let telemetry = Arc::new(Telemetry::new());
        let aggregator = Arc::new(Aggregator::new(
            cfg.max_aggregation_entries,
            cfg.reject_path_prefixes.clone(),
            Arc::clone(&telemetry),
        ));

        Ok(Self {
            state: State::Created,
            cadence: Cadence {
                poll_interval: cfg.poll_interval,
                map_cleaner_interval: cfg.map_cleaner_interval,
                idle_connection_ttl: cfg.idle_connection_ttl,
                report_interval: cfg.report_interval,
            },
            telemetry,
            aggregator,
            health,
            cancel: CancellationToken::new(),
            ingest: Some(Ingest {
                manager: BatchManager::new(store),
                notifications,
            }),
            worker: None,
        })
    }

    /// Spawns the worker. Valid only once, from the freshly-created state.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != State::Created {
            bail!("monitor cannot start from state {:?}", self.state);
        }

        let ingest = self.ingest.take().expect("ingest present in Created state");
        let aggregator = Arc::clone(&self.aggregator);
        let telemetry = Arc::clone(&self.telemetry);
        let health = Arc::clone(&self.health);
        let cadence = self.cadence;
        let cancel = self.cancel.clone();

        self.worker = Some(tokio::spawn(run_loop(
            ingest, aggregator, telemetry, health, cadence, cancel,
        )));
        self.state = State::Running;

        info!(
            poll_interval = ?self.cadence.poll_interval,
            map_cleaner_interval = ?self.cadence.map_cleaner_interval,
            idle_connection_ttl = ?self.cadence.idle_connection_ttl,
            "monitor started",
        );

        Ok(())
    }

    /// Stops the worker after a final pending sweep. Idempotent.
    pub async fn stop(&mut self) {
        if self.state == State::Running {
            self.cancel.cancel();
            if let Some(worker) = self.worker.take() {
                if let Err(e) = worker.await {
                    warn!(error = %e, "monitor worker join failed");
                }
            }
            info!("monitor stopped");
        }
        self.state = State::Stopped;
    }

    /// Returns the accumulated per-endpoint statistics and clears the table.
    pub fn http_stats(&self) -> HashMap<Key, RequestStats> {
        let stats = self.aggregator.flush();
        self.health.stat_flushes.inc();
        self.health.flushed_keys.set(stats.len() as f64);
        stats
    }

    /// Returns the telemetry counter totals.
    pub fn telemetry_stats(&self) -> HashMap<&'static str, u64> {
        self.telemetry.snapshot()
    }
}

async fn run_loop<S: PageStore>(
    ingest: Ingest<S>,
    aggregator: Arc<Aggregator>,
    telemetry: Arc<Telemetry>,
    health: Arc<HealthMetrics>,
    cadence: Cadence,
    cancel: CancellationToken,
) {
    let Ingest {
        mut manager,
        mut notifications,
    } = ingest;

    let mut poll_tick = tokio::time::interval(cadence.poll_interval);
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cleaner_tick = tokio::time::interval(cadence.map_cleaner_interval);
    cleaner_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut report_tick = tokio::time::interval(cadence.report_interval);
    report_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Intervals fire immediately once; consume those so the first real poll
    // and report happen one period in.
    poll_tick.tick().await;
    cleaner_tick.tick().await;
    report_tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Drain whatever the channel already holds, then run one
                // last sweep so partially-filled pages are not stranded.
                while let Ok(n) = notifications.try_recv() {
                    handle_notification(&mut manager, n, &aggregator, &health);
                }

                let pending = manager.drain_pending();
                if !pending.is_empty() {
                    health
                        .transactions_drained
                        .with_label_values(&["poll"])
                        .inc_by(pending.len() as f64);
                    aggregator.aggregate(pending);
                }

                telemetry.report();
                debug!("monitor worker exiting");
                return;
            }

            Some(n) = notifications.recv() => {
                handle_notification(&mut manager, n, &aggregator, &health);

                // Drain a few more without blocking; bursts arrive when the
                // producer is busy and every select round-trip costs us.
                for _ in 0..NOTIFICATION_BATCH - 1 {
                    match notifications.try_recv() {
                        Ok(n) => handle_notification(&mut manager, n, &aggregator, &health),
                        Err(_) => break,
                    }
                }
            }

            _ = poll_tick.tick() => {
                health.pending_sweeps.inc();
                let txs = manager.drain_pending();
                if !txs.is_empty() {
                    health
                        .transactions_drained
                        .with_label_values(&["poll"])
                        .inc_by(txs.len() as f64);
                    aggregator.aggregate(txs);
                }
            }

            _ = cleaner_tick.tick() => {
                let purged = manager.store().purge_idle(cadence.idle_connection_ttl);
                if purged > 0 {
                    health.inflight_purged.inc_by(purged as f64);
                    debug!(purged, "purged idle in-flight entries");
                }
            }

            _ = report_tick.tick() => {
                telemetry.report();
            }
        }
    }
}

fn handle_notification<S: PageStore>(
    manager: &mut BatchManager<S>,
    n: Notification,
    aggregator: &Aggregator,
    health: &HealthMetrics,
) {
    health.notifications_received.inc();

    match manager.drain_notification(n) {
        Ok(drained) => {
            aggregator.record_misses(drained.skipped);
            if !drained.transactions.is_empty() {
                health
                    .transactions_drained
                    .with_label_values(&["notification"])
                    .inc_by(drained.transactions.len() as f64);
                aggregator.aggregate(drained.transactions);
            }
        }
        Err(BatchError::LostBatch { lost }) => {
            health.pages_lost.inc();
            aggregator.record_misses(lost);
            debug!(cpu = n.cpu, idx = n.idx, lost, "page lost to producer overrun");
        }
        Err(BatchError::MapLookup(e)) => {
            health.map_lookup_failures.inc();
            warn!(error = %e, "page lookup failed on notification path");
        }
    }
}
