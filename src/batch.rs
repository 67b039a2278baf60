//! The batch manager: turns page-fill notifications and poll ticks into
//! deduplicated transaction streams.
//!
//! The kernel writes transactions into a bounded ring of pages per CPU and
//! never waits for userspace. All the consumer owns is one cursor
//! `{idx, pos}` per CPU: pages `[0, idx)` are fully consumed and
//! transactions `[0, pos)` of page `idx` are consumed. Two drain paths share
//! that cursor:
//!
//! - [`BatchManager::drain_notification`] reads the page named by a
//!   notification and delivers whatever the cursor has not yet covered.
//! - [`BatchManager::drain_pending`] sweeps every CPU's current page on a
//!   timer and harvests partially-filled pages early.
//!
//! The cursor makes the two paths commutative: whichever sees a transaction
//! first delivers it, and the other skips it. A slot whose observed `idx`
//! differs from the notification's has been recycled by the producer; its
//! contents are gone and are only accounted for, never re-read.

use thiserror::Error;

use crate::probe::{MapLookupError, Notification, PageStore, PAGE_COUNT, PAGE_SIZE};
use crate::transaction::Transaction;

/// Upper bound on consecutive page reads per CPU in one pending sweep.
pub const MAX_LOOKUPS_PER_CPU: usize = 2;

/// Userspace consumption position for one CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    idx: u64,
    pos: usize,
}

/// Errors surfaced by the notification drain path.
#[derive(Error, Debug)]
pub enum BatchError {
    /// The notified page slot was recycled before we could read it. The
    /// cursor is left untouched; a later notification reconciles it.
    #[error("page overwritten by producer: {lost} transactions lost")]
    LostBatch { lost: u64 },

    #[error(transparent)]
    MapLookup(#[from] MapLookupError),
}

/// Result of a successful notification drain.
#[derive(Debug, Default)]
pub struct DrainedBatch {
    pub transactions: Vec<Transaction>,
    /// Transactions skipped because whole pages went by between the cursor
    /// and the notified page (dropped notifications, slow consumer).
    pub skipped: u64,
}

/// Owns the per-CPU cursors and the page store handle.
///
/// Not internally synchronized: all mutation is expected to happen on the
/// monitor's single worker.
pub struct BatchManager<S> {
    store: S,
    cursors: Vec<Cursor>,
}

impl<S: PageStore> BatchManager<S> {
    pub fn new(store: S) -> Self {
        let cursors = vec![Cursor::default(); store.num_cpus()];
        Self { store, cursors }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Drains the page a notification points at. Called exactly once per
    /// received notification.
    pub fn drain_notification(&mut self, n: Notification) -> Result<DrainedBatch, BatchError> {
        let Some(cursor) = self.cursors.get(n.cpu as usize).copied() else {
            // CPU outside the range the store reported at startup.
            return Ok(DrainedBatch::default());
        };

        let slot = (n.idx % PAGE_COUNT as u64) as u32;
        let mut page = self.store.lookup(n.cpu, slot)?;

        if page.idx < cursor.idx {
            // The poll path already consumed this page.
            return Ok(DrainedBatch::default());
        }

        if page.idx != n.idx {
            // The slot was recycled between the notification and our lookup.
            let lost = if cursor.idx == n.idx {
                (PAGE_SIZE - cursor.pos) as u64
            } else {
                PAGE_SIZE as u64
            };
            return Err(BatchError::LostBatch { lost });
        }

        // page.idx == n.idx >= cursor.idx: deliver whatever the cursor has
        // not covered. If the cursor sits on this very page the poll path
        // drained the prefix [0, pos); otherwise entire pages were skipped.
        let (offset, skipped) = if page.idx == cursor.idx {
            (cursor.pos, 0)
        } else {
            (0, (page.idx - cursor.idx) * PAGE_SIZE as u64 - cursor.pos as u64)
        };

        self.cursors[n.cpu as usize] = Cursor {
            idx: n.idx + 1,
            pos: 0,
        };

        Ok(DrainedBatch {
            transactions: page.txs.split_off(offset),
            skipped,
        })
    }

    /// Sweeps every CPU's current page for transactions written since the
    /// last visit, advancing cursors past any page found already full.
    pub fn drain_pending(&mut self) -> Vec<Transaction> {
        let mut out = Vec::with_capacity(PAGE_SIZE * PAGE_COUNT / 2);

        for cpu in 0..self.cursors.len() {
            for _ in 0..MAX_LOOKUPS_PER_CPU {
                let cursor = self.cursors[cpu];
                let slot = (cursor.idx % PAGE_COUNT as u64) as u32;

                let page = match self.store.lookup(cpu as u32, slot) {
                    Ok(page) => page,
                    // Not ready; back off to the next CPU.
                    Err(_) => break,
                };

                let pos = usize::from(page.pos);
                if page.idx != cursor.idx || pos <= cursor.pos {
                    break;
                }

                out.extend(
                    page.txs
                        .into_iter()
                        .skip(cursor.pos)
                        .take(pos - cursor.pos),
                );

                if pos == PAGE_SIZE {
                    // Full page seen before its notification was processed.
                    // Advance and try to grab the next page preemptively.
                    self.cursors[cpu] = Cursor {
                        idx: cursor.idx + 1,
                        pos: 0,
                    };
                    continue;
                }

                self.cursors[cpu].pos = pos;
                break;
            }
        }

        out
    }
}
