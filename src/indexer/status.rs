// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-flight indexing state shared between the indexer and readers.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Snapshot of indexing progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingStatus {
    pub in_progress: bool,
    /// Files queued for embedding in the current run
    pub total_files: usize,
    pub processed_files: usize,
    pub percentage: u8,
}

impl IndexingStatus {
    fn recompute(&mut self) {
        self.percentage = if self.total_files == 0 {
            0
        } else {
            ((self.processed_files as f64 / self.total_files as f64) * 100.0)
                .round()
                .min(100.0) as u8
        };
    }
}

/// Why a run or a clear could not start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Busy {
    Indexing(IndexingStatus),
    Clearing,
}

/// Indexing state plus an independent cache-clear flag.
///
/// `begin_run` checks the clear flag under the state lock; `begin_clear`
/// raises the flag first and then checks the state under the same lock, so
/// a run and a clear can never both start.
#[derive(Debug, Default)]
pub struct StatusCell {
    state: Mutex<IndexingStatus>,
    clearing: AtomicBool,
}

impl StatusCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> IndexingStatus {
        self.state.lock().clone()
    }

    pub fn is_indexing(&self) -> bool {
        self.state.lock().in_progress
    }

    /// Atomically moves Idle -> Indexing.
    pub fn begin_run(self: &Arc<Self>) -> Result<RunGuard, Busy> {
        let mut state = self.state.lock();
        if state.in_progress {
            return Err(Busy::Indexing(state.clone()));
        }
        if self.clearing.load(Ordering::SeqCst) {
            return Err(Busy::Clearing);
        }
        *state = IndexingStatus {
            in_progress: true,
            ..IndexingStatus::default()
        };
        Ok(RunGuard {
            cell: Arc::clone(self),
        })
    }

    /// Raises the clear flag unless a clear or a run is already active.
    pub fn begin_clear(self: &Arc<Self>) -> Result<ClearGuard, Busy> {
        if self
            .clearing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Busy::Clearing);
        }
        let guard = ClearGuard {
            cell: Arc::clone(self),
        };
        let state = self.state.lock();
        if state.in_progress {
            return Err(Busy::Indexing(state.clone()));
        }
        drop(state);
        Ok(guard)
    }
}

/// Held for the duration of a run; returns the cell to Idle when dropped.
#[derive(Debug)]
pub struct RunGuard {
    cell: Arc<StatusCell>,
}

impl RunGuard {
    pub fn set_total(&self, total: usize) {
        let mut state = self.cell.state.lock();
        state.total_files = total;
        state.processed_files = 0;
        state.recompute();
    }

    pub fn advance(&self) {
        let mut state = self.cell.state.lock();
        state.processed_files = (state.processed_files + 1).min(state.total_files);
        state.recompute();
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        *self.cell.state.lock() = IndexingStatus::default();
    }
}

/// Held for the duration of a cache clear.
#[derive(Debug)]
pub struct ClearGuard {
    cell: Arc<StatusCell>,
}

impl Drop for ClearGuard {
    fn drop(&mut self) {
        self.cell.clearing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_run_is_rejected_with_snapshot() {
        let cell = StatusCell::new();
        let guard = cell.begin_run().unwrap();
        guard.set_total(100);
        for _ in 0..42 {
            guard.advance();
        }

        match cell.begin_run() {
            Err(Busy::Indexing(status)) => {
                assert!(status.in_progress);
                assert_eq!(status.percentage, 42);
            }
            other => panic!("unexpected {:?}", other),
        }

        drop(guard);
        assert_eq!(cell.snapshot(), IndexingStatus::default());
        assert!(cell.begin_run().is_ok());
    }

    #[test]
    fn clear_and_run_exclude_each_other() {
        let cell = StatusCell::new();
        let run = cell.begin_run().unwrap();
        assert!(matches!(cell.begin_clear(), Err(Busy::Indexing(_))));
        // A rejected clear leaves the flag down.
        assert!(!cell.clearing.load(Ordering::SeqCst));
        drop(run);

        let clear = cell.begin_clear().unwrap();
        assert!(matches!(cell.begin_clear(), Err(Busy::Clearing)));
        assert!(matches!(cell.begin_run(), Err(Busy::Clearing)));
        drop(clear);
        assert!(cell.begin_run().is_ok());
    }

    #[test]
    fn percentage_handles_empty_runs() {
        let cell = StatusCell::new();
        let guard = cell.begin_run().unwrap();
        guard.set_total(0);
        guard.advance();
        assert_eq!(cell.snapshot().percentage, 0);
        assert_eq!(cell.snapshot().processed_files, 0);
    }
}
