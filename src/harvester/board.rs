//! Batch status board: the single serialization point for status transitions.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use crate::types::{Batch, BatchStatus, RunResult};

struct BoardState {
    batches: Vec<Batch>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Shared, mutable view of every batch of a run
///
/// All transitions go through one lock, so two workers can never race on the same
/// batch. The lock is never held across an await point.
pub(crate) struct BatchBoard {
    state: Mutex<BoardState>,
}

impl BatchBoard {
    pub(crate) fn new(plan: Vec<Batch>) -> Self {
        Self {
            state: Mutex::new(BoardState {
                batches: plan,
                in_flight: 0,
                peak_in_flight: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        // A panic while holding the lock cannot leave a half-applied transition behind
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pending -> InFlight for attempt `attempt`
    pub(crate) fn begin_attempt(&self, index: usize, attempt: u32) {
        let mut state = self.lock();
        let Some(batch) = state.batches.get_mut(index) else {
            tracing::error!(batch = index, "Attempt for unknown batch");
            return;
        };
        debug_assert_eq!(
            batch.status,
            BatchStatus::Pending,
            "batch {index} started while not pending"
        );
        batch.status = BatchStatus::InFlight;
        batch.attempts = attempt;
        state.in_flight += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
    }

    /// InFlight -> Pending while waiting out a backoff delay
    pub(crate) fn mark_retry_wait(&self, index: usize, error: String) {
        self.finish_attempt(index, BatchStatus::Pending, None, Some(error));
    }

    /// InFlight -> Succeeded
    pub(crate) fn mark_succeeded(&self, index: usize, attempts: u32) {
        self.finish_attempt(index, BatchStatus::Succeeded, Some(attempts), None);
    }

    /// InFlight -> Failed, retaining the last error
    pub(crate) fn mark_failed(&self, index: usize, attempts: u32, error: String) {
        self.finish_attempt(index, BatchStatus::Failed, Some(attempts), Some(error));
    }

    /// Leave the batch Pending after cancellation
    pub(crate) fn mark_abandoned(&self, index: usize, last_error: Option<String>) {
        self.finish_attempt(index, BatchStatus::Pending, None, last_error);
    }

    /// Pending -> Succeeded for a batch whose artifact survives from a previous run
    pub(crate) fn mark_resumed(&self, index: usize) {
        let mut state = self.lock();
        if let Some(batch) = state.batches.get_mut(index) {
            batch.status = BatchStatus::Succeeded;
        }
    }

    fn finish_attempt(
        &self,
        index: usize,
        status: BatchStatus,
        attempts: Option<u32>,
        error: Option<String>,
    ) {
        let mut state = self.lock();
        let Some(batch) = state.batches.get_mut(index) else {
            return;
        };
        let was_in_flight = batch.status == BatchStatus::InFlight;
        batch.status = status;
        if let Some(attempts) = attempts {
            batch.attempts = attempts;
        }
        if error.is_some() {
            batch.last_error = error;
        }
        if was_in_flight {
            state.in_flight -= 1;
        }
    }

    /// Highest number of simultaneously in-flight batches observed
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    /// Copy of every batch in index order
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<Batch> {
        self.lock().batches.clone()
    }

    /// Freeze the board into a run result
    pub(crate) fn into_result(self, resumed: BTreeSet<usize>) -> RunResult {
        let state = self.state.into_inner().unwrap_or_else(|e| e.into_inner());
        RunResult::from_batches(state.batches, resumed)
    }
}
