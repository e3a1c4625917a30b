//! Concurrent batch fetching with retry, bounded by `max_concurrency`.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::board::BatchBoard;
use crate::config::RetryConfig;
use crate::error::FetchError;
use crate::retry::{RetryOutcome, retry_with_backoff};
use crate::store::TempStore;
use crate::transport::PageFetcher;
use crate::types::{Batch, BatchRange, Event, RunResult, ServiceMetadata};

/// Drives every pending batch of a plan to a terminal state
///
/// Batches run as futures on the calling task through `buffer_unordered`, so at most
/// `max_concurrency` requests are outstanding at once. A batch waiting out a backoff
/// delay keeps its slot.
pub struct FetchScheduler {
    pub(crate) fetcher: Arc<dyn PageFetcher>,
    pub(crate) retry: RetryConfig,
    pub(crate) max_concurrency: usize,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) cancel: CancellationToken,
}

/// Borrowed state shared by every batch future of one run
struct RunContext<'a> {
    scheduler: &'a FetchScheduler,
    board: &'a BatchBoard,
    store: &'a TempStore,
    metadata: &'a ServiceMetadata,
}

impl FetchScheduler {
    /// Fetch every batch of `plan` not listed in `resumed`, storing each artifact
    ///
    /// Returns once every started batch is terminal, or once cancellation has stopped
    /// new work and in-flight requests have drained.
    pub async fn run(
        &self,
        metadata: &ServiceMetadata,
        plan: Vec<Batch>,
        store: &TempStore,
        resumed: BTreeSet<usize>,
    ) -> RunResult {
        let pending: Vec<(usize, BatchRange)> = plan
            .iter()
            .filter(|b| !resumed.contains(&b.index))
            .map(|b| (b.index, b.range))
            .collect();

        let board = BatchBoard::new(plan);
        for &index in &resumed {
            board.mark_resumed(index);
        }

        tracing::info!(
            service = %metadata.name,
            pending = pending.len(),
            resumed = resumed.len(),
            max_concurrency = self.max_concurrency,
            "Fetching batches"
        );

        let ctx = RunContext {
            scheduler: self,
            board: &board,
            store,
            metadata,
        };

        stream::iter(pending)
            .map(|(index, range)| ctx.run_batch(index, range))
            .buffer_unordered(self.max_concurrency.max(1))
            .collect::<Vec<()>>()
            .await;

        tracing::debug!(
            peak_in_flight = board.peak_in_flight(),
            "All batch futures drained"
        );

        board.into_result(resumed)
    }
}

impl RunContext<'_> {
    async fn run_batch(&self, index: usize, range: BatchRange) {
        let scheduler = self.scheduler;
        let board = self.board;

        let outcome = retry_with_backoff(
            &scheduler.retry,
            &scheduler.cancel,
            |attempt| async move {
                board.begin_attempt(index, attempt);
                scheduler
                    .event_tx
                    .send(Event::BatchStarted { index, attempt })
                    .ok();
                tracing::debug!(batch = index, %range, attempt, "Fetching batch");

                let payload = scheduler.fetcher.fetch_page(self.metadata, range).await?;
                self.store.write(index, &payload).await.map_err(|e| {
                    FetchError::Permanent(format!("failed to store artifact: {e}"))
                })?;
                Ok::<usize, FetchError>(payload.len())
            },
            |error, attempt, delay| {
                tracing::info!(
                    batch = index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Batch retry scheduled"
                );
                board.mark_retry_wait(index, error.to_string());
                scheduler
                    .event_tx
                    .send(Event::BatchRetrying {
                        index,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                    })
                    .ok();
            },
        )
        .await;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                board.mark_succeeded(index, attempts);
                tracing::debug!(batch = index, attempts, bytes = value, "Batch stored");
                scheduler
                    .event_tx
                    .send(Event::BatchSucceeded { index, attempts })
                    .ok();
            }
            RetryOutcome::Failed { error, attempts } => {
                let error = error.to_string();
                tracing::warn!(batch = index, %range, attempts, error = %error, "Batch failed");
                board.mark_failed(index, attempts, error.clone());
                scheduler
                    .event_tx
                    .send(Event::BatchFailed {
                        index,
                        attempts,
                        error,
                    })
                    .ok();
            }
            RetryOutcome::Cancelled {
                attempts,
                last_error,
            } => {
                if attempts > 0 {
                    tracing::debug!(batch = index, attempts, "Batch abandoned after cancellation");
                }
                board.mark_abandoned(index, last_error.map(|e| e.to_string()));
            }
        }
    }
}
