//! Retry logic with exponential backoff
//!
//! This module provides the per-batch retry loop used by the fetch scheduler. It
//! implements capped exponential backoff with optional jitter and stops early when the
//! run is cancelled.
//!
//! # Example
//!
//! ```no_run
//! use arcgis_harvest::retry::{IsRetryable, RetryOutcome, retry_with_backoff};
//! use arcgis_harvest::config::RetryConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! # async fn example() {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let outcome = retry_with_backoff(
//!     &config,
//!     &cancel,
//!     |_attempt| async { Ok::<_, MyError>(()) },
//!     |_err, _attempt, _delay| {},
//! )
//! .await;
//! assert!(matches!(outcome, RetryOutcome::Succeeded { attempts: 1, .. }));
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::FetchError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, rate limiting, 5xx) should return `true`.
/// Permanent failures (other 4xx, malformed payloads, disk errors) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Terminal result of a retried operation
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded on attempt `attempts`
    Succeeded {
        /// Value produced by the successful attempt
        value: T,
        /// Attempts used, including the successful one
        attempts: u32,
    },
    /// The operation failed permanently or ran out of attempts
    Failed {
        /// Last error observed
        error: E,
        /// Attempts used
        attempts: u32,
    },
    /// Cancellation was requested before the operation finished
    Cancelled {
        /// Attempts issued before cancellation
        attempts: u32,
        /// Error of the last attempt, if any attempt was made
        last_error: Option<E>,
    },
}

/// Delay to wait after the `attempts`-th failed attempt: `base * 2^attempts`, capped
pub fn backoff_delay(config: &RetryConfig, attempts: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempts);
    config
        .backoff_base
        .saturating_mul(factor)
        .min(config.backoff_cap)
}

/// Execute an async operation with capped exponential backoff
///
/// `operation` receives the 1-based attempt number. `on_retry` is called with the error,
/// the failed attempt number and the upcoming delay before each backoff wait.
///
/// Attempts stop when the operation succeeds, returns a non-retryable error, has been
/// tried `config.max_attempts` times, or `cancel` fires. Cancellation is only observed
/// between attempts and during backoff waits; an attempt already running is allowed to
/// finish.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
    mut on_retry: R,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
    R: FnMut(&E, u32, Duration),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;
    let mut last_error = None;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled {
                attempts,
                last_error,
            };
        }

        attempts += 1;
        match operation(attempts).await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::info!(attempts, "Operation succeeded after retry");
                }
                return RetryOutcome::Succeeded { value, attempts };
            }
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                let delay = backoff_delay(config, attempts);
                let delay = if config.jitter {
                    add_jitter(delay).min(config.backoff_cap)
                } else {
                    delay
                };

                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                on_retry(&e, attempts, delay);
                last_error = Some(e);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return RetryOutcome::Cancelled { attempts, last_error };
                    }
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, attempts, "Operation failed with non-retryable error");
                }
                return RetryOutcome::Failed { error: e, attempts };
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the result lies
/// between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
