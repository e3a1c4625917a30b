//! # arcgis-harvest
//!
//! Concurrent, resumable scraper for paginated ArcGIS REST feature services.
//!
//! ## Design Philosophy
//!
//! arcgis-harvest is designed to be:
//! - **Bounded** - at most `max_concurrency` page requests are in flight at once
//! - **Deterministic** - output order follows the record range, never completion order
//! - **Honest** - a run with failed batches refuses to produce a silently incomplete file
//! - **Event-driven** - consumers subscribe to progress events, no polling required
//!
//! A run walks four stages: probe the layer's capabilities, plan page-sized batches,
//! fetch every batch into a temp store with retry, then consolidate the stored pages into
//! one output document.
//!
//! ## Quick Start
//!
//! ```no_run
//! use arcgis_harvest::{Config, Harvester};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::new(
//!         "https://services.arcgis.com/example/arcgis/rest/services/Parcels/FeatureServer/0",
//!     );
//!     config.scheduler.max_concurrency = 4;
//!
//!     let harvester = Harvester::new(config)?;
//!
//!     // Subscribe to events
//!     let mut events = harvester.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let report = harvester.run().await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Merging batch artifacts into the final output
pub mod consolidate;
/// Error types
pub mod error;
/// Run orchestration and concurrent fetching
pub mod harvester;
/// Partitioning the record range into batches
pub mod planner;
/// Service capability discovery
pub mod probe;
/// Retry logic with exponential backoff
pub mod retry;
/// Per-batch artifact storage
pub mod store;
/// Page requests and failure classification
pub mod transport;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, OutputConfig, QueryConfig, ResponseFormat, RetryConfig, SchedulerConfig};
pub use consolidate::FinalOutput;
pub use error::{
    ConsolidationError, Error, FailedBatch, FetchError, ProbeError, Result, StoreError,
};
pub use harvester::{FetchScheduler, Harvester};
pub use store::{RunManifest, TempStore};
pub use transport::{HttpPageFetcher, PageFetcher, RawPayload};
pub use types::{
    Batch, BatchRange, BatchStatus, Event, OrderingKey, RunReport, RunResult, ServiceMetadata,
};
pub use tokio_util::sync::CancellationToken;

/// Harvest the service described by `config` in one call
///
/// # Example
///
/// ```no_run
/// use arcgis_harvest::{Config, run};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::new("https://example.com/arcgis/rest/services/Roads/MapServer/2");
///     let report = run(config).await?;
///     println!("{} features written", report.feature_count);
///     Ok(())
/// }
/// ```
pub async fn run(config: Config) -> Result<RunReport> {
    Harvester::new(config)?.run().await
}

/// Harvest with graceful signal handling.
///
/// A termination signal stops new batches from starting and interrupts backoff waits.
/// Requests already in flight finish, stored artifacts are kept for a later resume, and
/// the returned report has `cancelled` set.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use arcgis_harvest::{Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut config = Config::new("https://example.com/arcgis/rest/services/Roads/MapServer/2");
///     config.output.resume = true;
///
///     let report = run_with_shutdown(config).await?;
///     std::process::exit(report.exit_code());
/// }
/// ```
pub async fn run_with_shutdown(config: Config) -> Result<RunReport> {
    Harvester::new(config)?.run_with_shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
