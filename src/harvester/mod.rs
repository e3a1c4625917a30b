//! Harvest orchestration (decomposed into focused submodules)
//!
//! A run walks the pipeline probe, plan, fetch, consolidate. Submodules:
//! - `board` - batch status transitions behind a single lock
//! - `scheduler` - bounded-concurrency fetching with retry

mod board;
mod scheduler;


pub use scheduler::FetchScheduler;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::consolidate::consolidate;
use crate::error::Result;
use crate::planner;
use crate::probe::probe;
use crate::store::{RunManifest, TempStore, sanitize};
use crate::transport::{HttpPageFetcher, PageFetcher, build_client};
use crate::types::{Event, RunReport, ServiceMetadata};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Directory used for the final output when no explicit path is configured
const DEFAULT_OUTPUT_DIR: &str = "output_files";

/// Scrapes one feature-service layer into a single consolidated file
#[derive(Clone)]
pub struct Harvester {
    config: Arc<Config>,
    client: reqwest::Client,
    fetcher: Arc<dyn PageFetcher>,
    event_tx: broadcast::Sender<Event>,
}

impl Harvester {
    /// Create a harvester issuing real HTTP requests
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let client = build_client(&config.query)?;
        let fetcher = Arc::new(HttpPageFetcher::new(client.clone(), config.query.clone()));
        Ok(Self::assemble(config, client, fetcher))
    }

    /// Create a harvester that fetches pages through `fetcher`
    ///
    /// The probe still uses HTTP; use [`Harvester::harvest`] to skip it.
    pub fn with_fetcher(config: Config, fetcher: Arc<dyn PageFetcher>) -> Result<Self> {
        config.validate()?;
        let client = build_client(&config.query)?;
        Ok(Self::assemble(config, client, fetcher))
    }

    fn assemble(config: Config, client: reqwest::Client, fetcher: Arc<dyn PageFetcher>) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            client,
            fetcher,
            event_tx,
        }
    }

    /// Subscribe to run events
    ///
    /// Each subscriber receives events emitted after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run to completion without external cancellation
    pub async fn run(&self) -> Result<RunReport> {
        self.run_with_cancel(CancellationToken::new()).await
    }

    /// Run until completion or a termination signal, see [`crate::run_with_shutdown`]
    pub async fn run_with_shutdown(&self) -> Result<RunReport> {
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let signal_task = tokio::spawn(async move {
            crate::wait_for_signal().await;
            tracing::info!("Shutdown requested, finishing in-flight requests");
            trigger.cancel();
        });

        let result = self.run_with_cancel(cancel).await;
        signal_task.abort();
        result
    }

    /// Probe the service, then harvest it
    ///
    /// Returns `Err` when the probe fails or the output must not be finalized. Batch
    /// failures tolerated by best-effort finalization, and cancellation, are reported
    /// through the returned [`RunReport`].
    pub async fn run_with_cancel(&self, cancel: CancellationToken) -> Result<RunReport> {
        let base_url = self.config.base_url();
        tracing::info!(url = %base_url, "Probing service");

        let metadata = probe(&self.client, base_url, &self.config.query).await?;
        self.event_tx
            .send(Event::Probed {
                metadata: metadata.clone(),
            })
            .ok();

        self.harvest(metadata, cancel).await
    }

    /// Plan, fetch, and consolidate a service whose metadata is already known
    pub async fn harvest(
        &self,
        metadata: ServiceMetadata,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let config = &self.config;

        let plan = planner::plan(&metadata);
        let manifest = RunManifest::new(&metadata, &config.query);
        let store = TempStore::open(&config.output.temp_dir, &manifest, config.output.resume).await?;

        let resumed: BTreeSet<usize> = if config.output.resume {
            let planned: BTreeSet<usize> = plan.iter().map(|b| b.index).collect();
            store
                .completed()
                .await?
                .intersection(&planned)
                .copied()
                .collect()
        } else {
            BTreeSet::new()
        };

        tracing::info!(
            service = %metadata.name,
            object_id_field = metadata.object_id_field().unwrap_or("none"),
            total_batches = plan.len(),
            resumed = resumed.len(),
            "Planned harvest"
        );
        self.event_tx
            .send(Event::Planned {
                total_batches: plan.len(),
                resumed: resumed.len(),
            })
            .ok();

        let scheduler = FetchScheduler {
            fetcher: Arc::clone(&self.fetcher),
            retry: config.retry.clone(),
            max_concurrency: config.scheduler.max_concurrency,
            event_tx: self.event_tx.clone(),
            cancel: cancel.clone(),
        };
        let result = scheduler
            .run(&metadata, plan.clone(), &store, resumed)
            .await;

        let mut report = RunReport {
            service: metadata.name.clone(),
            total_batches: plan.len(),
            succeeded: result.succeeded.len(),
            resumed: result.resumed.len(),
            failed: result.failed_batches(),
            output_path: None,
            feature_count: 0,
            cancelled: false,
            best_effort: config.output.best_effort_finalize,
            started_at,
            finished_at: started_at,
        };

        if !result.is_complete() {
            tracing::warn!(
                unfinished = result.unfinished.len(),
                temp_dir = %store.dir().display(),
                "Run cancelled, keeping stored artifacts"
            );
            self.event_tx
                .send(Event::Cancelled {
                    unfinished: result.unfinished.len(),
                })
                .ok();
            report.cancelled = true;
            report.finished_at = Utc::now();
            return Ok(report);
        }

        let output_path = self.output_path(&metadata);
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = match consolidate(
            &plan,
            &result,
            &store,
            &output_path,
            config.output.best_effort_finalize,
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    temp_dir = %store.dir().display(),
                    "Consolidation refused, keeping stored artifacts"
                );
                return Err(e.into());
            }
        };

        tracing::info!(
            path = %output.path.display(),
            features = output.feature_count,
            batches = output.batches_merged,
            gaps = output.gaps.len(),
            "Harvest consolidated"
        );
        self.event_tx
            .send(Event::Consolidated {
                path: output.path.clone(),
                feature_count: output.feature_count,
            })
            .ok();

        if !config.output.keep_temp_files {
            let dir = store.dir().to_path_buf();
            if let Err(e) = store.cleanup().await {
                tracing::warn!(error = %e, dir = %dir.display(), "Failed to remove temp files");
            }
        }

        report.output_path = Some(output.path);
        report.feature_count = output.feature_count;
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Final output path for `metadata`
    pub fn output_path(&self, metadata: &ServiceMetadata) -> PathBuf {
        self.config
            .output
            .output_path
            .clone()
            .unwrap_or_else(|| {
                PathBuf::from(DEFAULT_OUTPUT_DIR).join(format!("{}.json", sanitize(&metadata.name)))
            })
    }
}
