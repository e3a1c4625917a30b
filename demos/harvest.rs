//! Harvest example
//!
//! Scrapes one feature-service layer into a single JSON file:
//! - Configuring concurrency, retry and output
//! - Subscribing to progress events
//! - Stopping gracefully on Ctrl+C, keeping stored pages for a resumed run
//!
//! ```bash
//! cargo run --example harvest -- \
//!     https://services.arcgis.com/<org>/arcgis/rest/services/<service>/FeatureServer/0 \
//!     parcels.json
//! ```

use arcgis_harvest::{Config, Event, Harvester};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arcgis_harvest=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(service_url) = args.next() else {
        eprintln!("usage: harvest <layer-url> [output.json]");
        std::process::exit(2);
    };

    let mut config = Config::new(service_url);
    config.scheduler.max_concurrency = 6;
    config.retry.max_attempts = 5;
    config.retry.backoff_base = Duration::from_secs(1);
    config.output.output_path = args.next().map(Into::into);
    config.output.resume = true;

    let harvester = Harvester::new(config)?;
    let mut events = harvester.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::Planned {
                    total_batches,
                    resumed,
                } => println!("Planned {total_batches} batches ({resumed} already stored)"),
                Event::BatchRetrying {
                    index,
                    attempt,
                    delay_ms,
                    error,
                } => println!("Batch {index} attempt {attempt} failed ({error}), retrying in {delay_ms} ms"),
                Event::BatchFailed { index, error, .. } => println!("Batch {index} failed: {error}"),
                Event::Consolidated {
                    path,
                    feature_count,
                } => println!("Wrote {feature_count} features to {}", path.display()),
                _ => {}
            }
        }
    });
    let report = harvester.run_with_shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    std::process::exit(report.exit_code());
}
