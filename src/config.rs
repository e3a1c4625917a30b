//! Configuration types for arcgis-harvest

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Scheduler settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of page requests in flight at once (default: 8)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Retry behavior configuration
///
/// Unlike a plain "number of retries", `max_attempts` counts every request issued for a
/// batch, including the first one. A batch that fails transiently `max_attempts` times
/// ends up Failed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per batch, including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay; the wait after the n-th failed attempt is `backoff_base * 2^n`
    /// (default: 500 ms)
    #[serde(
        default = "default_backoff_base",
        rename = "backoff_base_ms",
        with = "duration_ms_serde"
    )]
    pub backoff_base: Duration,

    /// Upper bound for a single backoff wait (default: 30 seconds)
    #[serde(
        default = "default_backoff_cap",
        rename = "backoff_cap_ms",
        with = "duration_ms_serde"
    )]
    pub backoff_cap: Duration,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            jitter: true,
        }
    }
}

/// Where intermediate artifacts and the final output go
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Final consolidated output file. When unset, `output_files/<service name>.json`
    /// is used.
    #[serde(default)]
    pub output_path: Option<PathBuf>,

    /// Directory for per-batch artifacts (default: "temp_files")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Finalize with the successful subset when some batches failed (default: false)
    #[serde(default)]
    pub best_effort_finalize: bool,

    /// Keep per-batch artifacts after a successful consolidation (default: false)
    #[serde(default)]
    pub keep_temp_files: bool,

    /// Skip batches whose artifacts survive from a previous, interrupted run of the same
    /// service (default: false)
    #[serde(default)]
    pub resume: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            temp_dir: default_temp_dir(),
            best_effort_finalize: false,
            keep_temp_files: false,
            resume: false,
        }
    }
}

/// Response format requested from the service
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Esri JSON (`f=json`)
    #[default]
    Json,
    /// GeoJSON (`f=geojson`)
    Geojson,
}

impl ResponseFormat {
    /// Value of the `f` query parameter
    pub fn as_param(&self) -> &'static str {
        match self {
            ResponseFormat::Json => "json",
            ResponseFormat::Geojson => "geojson",
        }
    }
}

/// How page queries are built and sent
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Upper bound for records per request, applied on top of the service's
    /// `maxRecordCount` (default: 10000)
    #[serde(default = "default_page_size_cap")]
    pub page_size_cap: u64,

    /// Output spatial reference (EPSG code). Ignored for tables. (default: 4269)
    #[serde(default = "default_out_sr")]
    pub out_sr: Option<u32>,

    /// Fields to request (default: "*")
    #[serde(default = "default_out_fields")]
    pub out_fields: String,

    /// Response format (default: Esri JSON)
    #[serde(default)]
    pub format: ResponseFormat,

    /// Verify TLS certificates (default: true)
    #[serde(default = "default_true")]
    pub verify_tls: bool,

    /// Per-request timeout (default: 60 seconds)
    #[serde(
        default = "default_request_timeout",
        rename = "request_timeout_ms",
        with = "duration_ms_serde"
    )]
    pub request_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            page_size_cap: default_page_size_cap(),
            out_sr: default_out_sr(),
            out_fields: default_out_fields(),
            format: ResponseFormat::default(),
            verify_tls: true,
            request_timeout: default_request_timeout(),
        }
    }
}

/// Main configuration for a harvest run
///
/// Fields are organized into logical sub-configs:
/// - [`scheduler`](SchedulerConfig) - concurrency
/// - [`retry`](RetryConfig) - attempt budget and backoff
/// - [`output`](OutputConfig) - temp storage, final output, finalize policy
/// - [`query`](QueryConfig) - request construction and HTTP client settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the feature layer, e.g. `https://host/arcgis/rest/services/X/MapServer/0`
    pub service_url: String,

    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Output settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Query settings
    #[serde(default)]
    pub query: QueryConfig,
}

impl Config {
    /// Create a configuration with defaults for the given service URL
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            ..Default::default()
        }
    }

    /// Check settings that would make a run impossible
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.service_url).map_err(|e| Error::Config {
            message: format!("invalid service URL '{}': {}", self.service_url, e),
            key: Some("service_url".to_string()),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config {
                message: format!("unsupported URL scheme '{}'", url.scheme()),
                key: Some("service_url".to_string()),
            });
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(Error::Config {
                message: "max_concurrency must be at least 1".to_string(),
                key: Some("max_concurrency".to_string()),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config {
                message: "max_attempts must be at least 1".to_string(),
                key: Some("max_attempts".to_string()),
            });
        }
        if self.retry.backoff_cap < self.retry.backoff_base {
            return Err(Error::Config {
                message: "backoff_cap_ms must not be smaller than backoff_base_ms".to_string(),
                key: Some("backoff_cap_ms".to_string()),
            });
        }
        if self.query.page_size_cap == 0 {
            return Err(Error::Config {
                message: "page_size_cap must be at least 1".to_string(),
                key: Some("page_size_cap".to_string()),
            });
        }
        Ok(())
    }

    /// Service URL without trailing slashes
    pub fn base_url(&self) -> &str {
        self.service_url.trim_end_matches('/')
    }
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp_files")
}

fn default_page_size_cap() -> u64 {
    10_000
}

fn default_out_sr() -> Option<u32> {
    Some(4269)
}

fn default_out_fields() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (integer milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
