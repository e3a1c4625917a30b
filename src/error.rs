//! Error types for arcgis-harvest
//!
//! This module provides the error taxonomy for a harvest run:
//! - [`ProbeError`] - capability discovery failed, the run aborts before any batch work
//! - [`FetchError`] - a single page request failed, classified transient or permanent
//! - [`StoreError`] - intermediate artifact storage failed
//! - [`ConsolidationError`] - the final output could not (or must not) be produced
//!
//! Batch-level failures never abort a run on their own; they are retried and then
//! recorded in the run result. Only probe and consolidation failures surface as `Err`
//! from [`crate::run`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for arcgis-harvest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for arcgis-harvest
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrency")
        key: Option<String>,
    },

    /// Service capability discovery failed
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Intermediate artifact storage failed
    #[error("temp store error: {0}")]
    Store(#[from] StoreError),

    /// Final output could not be produced
    #[error("consolidation error: {0}")]
    Consolidation(#[from] ConsolidationError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl Error {
    /// Machine-readable error code, stable across releases
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Probe(e) => match e {
                ProbeError::Unreachable { .. } => "probe_unreachable",
                ProbeError::HttpStatus { .. } => "probe_http_status",
                ProbeError::Malformed { .. } => "probe_malformed",
                ProbeError::Service { .. } => "probe_service_error",
                ProbeError::NoPagingStrategy { .. } => "probe_no_paging_strategy",
            },
            Error::Store(_) => "store_error",
            Error::Consolidation(e) => match e {
                ConsolidationError::FailedBatches { .. } => "failed_batches",
                ConsolidationError::Incomplete { .. } => "incomplete_run",
                ConsolidationError::MalformedArtifact { .. } => "malformed_artifact",
                ConsolidationError::Store(_) => "store_error",
                ConsolidationError::Io(_) => "io_error",
            },
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
        }
    }
}

/// Service capability discovery errors
///
/// All of these abort the run before any batch is scheduled. A service reporting zero
/// records is *not* an error.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The endpoint could not be reached (DNS, connect, TLS, timeout)
    #[error("could not reach {url}: {reason}")]
    Unreachable {
        /// The URL that was requested
        url: String,
        /// Underlying transport error
        reason: String,
    },

    /// The endpoint answered with a non-success HTTP status
    #[error("{url} answered with HTTP {status}")]
    HttpStatus {
        /// The URL that was requested
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The capability response could not be interpreted
    #[error("malformed capability response from {url}: {reason}")]
    Malformed {
        /// The URL that was requested
        url: String,
        /// What was missing or invalid
        reason: String,
    },

    /// The service returned an ArcGIS error object
    #[error("service error {code}: {message}")]
    Service {
        /// Error code reported by the service
        code: i64,
        /// Error message reported by the service
        message: String,
    },

    /// The service offers neither pagination nor an object-id field to page by
    #[error("service {url} supports neither pagination nor object-id paging")]
    NoPagingStrategy {
        /// Base URL of the service
        url: String,
    },
}

/// Page fetch failure, classified for the retry policy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Likely to succeed on retry (timeout, connection reset, rate limit, 5xx)
    #[error("transient: {0}")]
    Transient(String),

    /// Unlikely to change on retry (other 4xx, malformed payload)
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Temp store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No artifact was ever (successfully) written for this batch index
    #[error("no artifact stored for batch {index}")]
    NotFound {
        /// Batch index that was requested
        index: usize,
    },

    /// Filesystem operation failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path that was being accessed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The run manifest could not be read or written
    #[error("invalid run manifest at {path}: {reason}")]
    Manifest {
        /// Manifest path
        path: PathBuf,
        /// Reason the manifest is invalid
        reason: String,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A batch that never succeeded, with the last error it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBatch {
    /// Batch index
    pub index: usize,
    /// Last error message recorded for the batch
    pub error: String,
}

/// Consolidation errors
#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// One or more batches failed and best-effort finalization is off
    #[error("refusing to finalize: {} batch(es) failed ({})", failed.len(), format_indices(failed.iter().map(|f| f.index)))]
    FailedBatches {
        /// Every failed batch with its last error
        failed: Vec<FailedBatch>,
    },

    /// Some batches never reached a terminal state (cancelled run)
    #[error("refusing to finalize: {} batch(es) unfinished ({})", unfinished.len(), format_indices(unfinished.iter().copied()))]
    Incomplete {
        /// Indices of batches that were never started or were abandoned
        unfinished: BTreeSet<usize>,
    },

    /// A stored artifact is not a feature collection
    #[error("artifact for batch {index} is malformed: {reason}")]
    MalformedArtifact {
        /// Batch index
        index: usize,
        /// Why the artifact was rejected
        reason: String,
    },

    /// Reading an artifact failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Writing the output failed
    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),
}

fn format_indices(indices: impl Iterator<Item = usize>) -> String {
    indices
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
