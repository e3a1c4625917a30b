//! Core types for arcgis-harvest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::FailedBatch;

/// How a service is paged deterministically
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum OrderingKey {
    /// `resultOffset` / `resultRecordCount` pagination
    Offset {
        /// Field used to order rows so pages are stable, when the service names one
        order_by: Option<String>,
    },
    /// Contiguous object-id windows, for services without pagination support
    ObjectId {
        /// Object-id field name
        field: String,
        /// Smallest object id reported by the service
        min_oid: i64,
        /// Largest object id reported by the service
        max_oid: i64,
    },
}

/// Service capabilities discovered by the probe
///
/// Immutable once probed; the planner and the page fetcher work exclusively from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    /// Layer URL without trailing slash
    pub base_url: String,
    /// Layer name reported by the service
    pub name: String,
    /// Effective records-per-request limit (always at least 1)
    pub max_page_size: u64,
    /// Number of records reported by `returnCountOnly`
    pub total_count: u64,
    /// Paging strategy
    pub ordering_key: OrderingKey,
    /// Esri geometry type (`None` for tables)
    pub geometry_type: Option<String>,
}

impl ServiceMetadata {
    /// Length of the range the planner partitions
    ///
    /// For offset paging this is the record count. For object-id paging it is the width of
    /// the id span, which may exceed the record count when ids have gaps.
    pub fn extent(&self) -> u64 {
        if self.total_count == 0 {
            return 0;
        }
        match &self.ordering_key {
            OrderingKey::Offset { .. } => self.total_count,
            OrderingKey::ObjectId {
                min_oid, max_oid, ..
            } => {
                if max_oid < min_oid {
                    0
                } else {
                    max_oid.abs_diff(*min_oid) + 1
                }
            }
        }
    }

    /// Object-id field the service is paged by, if known
    pub fn object_id_field(&self) -> Option<&str> {
        match &self.ordering_key {
            OrderingKey::Offset { order_by } => order_by.as_deref(),
            OrderingKey::ObjectId { field, .. } => Some(field),
        }
    }

    /// Whether the layer is a table (no geometry)
    pub fn is_table(&self) -> bool {
        self.geometry_type.is_none()
    }
}

/// Half-open range `[start, end)` over the planner extent
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchRange {
    /// Inclusive start
    pub start: u64,
    /// Exclusive end
    pub end: u64,
}

impl BatchRange {
    /// Number of records the range covers
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range is empty
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

impl std::fmt::Display for BatchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Batch lifecycle state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Not started yet, or waiting out a backoff delay
    #[default]
    Pending,
    /// A request for this batch is in flight
    InFlight,
    /// The artifact for this batch is stored
    Succeeded,
    /// The batch exhausted its attempts or hit a permanent error
    Failed,
}

impl BatchStatus {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Succeeded | BatchStatus::Failed)
    }
}

/// One bounded slice of the record range, fetched by a single request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// 0-based ordinal; the consolidation order
    pub index: usize,
    /// Records covered by this batch
    pub range: BatchRange,
    /// Current state
    pub status: BatchStatus,
    /// Number of requests issued so far
    pub attempts: u32,
    /// Last error observed, if any
    pub last_error: Option<String>,
}

impl Batch {
    /// Create a pending batch
    pub fn new(index: usize, range: BatchRange) -> Self {
        Self {
            index,
            range,
            status: BatchStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Terminal outcome of the scheduling phase
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Snapshot of every batch after scheduling
    pub batches: Vec<Batch>,
    /// Indices stored successfully (fetched in this run or resumed)
    pub succeeded: BTreeSet<usize>,
    /// Indices that failed, with their last error
    pub failed: BTreeMap<usize, String>,
    /// Indices never started or abandoned because of cancellation
    pub unfinished: BTreeSet<usize>,
    /// Indices whose artifacts were reused from a previous run
    pub resumed: BTreeSet<usize>,
}

impl RunResult {
    /// Build the result from a final batch snapshot
    pub fn from_batches(batches: Vec<Batch>, resumed: BTreeSet<usize>) -> Self {
        let mut succeeded = BTreeSet::new();
        let mut failed = BTreeMap::new();
        let mut unfinished = BTreeSet::new();
        for batch in &batches {
            match batch.status {
                BatchStatus::Succeeded => {
                    succeeded.insert(batch.index);
                }
                BatchStatus::Failed => {
                    failed.insert(
                        batch.index,
                        batch
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    );
                }
                BatchStatus::Pending | BatchStatus::InFlight => {
                    unfinished.insert(batch.index);
                }
            }
        }
        Self {
            batches,
            succeeded,
            failed,
            unfinished,
            resumed,
        }
    }

    /// Whether every batch reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.unfinished.is_empty()
    }

    /// Failed batches as a list, ascending by index
    pub fn failed_batches(&self) -> Vec<FailedBatch> {
        self.failed
            .iter()
            .map(|(index, error)| FailedBatch {
                index: *index,
                error: error.clone(),
            })
            .collect()
    }
}

/// Summary of a harvest run, handed to the caller for printing and exit status
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    /// Service layer name
    pub service: String,
    /// Number of planned batches
    pub total_batches: usize,
    /// Number of batches stored successfully
    pub succeeded: usize,
    /// Number of succeeded batches reused from a previous run
    pub resumed: usize,
    /// Every batch that failed, with its last error
    pub failed: Vec<FailedBatch>,
    /// Final output file, if one was written
    pub output_path: Option<PathBuf>,
    /// Number of features in the final output
    pub feature_count: u64,
    /// Whether the run was cut short by cancellation
    pub cancelled: bool,
    /// Whether best-effort finalization was selected
    pub best_effort: bool,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Whether the run ended without anything the caller should treat as failure
    ///
    /// Gaps are acceptable only when best-effort finalization was explicitly selected and
    /// an output was produced.
    pub fn is_success(&self) -> bool {
        if self.cancelled || self.output_path.is_none() {
            return false;
        }
        self.failed.is_empty() || self.best_effort
    }

    /// Process exit code for a CLI wrapper
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

/// Events emitted during a run
///
/// Subscribe via [`crate::Harvester::subscribe`]. Delivery is best-effort: slow
/// subscribers may observe `RecvError::Lagged`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Service capabilities were discovered
    Probed {
        /// Discovered metadata
        metadata: ServiceMetadata,
    },

    /// The record range was partitioned
    Planned {
        /// Number of batches
        total_batches: usize,
        /// Batches already stored by a previous run
        resumed: usize,
    },

    /// A request for a batch was issued
    BatchStarted {
        /// Batch index
        index: usize,
        /// Attempt number (1-based)
        attempt: u32,
    },

    /// A batch failed transiently and will be retried
    BatchRetrying {
        /// Batch index
        index: usize,
        /// Attempt that failed (1-based)
        attempt: u32,
        /// Wait before the next attempt, in milliseconds
        delay_ms: u64,
        /// Error that triggered the retry
        error: String,
    },

    /// A batch artifact was stored
    BatchSucceeded {
        /// Batch index
        index: usize,
        /// Attempts used
        attempts: u32,
    },

    /// A batch ended in the Failed state
    BatchFailed {
        /// Batch index
        index: usize,
        /// Attempts used
        attempts: u32,
        /// Last error
        error: String,
    },

    /// The final output was written
    Consolidated {
        /// Output file
        path: PathBuf,
        /// Number of features written
        feature_count: u64,
    },

    /// The run was cancelled before all batches finished
    Cancelled {
        /// Number of batches that did not reach a terminal state
        unfinished: usize,
    },
}
