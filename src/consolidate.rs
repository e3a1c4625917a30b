//! Result consolidation: merge batch artifacts into one output document.
//!
//! Artifacts are read strictly in ascending batch index order, so the output order never
//! depends on the order in which batches completed. The output is streamed into a `.part`
//! file and renamed into place only after every artifact has been merged.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{ConsolidationError, FailedBatch};
use crate::store::{AtomicFile, TempStore};
use crate::types::{Batch, RunResult};

/// Top-level keys that describe a single page rather than the whole collection
const PAGE_ONLY_KEYS: &[&str] = &["features", "exceededTransferLimit"];

/// GeoJSON pages carry the truncation flag under `properties`
const GEOJSON_PROPERTIES: &str = "properties";
const TRANSFER_LIMIT_KEY: &str = "exceededTransferLimit";

/// A successfully written consolidated output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalOutput {
    /// Output file
    pub path: PathBuf,
    /// Number of features written
    pub feature_count: u64,
    /// Number of batch artifacts merged
    pub batches_merged: usize,
    /// Batches left out under best-effort finalization
    pub gaps: Vec<FailedBatch>,
}

/// Merge every succeeded batch of `plan` into `output_path`
///
/// Refuses to finalize when any batch is unfinished, or when any batch failed and
/// `best_effort` is off. A refusal writes nothing and leaves an existing file at
/// `output_path` untouched.
pub async fn consolidate(
    plan: &[Batch],
    result: &RunResult,
    store: &TempStore,
    output_path: &Path,
    best_effort: bool,
) -> Result<FinalOutput, ConsolidationError> {
    let mut unfinished = result.unfinished.clone();
    unfinished.extend(
        plan.iter()
            .map(|b| b.index)
            .filter(|i| !result.succeeded.contains(i) && !result.failed.contains_key(i)),
    );
    if !unfinished.is_empty() {
        return Err(ConsolidationError::Incomplete { unfinished });
    }

    let gaps = result.failed_batches();
    if !gaps.is_empty() && !best_effort {
        return Err(ConsolidationError::FailedBatches { failed: gaps });
    }

    let mut indices: Vec<usize> = plan
        .iter()
        .map(|b| b.index)
        .filter(|i| result.succeeded.contains(i))
        .collect();
    indices.sort_unstable();

    let mut file = AtomicFile::create(output_path).await?;
    let feature_count = match write_merged(&mut file, store, &indices).await {
        Ok(count) => count,
        Err(e) => {
            file.discard().await;
            return Err(e);
        }
    };
    let path = file.commit().await?;

    if !gaps.is_empty() {
        tracing::warn!(
            path = %path.display(),
            missing = gaps.len(),
            "Finalized best-effort output with gaps"
        );
    }
    tracing::info!(
        path = %path.display(),
        feature_count,
        batches = indices.len(),
        "Consolidated output"
    );

    Ok(FinalOutput {
        path,
        feature_count,
        batches_merged: indices.len(),
        gaps,
    })
}

async fn write_merged(
    file: &mut AtomicFile,
    store: &TempStore,
    indices: &[usize],
) -> Result<u64, ConsolidationError> {
    let mut envelope_written = false;
    let mut feature_count = 0u64;

    for &index in indices {
        let bytes = store.read(index).await?;
        let (envelope, features) = split_page(index, &bytes)?;

        let writer = file.writer();
        if !envelope_written {
            writer.write_all(&envelope_prefix(&envelope)?).await?;
            envelope_written = true;
        }
        for feature in &features {
            if feature_count > 0 {
                writer.write_all(b",").await?;
            }
            let encoded = serde_json::to_vec(feature).map_err(|e| {
                ConsolidationError::MalformedArtifact {
                    index,
                    reason: e.to_string(),
                }
            })?;
            writer.write_all(&encoded).await?;
            feature_count += 1;
        }
        tracing::trace!(batch = index, features = features.len(), "Merged artifact");
    }

    let writer = file.writer();
    if !envelope_written {
        writer.write_all(b"{\"features\":[").await?;
    }
    writer.write_all(b"]}").await?;
    Ok(feature_count)
}

/// Split one page into its envelope (without page-only keys) and its feature list
fn split_page(index: usize, bytes: &[u8]) -> Result<(Map<String, Value>, Vec<Value>), ConsolidationError> {
    let malformed = |reason: String| ConsolidationError::MalformedArtifact { index, reason };

    let value: Value = serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(malformed("not a JSON object".to_string()));
    };
    let features = match map.remove("features") {
        Some(Value::Array(features)) => features,
        _ => return Err(malformed("missing 'features' array".to_string())),
    };
    for key in PAGE_ONLY_KEYS {
        map.remove(*key);
    }
    if let Some(Value::Object(properties)) = map.get_mut(GEOJSON_PROPERTIES) {
        properties.remove(TRANSFER_LIMIT_KEY);
        if properties.is_empty() {
            map.remove(GEOJSON_PROPERTIES);
        }
    }
    Ok((map, features))
}

/// `{"k1":v1,...,"features":[` for the given envelope
fn envelope_prefix(envelope: &Map<String, Value>) -> Result<Vec<u8>, ConsolidationError> {
    let mut out = Vec::from(&b"{"[..]);
    for (key, value) in envelope {
        serde_json::to_writer(&mut out, key).map_err(std::io::Error::from)?;
        out.push(b':');
        serde_json::to_writer(&mut out, value).map_err(std::io::Error::from)?;
        out.push(b',');
    }
    out.extend_from_slice(b"\"features\":[");
    Ok(out)
}
