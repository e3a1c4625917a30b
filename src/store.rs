//! Scoped storage for per-batch artifacts.
//!
//! Each run gets its own directory under the configured temp root, named after a hash of
//! the service URL. Artifacts are written under a `.part` name and renamed into place once
//! fully flushed, so a reader never observes a partial artifact. Nothing here deletes
//! artifacts on its own; [`TempStore::cleanup`] is called by the orchestrator only after the
//! consolidated output is durable.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::{QueryConfig, ResponseFormat};
use crate::error::StoreError;
use crate::types::ServiceMetadata;

const MANIFEST_FILE: &str = "manifest.json";
const ARTIFACT_PREFIX: &str = "batch-";
const ARTIFACT_SUFFIX: &str = ".json";
const PART_SUFFIX: &str = ".part";

/// What a run directory was planned from
///
/// Artifacts are only reused when the manifest of a previous run matches the current one
/// exactly; any drift in the service (record count, page size, id span) or in the query
/// shape invalidates them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Probed service metadata
    pub metadata: ServiceMetadata,
    /// Requested fields
    pub out_fields: String,
    /// Requested spatial reference
    pub out_sr: Option<u32>,
    /// Requested response format
    pub format: ResponseFormat,
}

impl RunManifest {
    /// Manifest for a run of `metadata` with the given query settings
    pub fn new(metadata: &ServiceMetadata, query: &QueryConfig) -> Self {
        Self {
            metadata: metadata.clone(),
            out_fields: query.out_fields.clone(),
            out_sr: query.out_sr,
            format: query.format,
        }
    }

    /// Stable directory name for this service
    pub fn run_key(&self) -> String {
        let digest = Sha256::digest(self.metadata.base_url.as_bytes());
        let hash: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        format!("{}-{}", sanitize(&self.metadata.name), hash)
    }
}

/// Per-run artifact store
#[derive(Debug)]
pub struct TempStore {
    dir: PathBuf,
}

impl TempStore {
    /// Open (or create) the run directory for `manifest` under `root`
    ///
    /// With `resume` set and a matching manifest on disk, existing artifacts are kept.
    /// Otherwise any leftovers are discarded and a fresh manifest is written.
    pub async fn open(
        root: &Path,
        manifest: &RunManifest,
        resume: bool,
    ) -> Result<Self, StoreError> {
        let dir = root.join(manifest.run_key());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        let store = Self { dir };

        let previous = store.read_manifest().await?;
        let keep = match &previous {
            Some(prev) if prev == manifest => resume,
            Some(_) => {
                tracing::warn!(
                    dir = %store.dir.display(),
                    "Service changed since the previous run, discarding stored artifacts"
                );
                false
            }
            None => false,
        };

        if !keep {
            store.discard_artifacts().await?;
            let bytes = serde_json::to_vec_pretty(manifest).map_err(|e| StoreError::Manifest {
                path: store.manifest_path(),
                reason: e.to_string(),
            })?;
            write_atomic(&store.manifest_path(), &bytes)
                .await
                .map_err(|e| StoreError::io(store.manifest_path(), e))?;
        }

        tracing::debug!(dir = %store.dir.display(), resume = keep, "Opened temp store");
        Ok(store)
    }

    /// Directory holding this run's artifacts
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path of the artifact for `index`
    pub fn artifact_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("{ARTIFACT_PREFIX}{index:06}{ARTIFACT_SUFFIX}"))
    }

    /// Persist the payload for `index`, atomically replacing any previous artifact
    pub async fn write(&self, index: usize, payload: &[u8]) -> Result<(), StoreError> {
        let path = self.artifact_path(index);
        write_atomic(&path, payload)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        tracing::trace!(batch = index, bytes = payload.len(), "Stored artifact");
        Ok(())
    }

    /// Read the payload for `index`
    pub async fn read(&self, index: usize) -> Result<Vec<u8>, StoreError> {
        let path = self.artifact_path(index);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound { index })
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Whether a complete artifact exists for `index`
    pub async fn contains(&self, index: usize) -> bool {
        tokio::fs::try_exists(self.artifact_path(index))
            .await
            .unwrap_or(false)
    }

    /// Indices of every complete artifact on disk
    pub async fn completed(&self) -> Result<BTreeSet<usize>, StoreError> {
        let mut indices = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            if let Some(index) = entry.file_name().to_str().and_then(parse_artifact_name) {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    /// Remove the run directory and everything in it
    pub async fn cleanup(self) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                tracing::debug!(dir = %self.dir.display(), "Removed temp store");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.dir, e)),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    async fn read_manifest(&self) -> Result<Option<RunManifest>, StoreError> {
        let path = self.manifest_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable manifest");
                Ok(None)
            }
        }
    }

    /// Remove artifacts and stray `.part` files, keeping the directory
    async fn discard_artifacts(&self) -> Result<(), StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(ARTIFACT_PREFIX) || name.ends_with(PART_SUFFIX) {
                let path = entry.path();
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| StoreError::io(&path, e))?;
            }
        }
        Ok(())
    }
}

/// A file written under a temporary `.part` name and renamed into place on commit
pub struct AtomicFile {
    final_path: PathBuf,
    part_path: PathBuf,
    writer: BufWriter<tokio::fs::File>,
}

impl AtomicFile {
    /// Create `<path>.part`, creating parent directories as needed
    pub async fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part_path = part_path(path);
        let file = tokio::fs::File::create(&part_path).await?;
        Ok(Self {
            final_path: path.to_path_buf(),
            part_path,
            writer: BufWriter::new(file),
        })
    }

    /// Buffered writer for the temporary file
    pub fn writer(&mut self) -> &mut BufWriter<tokio::fs::File> {
        &mut self.writer
    }

    /// Flush, fsync and rename into place
    pub async fn commit(mut self) -> std::io::Result<PathBuf> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        drop(self.writer);
        tokio::fs::rename(&self.part_path, &self.final_path).await?;
        Ok(self.final_path)
    }

    /// Remove the temporary file without touching the final path
    pub async fn discard(self) {
        drop(self.writer);
        if let Err(e) = tokio::fs::remove_file(&self.part_path).await {
            tracing::warn!(path = %self.part_path.display(), error = %e, "Failed to remove partial file");
        }
    }
}

/// Write `bytes` to `path` via write-to-temp-then-rename
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = AtomicFile::create(path).await?;
    if let Err(e) = file.writer().write_all(bytes).await {
        file.discard().await;
        return Err(e);
    }
    file.commit().await.map(|_| ())
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

fn parse_artifact_name(name: &str) -> Option<usize> {
    name.strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(ARTIFACT_SUFFIX)?
        .parse()
        .ok()
}

/// Make a layer name safe for use as a path component
pub(crate) fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "layer".to_string()
    } else {
        cleaned
    }
}
