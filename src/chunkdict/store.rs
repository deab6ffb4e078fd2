//! Content-addressable blob store.
//!
//! The resolver only needs three capabilities from a store: look up what it
//! knows about a digest, attach labels to it, and ingest a stream while
//! verifying the size and digest it was promised. `LocalStore` provides them
//! on top of a plain directory tree:
//!
//! ```text
//! <root>/blobs/sha256/<hex>         blob content
//! <root>/labels/sha256/<hex>.json   labels
//! <root>/ingest/<ref>               partial writes
//! ```

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::chunkdict::fetch_error::FetchError;
use crate::chunkdict::stream_utils::{next_chunk, BlobStream};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content {0} not found")]
    NotFound(String),

    #[error("unsupported digest {0}")]
    UnsupportedDigest(String),

    #[error("ref {0} is locked by another ingest")]
    Locked(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },

    #[error("fetch {digest}: {source}")]
    Fetch {
        digest: String,
        #[source]
        source: FetchError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// The written bytes are not the content that was asked for
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::DigestMismatch { .. } | StoreError::SizeMismatch { .. }
        )
    }
}

/// What a store knows about one blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Metadata for `digest`; `StoreError::NotFound` when absent
    async fn info(&self, digest: &str) -> Result<Info, StoreError>;

    /// Merge `labels` into the labels of an existing blob
    async fn update_labels(
        &self,
        digest: &str,
        labels: HashMap<String, String>,
    ) -> Result<Info, StoreError>;

    /// Ingest `stream` under the writer ref `key`, committing it only if it is
    /// exactly `expected_size` bytes hashing to `expected_digest`
    async fn copy(
        &self,
        key: &str,
        stream: BlobStream,
        expected_size: u64,
        expected_digest: &str,
    ) -> Result<Info, StoreError>;
}

/// Filesystem-backed content store
pub struct LocalStore {
    root: PathBuf,
    stall_timeout: Duration,
    active_ingests: Mutex<HashSet<String>>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stall_timeout: Duration::from_secs(30),
            active_ingests: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Path of a committed blob
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf, StoreError> {
        let hex = sha256_hex(digest)?;
        Ok(self.root.join("blobs").join("sha256").join(hex))
    }

    fn labels_path(&self, digest: &str) -> Result<PathBuf, StoreError> {
        let hex = sha256_hex(digest)?;
        Ok(self
            .root
            .join("labels")
            .join("sha256")
            .join(format!("{}.json", hex)))
    }

    fn ingest_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.root.join("ingest").join(name)
    }

    fn begin_ingest(&self, key: &str) -> Result<IngestGuard<'_>, StoreError> {
        let mut active = self
            .active_ingests
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.to_string()) {
            return Err(StoreError::Locked(key.to_string()));
        }
        Ok(IngestGuard {
            active: &self.active_ingests,
            key: key.to_string(),
        })
    }

    async fn read_labels(&self, digest: &str) -> Result<HashMap<String, String>, StoreError> {
        match tokio::fs::read(self.labels_path(digest)?).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_labels(
        &self,
        digest: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let path = self.labels_path(digest)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec(labels)?).await?;
        Ok(())
    }

    /// Stream into `tmp`, returning the byte count once size and digest check out
    async fn write_verified(
        &self,
        tmp: &Path,
        mut stream: BlobStream,
        expected_size: u64,
        expected_digest: &str,
    ) -> Result<u64, StoreError> {
        let mut file = tokio::fs::File::create(tmp).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = next_chunk(&mut stream, self.stall_timeout)
            .await
            .map_err(|source| StoreError::Fetch {
                digest: expected_digest.to_string(),
                source,
            })?
        {
            written += chunk.len() as u64;
            if written > expected_size {
                return Err(StoreError::SizeMismatch {
                    digest: expected_digest.to_string(),
                    expected: expected_size,
                    actual: written,
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        if written != expected_size {
            return Err(StoreError::SizeMismatch {
                digest: expected_digest.to_string(),
                expected: expected_size,
                actual: written,
            });
        }

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != expected_digest {
            return Err(StoreError::DigestMismatch {
                expected: expected_digest.to_string(),
                actual: computed,
            });
        }

        Ok(written)
    }
}

#[async_trait]
impl ContentStore for LocalStore {
    async fn info(&self, digest: &str) -> Result<Info, StoreError> {
        let metadata = match tokio::fs::metadata(self.blob_path(digest)?).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(digest.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Info {
            digest: digest.to_string(),
            size: metadata.len(),
            labels: self.read_labels(digest).await?,
        })
    }

    async fn update_labels(
        &self,
        digest: &str,
        labels: HashMap<String, String>,
    ) -> Result<Info, StoreError> {
        let mut info = self.info(digest).await?;
        info.labels.extend(labels);
        self.write_labels(digest, &info.labels).await?;
        Ok(info)
    }

    async fn copy(
        &self,
        key: &str,
        stream: BlobStream,
        expected_size: u64,
        expected_digest: &str,
    ) -> Result<Info, StoreError> {
        let blob_path = self.blob_path(expected_digest)?;
        let _guard = self.begin_ingest(key)?;

        let tmp = self.ingest_path(key);
        if let Some(parent) = tmp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(key = %key, digest = %expected_digest, "Ingesting blob");
        let written = match self
            .write_verified(&tmp, stream, expected_size, expected_digest)
            .await
        {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if let Some(parent) = blob_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&tmp, &blob_path).await?;

        info!(digest = %expected_digest, size = written, "Blob committed");

        Ok(Info {
            digest: expected_digest.to_string(),
            size: written,
            labels: self.read_labels(expected_digest).await?,
        })
    }
}

/// Releases an ingest ref when the write finishes or is abandoned
struct IngestGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for IngestGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

fn sha256_hex(digest: &str) -> Result<&str, StoreError> {
    match digest.split_once(':') {
        Some(("sha256", hex))
            if hex.len() == 64 && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) =>
        {
            Ok(hex)
        }
        _ => Err(StoreError::UnsupportedDigest(digest.to_string())),
    }
}

/// `sha256:<hex>` digest of `data`
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}
