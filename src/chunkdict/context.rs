//! Request-scoped compression parameters.
//!
//! A `Scope` is an immutable value handed down an export call tree. Deriving a
//! new scope never touches the one it was derived from, so sibling exports can
//! branch off a common parent with different parameters. Values that were
//! never attached read back as empty strings.

use std::sync::Arc;

const BLOB_LINK_PREFIX: &str = "nydus-blob-link";

#[derive(Debug, Default, PartialEq, Eq)]
struct CompressionParams {
    fs_version: String,
    compressor: String,
    chunk_dict_digest: String,
}

#[derive(Debug, Clone, Default)]
pub struct Scope {
    compression: Option<Arc<CompressionParams>>,
    blob_link_key: Option<Arc<str>>,
}

impl Scope {
    /// Empty scope with nothing attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a scope carrying the chunked-format compression parameters
    pub fn with_compression(
        &self,
        fs_version: &str,
        compressor: &str,
        chunk_dict_digest: &str,
    ) -> Scope {
        Scope {
            compression: Some(Arc::new(CompressionParams {
                fs_version: fs_version.to_string(),
                compressor: compressor.to_string(),
                chunk_dict_digest: chunk_dict_digest.to_string(),
            })),
            blob_link_key: self.blob_link_key.clone(),
        }
    }

    /// `(fs_version, compressor, chunk_dict_digest)`, empty when unset
    pub fn compression(&self) -> (&str, &str, &str) {
        match &self.compression {
            Some(params) => (
                &params.fs_version,
                &params.compressor,
                &params.chunk_dict_digest,
            ),
            None => ("", "", ""),
        }
    }

    /// Derive a scope carrying the blob-link cache key
    ///
    /// The key has the form `nydus-blob-link[-v<fsv>]-chunk-dict-<digest|none>-`
    /// and is only attached when `fs_version` or `chunk_dict_digest` is set;
    /// otherwise the returned scope equals `self`.
    pub fn with_blob_link_key(&self, fs_version: &str, chunk_dict_digest: &str) -> Scope {
        if fs_version.is_empty() && chunk_dict_digest.is_empty() {
            return self.clone();
        }

        let version = if fs_version.is_empty() {
            String::new()
        } else {
            format!("-v{}", fs_version)
        };
        let dict = if chunk_dict_digest.is_empty() {
            "none"
        } else {
            chunk_dict_digest
        };

        Scope {
            compression: self.compression.clone(),
            blob_link_key: Some(Arc::from(format!(
                "{}{}-chunk-dict-{}-",
                BLOB_LINK_PREFIX, version, dict
            ))),
        }
    }

    pub fn blob_link_key(&self) -> &str {
        self.blob_link_key.as_deref().unwrap_or("")
    }
}
