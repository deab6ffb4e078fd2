//! Nydus layer annotations, encode-path stamping and the reuse check.

use std::collections::HashMap;

use tracing::debug;

use crate::chunkdict::context::Scope;
use crate::chunkdict::oci::manifest::{media_types, Descriptor};
use crate::chunkdict::store::{ContentStore, StoreError};

pub const LAYER_ANNOTATION_NYDUS_BLOB: &str = "containerd.io/snapshot/nydus-blob";
pub const LAYER_ANNOTATION_NYDUS_BOOTSTRAP: &str = "containerd.io/snapshot/nydus-bootstrap";
pub const LAYER_ANNOTATION_FS_VERSION: &str = "containerd.io/snapshot/nydus-fs-version";
pub const LAYER_ANNOTATION_NYDUS_BLOB_IDS: &str = "containerd.io/snapshot/nydus-blob-ids";
pub const LAYER_ANNOTATION_CHUNK_DICT_DIGEST: &str =
    "containerd.io/snapshot/nydus-chunk-dict-digest";
pub const LAYER_ANNOTATION_COMPRESSOR: &str = "containerd.io/snapshot/nydus-compressor";

/// Label and annotation holding the digest of the uncompressed content
pub const LABEL_UNCOMPRESSED: &str = "containerd.io/uncompressed";

/// Path of the bootstrap inside the bootstrap layer tarball
pub const BOOTSTRAP_FILE_NAME: &str = "image/image.boot";

/// Filesystem version assumed when none is declared
pub const DEFAULT_FS_VERSION: &str = "5";

/// Annotations owned by the nydus format
pub const NYDUS_ANNOTATIONS: [&str; 6] = [
    LAYER_ANNOTATION_NYDUS_BLOB,
    LAYER_ANNOTATION_FS_VERSION,
    LAYER_ANNOTATION_NYDUS_BOOTSTRAP,
    LAYER_ANNOTATION_NYDUS_BLOB_IDS,
    LAYER_ANNOTATION_CHUNK_DICT_DIGEST,
    LAYER_ANNOTATION_COMPRESSOR,
];

/// Whether `desc` was produced with the parameters carried by `scope`
pub fn is_match(scope: &Scope, desc: &Descriptor) -> bool {
    let (fs_version, compressor, chunk_dict_digest) = scope.compression();

    desc.annotation(LAYER_ANNOTATION_FS_VERSION) == fs_version
        && desc.annotation(LAYER_ANNOTATION_COMPRESSOR) == compressor
        && desc.annotation(LAYER_ANNOTATION_CHUNK_DICT_DIGEST) == chunk_dict_digest
}

/// True when `desc` describes a nydus blob the store holds
///
/// Store lookup failures, including a missing blob, are returned as errors.
pub async fn is_nydus_blob(store: &dyn ContentStore, desc: &Descriptor) -> Result<bool, StoreError> {
    if desc.annotations.is_empty() {
        return Ok(false);
    }
    let has_media_type = desc.media_type == media_types::NYDUS_BLOB;
    let has_annotation = desc.annotations.contains_key(LAYER_ANNOTATION_NYDUS_BLOB);

    store.info(&desc.digest).await?;

    Ok(has_media_type && has_annotation)
}

/// Whether a stored layer must be re-encoded for an export running in `scope`
///
/// Anything other than a stored nydus blob stamped with the same fs version,
/// compressor and chunk dictionary is converted.
pub async fn needs_conversion(scope: &Scope, store: &dyn ContentStore, desc: &Descriptor) -> bool {
    if !media_types::is_layer_type(&desc.media_type) {
        return false;
    }

    match is_nydus_blob(store, desc).await {
        Ok(true) if is_match(scope, desc) => false,
        Ok(_) => true,
        Err(e) => {
            debug!(digest = %desc.digest, error = %e, "Cannot inspect stored layer, converting");
            true
        }
    }
}

/// Record the uncompressed digest of a freshly packed blob and return the
/// annotations to publish it with
///
/// `blob_digest` is the stored blob; its `containerd.io/uncompressed` label is
/// set to `uncompressed_digest`.
pub async fn finalize(
    scope: &Scope,
    store: &dyn ContentStore,
    blob_digest: &str,
    uncompressed_digest: &str,
) -> Result<HashMap<String, String>, StoreError> {
    store
        .update_labels(
            blob_digest,
            HashMap::from([(
                LABEL_UNCOMPRESSED.to_string(),
                uncompressed_digest.to_string(),
            )]),
        )
        .await?;

    let (fs_version, compressor, chunk_dict_digest) = scope.compression();

    Ok(HashMap::from([
        (LABEL_UNCOMPRESSED.to_string(), uncompressed_digest.to_string()),
        (LAYER_ANNOTATION_NYDUS_BLOB.to_string(), "true".to_string()),
        (LAYER_ANNOTATION_FS_VERSION.to_string(), fs_version.to_string()),
        (
            LAYER_ANNOTATION_CHUNK_DICT_DIGEST.to_string(),
            chunk_dict_digest.to_string(),
        ),
        (LAYER_ANNOTATION_COMPRESSOR.to_string(), compressor.to_string()),
    ]))
}
