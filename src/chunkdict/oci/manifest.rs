/// OCI manifest types and parsing
///
/// Supports:
/// - OCI Image Manifest (application/vnd.oci.image.manifest.v1+json)
/// - Docker Manifest V2 (application/vnd.docker.distribution.manifest.v2+json)
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Manifests larger than this are rejected before parsing
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// Media types for OCI/Docker manifests and layers
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

    // Layer media types
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_LAYER_UNCOMPRESSED: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const NYDUS_BLOB: &str = "application/vnd.oci.image.layer.nydus.blob.v1";

    /// Manifest types a chunk dictionary image may be published as
    pub fn is_image_manifest(media_type: &str) -> bool {
        media_type == OCI_MANIFEST || media_type == DOCKER_MANIFEST_V2
    }

    /// Layer types a bootstrap layer may be published as
    pub fn is_gzip_layer(media_type: &str) -> bool {
        media_type == OCI_LAYER_GZIP || media_type == DOCKER_LAYER
    }

    /// Anything that describes filesystem layer content
    pub fn is_layer_type(media_type: &str) -> bool {
        media_type.starts_with("application/vnd.oci.image.layer.")
            || media_type.starts_with("application/vnd.docker.image.rootfs.")
    }
}

/// OCI content descriptor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the content
    pub media_type: String,

    /// Content digest (e.g., "sha256:abc123...")
    pub digest: String,

    /// Size in bytes
    pub size: u64,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            annotations: HashMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// Annotation value, empty when absent
    pub fn annotation(&self, key: &str) -> &str {
        self.annotations.get(key).map(String::as_str).unwrap_or("")
    }
}

/// OCI Image Manifest
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (should be 2)
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Config blob descriptor
    pub config: Descriptor,

    /// Layer descriptors; the producing format puts the bootstrap layer last
    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ImageManifest {
    /// Parse manifest from JSON bytes
    pub fn parse(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Split layers into the dependent blob layers and the terminal layer
    pub fn split_layers(&self) -> Option<(&[Descriptor], &Descriptor)> {
        self.layers
            .split_last()
            .map(|(last, blobs)| (blobs, last))
    }
}
