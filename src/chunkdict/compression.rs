//! Compression detection and handling
//!
//! Two related notions live here: the envelope a byte stream arrives in
//! (detected from magic bytes, never from names), and the closed set of
//! compression types an exported layer can be produced with.

use std::fmt;
use std::io::{self, Cursor, Read};

use crate::chunkdict::context::Scope;
use crate::chunkdict::nydus;
use crate::chunkdict::oci::manifest::{media_types, Descriptor};
use crate::chunkdict::store::{ContentStore, StoreError};

/// Compression envelope of a data stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// No compression - raw data
    None,
    /// Gzip compression (.gz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    Xz,
    /// Zstandard compression (.zst)
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Xz => write!(f, "xz"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const XZ_MAGIC: [u8; 6] = *b"\xfd7zXZ\x00";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Longest signature we need to look at
const MAGIC_LEN: usize = 6;

/// Detect compression type from magic bytes
///
/// Returns `Compression::None` if no recognized signature is found.
pub fn detect_compression(data: &[u8]) -> Compression {
    if data.starts_with(&GZIP_MAGIC) {
        Compression::Gzip
    } else if data.starts_with(&XZ_MAGIC) {
        Compression::Xz
    } else if data.starts_with(&ZSTD_MAGIC) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

/// Wrap a reader with the decoder matching its leading bytes
///
/// The sniffed prefix is replayed in front of the remaining input, so the
/// returned reader yields the full decompressed stream. Uncompressed input is
/// passed through untouched.
pub fn decompress_stream<'a, R>(mut reader: R) -> io::Result<(Box<dyn Read + Send + 'a>, Compression)>
where
    R: Read + Send + 'a,
{
    let mut head = Vec::with_capacity(MAGIC_LEN);
    reader
        .by_ref()
        .take(MAGIC_LEN as u64)
        .read_to_end(&mut head)?;

    let compression = detect_compression(&head);
    let input = Cursor::new(head).chain(reader);

    let decoded: Box<dyn Read + Send + 'a> = match compression {
        Compression::None => Box::new(input),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(input)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(input)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(input)?),
    };

    Ok((decoded, compression))
}

/// Compression type an exported layer is produced with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    Uncompressed,
    #[default]
    Gzip,
    Zstd,
    /// Chunked filesystem blobs, optionally deduplicated against a chunk dictionary
    Nydus,
}

impl CompressionType {
    /// Parse a user-facing compression name
    pub fn parse(name: &str) -> Result<Self, String> {
        match name {
            "uncompressed" => Ok(CompressionType::Uncompressed),
            "gzip" => Ok(CompressionType::Gzip),
            "zstd" => Ok(CompressionType::Zstd),
            "nydus" => Ok(CompressionType::Nydus),
            other => Err(format!("unsupported compression type {}", other)),
        }
    }

    /// Map a layer media type to the compression it implies
    pub fn from_media_type(media_type: &str) -> Result<Self, String> {
        match media_type {
            media_types::OCI_LAYER | media_types::DOCKER_LAYER_UNCOMPRESSED => {
                Ok(CompressionType::Uncompressed)
            }
            media_types::OCI_LAYER_GZIP | media_types::DOCKER_LAYER => Ok(CompressionType::Gzip),
            media_types::OCI_LAYER_ZSTD => Ok(CompressionType::Zstd),
            media_types::NYDUS_BLOB => Ok(CompressionType::Nydus),
            other => Err(format!("unsupported media type {}", other)),
        }
    }

    /// OCI media type of layers produced with this compression
    pub fn media_type(&self) -> &'static str {
        match self {
            CompressionType::Uncompressed => media_types::OCI_LAYER,
            CompressionType::Gzip => media_types::OCI_LAYER_GZIP,
            CompressionType::Zstd => media_types::OCI_LAYER_ZSTD,
            CompressionType::Nydus => media_types::NYDUS_BLOB,
        }
    }

    /// Whether the exporter must compute the layer diff itself instead of
    /// reusing the snapshotter's
    pub fn needs_compute_diff_by_self(&self) -> bool {
        matches!(self, CompressionType::Nydus)
    }

    /// Whether only OCI media types can describe the produced layers
    pub fn only_supports_oci_types(&self) -> bool {
        matches!(self, CompressionType::Zstd | CompressionType::Nydus)
    }

    /// Decide whether a stored layer must be converted before export
    pub async fn needs_conversion(
        &self,
        scope: &Scope,
        store: &dyn ContentStore,
        desc: &Descriptor,
    ) -> Result<bool, StoreError> {
        if !media_types::is_layer_type(&desc.media_type) {
            return Ok(false);
        }
        match self {
            CompressionType::Nydus => Ok(nydus::needs_conversion(scope, store, desc).await),
            other => Ok(desc.media_type != other.media_type()),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionType::Uncompressed => write!(f, "uncompressed"),
            CompressionType::Gzip => write!(f, "gzip"),
            CompressionType::Zstd => write!(f, "zstd"),
            CompressionType::Nydus => write!(f, "nydus"),
        }
    }
}
