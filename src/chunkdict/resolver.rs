//! Chunk dictionary resolution.
//!
//! A chunk dictionary is an image whose last layer carries the nydus
//! bootstrap and whose other layers are the data blobs the bootstrap refers
//! to. Resolving one validates the manifest, copies every blob into the
//! content store (at most once per digest across concurrent resolutions) and
//! unpacks the bootstrap into a private file under the working directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::try_join_all;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::chunkdict::archive::{self, ExtractError};
use crate::chunkdict::compression::CompressionType;
use crate::chunkdict::context::Scope;
use crate::chunkdict::fetch_error::FetchError;
use crate::chunkdict::nydus::{
    BOOTSTRAP_FILE_NAME, DEFAULT_FS_VERSION, LAYER_ANNOTATION_FS_VERSION,
    LAYER_ANNOTATION_NYDUS_BOOTSTRAP,
};
use crate::chunkdict::oci::manifest::{
    media_types, Descriptor, ImageManifest, MAX_MANIFEST_SIZE,
};
use crate::chunkdict::oci::reference::{ImageReference, ReferenceError};
use crate::chunkdict::options::{ensure_work_dir, ExportConfig, ResolverOptions};
use crate::chunkdict::singleflight::SingleFlight;
use crate::chunkdict::store::{sha256_digest, ContentStore, StoreError};
use crate::chunkdict::stream_utils::{next_chunk, BlobStream, ChannelReader};

/// Prefix of the store writer ref used for blob copies
const COPY_REF_PREFIX: &str = "chunk-dict-";

/// Resolves references and fetches content for one repository
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Resolve `reference` to the descriptor of its root manifest
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor, FetchError>;

    /// Stream the content of a manifest or blob
    async fn fetch(&self, desc: &Descriptor) -> Result<BlobStream, FetchError>;
}

/// Builds fetchers within the auth scope of a source image and session
///
/// An implementation may ignore the scope when its credentials do not depend
/// on the source image.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetcher(
        &self,
        source_ref: &str,
        session_id: &str,
        target: &ImageReference,
    ) -> Result<Arc<dyn Fetcher>, FetchError>;
}

/// Broad class of a resolution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing input or unusable working directory
    Config,
    /// Malformed reference, manifest or bootstrap layer
    Validation,
    Transport,
    Storage,
    Extraction,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("source ref is empty")]
    EmptySourceRef,

    #[error("option nydus-chunk-dict-image not enabled")]
    ChunkDictNotEnabled,

    #[error("ensure nydus work dir {}: {source}", .path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("check chunk dict ref {reference}: {source}")]
    InvalidReference {
        reference: String,
        #[source]
        source: ReferenceError,
    },

    #[error("invalid chunk dict image media type {0}")]
    InvalidMediaType(String),

    #[error("unmarshal chunk dict manifest: {0}")]
    InvalidManifest(String),

    #[error("chunk dict manifest digest mismatch: expected {expected}, got {actual}")]
    ManifestDigestMismatch { expected: String, actual: String },

    #[error("invalid bootstrap layer in {0}")]
    InvalidBootstrap(String),

    #[error("unexpected nydus fs version in chunk dict image, expected {expected}, actual {actual}")]
    FsVersionMismatch { expected: String, actual: String },

    #[error("{context}: {source}")]
    Fetch {
        context: String,
        #[source]
        source: FetchError,
    },

    #[error("copy blob {digest}: {source}")]
    CopyBlob {
        digest: String,
        #[source]
        source: Arc<StoreError>,
    },

    #[error("create temp file in {}: {source}", .path.display())]
    TempFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unpack nydus bootstrap layer {digest}: {source}")]
    Extract {
        digest: String,
        #[source]
        source: ExtractError,
    },

    #[error("load chunk dict {0}: timed out")]
    Timeout(String),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::EmptySourceRef
            | ResolveError::ChunkDictNotEnabled
            | ResolveError::WorkDir { .. } => ErrorKind::Config,
            ResolveError::InvalidReference { .. }
            | ResolveError::InvalidMediaType(_)
            | ResolveError::InvalidManifest(_)
            | ResolveError::ManifestDigestMismatch { .. }
            | ResolveError::InvalidBootstrap(_)
            | ResolveError::FsVersionMismatch { .. } => ErrorKind::Validation,
            ResolveError::Fetch { .. } => ErrorKind::Transport,
            // The registry side of a copy failed, not the store
            ResolveError::CopyBlob { source, .. }
                if matches!(**source, StoreError::Fetch { .. }) =>
            {
                ErrorKind::Transport
            }
            ResolveError::CopyBlob { .. } | ResolveError::TempFile { .. } => ErrorKind::Storage,
            ResolveError::Extract { .. } => ErrorKind::Extraction,
            ResolveError::Timeout(_) => ErrorKind::Cancelled,
        }
    }

    /// Content did not hash or size to what its descriptor promised
    pub fn is_data_corruption(&self) -> bool {
        match self {
            ResolveError::CopyBlob { source, .. } => source.is_corruption(),
            ResolveError::ManifestDigestMismatch { .. } => true,
            _ => false,
        }
    }

    fn fetch(context: impl Into<String>) -> impl FnOnce(FetchError) -> ResolveError {
        let context = context.into();
        move |source| ResolveError::Fetch { context, source }
    }
}

/// A resolved chunk dictionary
#[derive(Debug, Clone)]
pub struct ChunkDictionary {
    /// Unpacked bootstrap, owned by the caller from here on
    pub bootstrap_path: PathBuf,
    /// Digest of the layer the bootstrap came from
    pub bootstrap_digest: String,
    pub fs_version: String,
    /// Blob layers now present in the content store
    pub blobs: Vec<Descriptor>,
}

/// Outcome of one blob copy, shared by every resolution waiting on it
pub type BlobCopyResult = Result<Descriptor, Arc<StoreError>>;

pub struct Resolver {
    transport: Arc<dyn Transport>,
    store: Arc<dyn ContentStore>,
    flight: Arc<SingleFlight<BlobCopyResult>>,
    options: ResolverOptions,
}

impl Resolver {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ContentStore>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            transport,
            store,
            flight: Arc::new(SingleFlight::new()),
            options,
        }
    }

    /// Share blob copy deduplication with other resolvers of the same session
    pub fn with_flight(mut self, flight: Arc<SingleFlight<BlobCopyResult>>) -> Self {
        self.flight = flight;
        self
    }

    pub fn flight(&self) -> Arc<SingleFlight<BlobCopyResult>> {
        self.flight.clone()
    }

    /// Resolve `chunk_dict_ref` within the auth scope of `source_ref`
    ///
    /// `fs_version` is the filesystem version the caller builds; empty means
    /// the default. Nothing is returned unless every blob was copied and the
    /// bootstrap was unpacked.
    pub async fn resolve(
        &self,
        source_ref: &str,
        chunk_dict_ref: &str,
        fs_version: &str,
    ) -> Result<ChunkDictionary, ResolveError> {
        let span = info_span!("load_chunk_dict", chunk_dict = %chunk_dict_ref);
        let load = self
            .load(source_ref, chunk_dict_ref, fs_version)
            .instrument(span);

        match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, load)
                .await
                .map_err(|_| ResolveError::Timeout(chunk_dict_ref.to_string()))?,
            None => load.await,
        }
    }

    async fn load(
        &self,
        source_ref: &str,
        chunk_dict_ref: &str,
        fs_version: &str,
    ) -> Result<ChunkDictionary, ResolveError> {
        if source_ref.is_empty() {
            return Err(ResolveError::EmptySourceRef);
        }
        if chunk_dict_ref.is_empty() {
            return Err(ResolveError::ChunkDictNotEnabled);
        }

        let work_dir = self.options.resolve_work_dir();
        ensure_work_dir(&work_dir).map_err(|source| ResolveError::WorkDir {
            path: work_dir.clone(),
            source,
        })?;

        let reference =
            ImageReference::parse(chunk_dict_ref).map_err(|source| ResolveError::InvalidReference {
                reference: chunk_dict_ref.to_string(),
                source,
            })?;

        info!("nydus: load chunk dict {}", chunk_dict_ref);

        let fetcher = self
            .transport
            .fetcher(source_ref, &self.options.session_id, &reference)
            .await
            .map_err(ResolveError::fetch("get fetcher for chunk dict ref"))?;

        let root = fetcher
            .resolve(&reference)
            .await
            .map_err(ResolveError::fetch("resolve chunk dict ref"))?;
        if !media_types::is_image_manifest(&root.media_type) {
            return Err(ResolveError::InvalidMediaType(root.media_type));
        }

        let manifest = self.fetch_manifest(fetcher.as_ref(), &root).await?;

        let (blob_layers, bootstrap) = manifest
            .split_layers()
            .filter(|(_, last)| is_bootstrap_layer(last))
            .ok_or_else(|| ResolveError::InvalidBootstrap(chunk_dict_ref.to_string()))?;

        let fs_version = reconcile_fs_version(
            fs_version,
            bootstrap.annotation(LAYER_ANNOTATION_FS_VERSION),
        )?;

        debug!(
            blobs = blob_layers.len(),
            bootstrap = %bootstrap.digest,
            fs_version = %fs_version,
            "Chunk dict manifest validated"
        );

        let copies = try_join_all(
            blob_layers
                .iter()
                .map(|desc| self.copy_blob(fetcher.clone(), desc.clone())),
        );
        let extraction = self.extract_bootstrap(fetcher.as_ref(), bootstrap, &work_dir);
        let (blobs, bootstrap_file) = tokio::try_join!(copies, extraction)?;

        let (_, bootstrap_path) =
            bootstrap_file
                .keep()
                .map_err(|e| ResolveError::TempFile {
                    path: work_dir.clone(),
                    source: e.error,
                })?;

        info!(
            bootstrap = %bootstrap_path.display(),
            digest = %bootstrap.digest,
            blobs = blobs.len(),
            "Chunk dict loaded"
        );

        Ok(ChunkDictionary {
            bootstrap_path,
            bootstrap_digest: bootstrap.digest.clone(),
            fs_version,
            blobs,
        })
    }

    async fn fetch_manifest(
        &self,
        fetcher: &dyn Fetcher,
        root: &Descriptor,
    ) -> Result<ImageManifest, ResolveError> {
        let mut stream = fetcher
            .fetch(root)
            .await
            .map_err(ResolveError::fetch("fetch chunk dict manifest"))?;

        let mut body = Vec::with_capacity(root.size.min(MAX_MANIFEST_SIZE as u64) as usize);
        while let Some(chunk) = next_chunk(&mut stream, self.options.stall_timeout)
            .await
            .map_err(ResolveError::fetch("read chunk dict manifest"))?
        {
            body.extend_from_slice(&chunk);
            if body.len() > MAX_MANIFEST_SIZE {
                return Err(ResolveError::InvalidManifest(format!(
                    "manifest exceeds {} bytes",
                    MAX_MANIFEST_SIZE
                )));
            }
        }

        if root.digest.starts_with("sha256:") {
            let actual = sha256_digest(&body);
            if actual != root.digest {
                return Err(ResolveError::ManifestDigestMismatch {
                    expected: root.digest.clone(),
                    actual,
                });
            }
        }

        ImageManifest::parse(&body).map_err(|e| ResolveError::InvalidManifest(e.to_string()))
    }

    /// Copy one blob layer into the store, joining an identical copy already
    /// in flight
    async fn copy_blob(
        &self,
        fetcher: Arc<dyn Fetcher>,
        desc: Descriptor,
    ) -> Result<Descriptor, ResolveError> {
        let digest = desc.digest.clone();
        let store = self.store.clone();

        self.flight
            .work(&digest, move || copy_into_store(store, fetcher, desc))
            .await
            .map_err(|source| ResolveError::CopyBlob { digest, source })
    }

    /// Stream the bootstrap layer through the extractor into a temp file
    ///
    /// The file is deleted again unless the caller keeps it.
    async fn extract_bootstrap(
        &self,
        fetcher: &dyn Fetcher,
        desc: &Descriptor,
        work_dir: &Path,
    ) -> Result<NamedTempFile, ResolveError> {
        let mut stream = fetcher
            .fetch(desc)
            .await
            .map_err(ResolveError::fetch("fetch bootstrap"))?;

        let file = tempfile::Builder::new()
            .prefix("chunk-dict-bootstrap-")
            .tempfile_in(work_dir)
            .map_err(|source| ResolveError::TempFile {
                path: work_dir.to_path_buf(),
                source,
            })?;

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let extractor = tokio::task::spawn_blocking(move || {
            let mut file = file;
            let result = archive::unpack_file(ChannelReader::new(rx), BOOTSTRAP_FILE_NAME, &mut file);
            (file, result)
        });

        let mut read_error = None;
        loop {
            match next_chunk(&mut stream, self.options.stall_timeout).await {
                Ok(Some(chunk)) => {
                    // The extractor hangs up once it has the member or gives up
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
        }
        drop(tx);

        let (file, result) = extractor.await.map_err(|e| ResolveError::Extract {
            digest: desc.digest.clone(),
            source: ExtractError::Corrupt(io::Error::new(io::ErrorKind::Other, e.to_string())),
        })?;

        if let Some(source) = read_error {
            return Err(ResolveError::Fetch {
                context: format!("read bootstrap layer {}", desc.digest),
                source,
            });
        }

        let size = result.map_err(|source| ResolveError::Extract {
            digest: desc.digest.clone(),
            source,
        })?;
        debug!(digest = %desc.digest, size, "Bootstrap unpacked");

        Ok(file)
    }
}

async fn copy_into_store(
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn Fetcher>,
    desc: Descriptor,
) -> BlobCopyResult {
    match store.info(&desc.digest).await {
        Ok(_) => {
            debug!(digest = %desc.digest, "Blob already in store");
            return Ok(desc);
        }
        Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(Arc::new(e)),
    }

    let stream = fetcher.fetch(&desc).await.map_err(|source| {
        Arc::new(StoreError::Fetch {
            digest: desc.digest.clone(),
            source,
        })
    })?;

    let key = format!("{}{}", COPY_REF_PREFIX, desc.digest);
    store
        .copy(&key, stream, desc.size, &desc.digest)
        .await
        .map_err(Arc::new)?;

    Ok(desc)
}

fn is_bootstrap_layer(desc: &Descriptor) -> bool {
    media_types::is_gzip_layer(&desc.media_type)
        && desc.annotation(LAYER_ANNOTATION_NYDUS_BOOTSTRAP) == "true"
}

/// Both sides default to the baseline version and must then agree exactly
fn reconcile_fs_version(requested: &str, declared: &str) -> Result<String, ResolveError> {
    let or_default = |v: &str| {
        if v.is_empty() {
            DEFAULT_FS_VERSION.to_string()
        } else {
            v.to_string()
        }
    };
    let expected = or_default(requested);
    let actual = or_default(declared);

    if expected != actual {
        return Err(ResolveError::FsVersionMismatch { expected, actual });
    }
    Ok(expected)
}

/// Prepare an export for nydus compression
///
/// Only acts when `config` exports nydus blobs. A configured chunk dictionary
/// is resolved and its bootstrap path recorded in `config`. A dictionary that
/// fails to load is logged and skipped unless the failure means stored content
/// is corrupt. The returned scope carries the compression parameters for the
/// rest of the export.
pub async fn configure(
    scope: &Scope,
    config: &mut ExportConfig,
    resolver: &Resolver,
    source_ref: &str,
) -> Result<Scope, ResolveError> {
    if config.compression != CompressionType::Nydus {
        return Ok(scope.clone());
    }

    let mut chunk_dict_digest = String::new();
    if !config.chunk_dict_image.is_empty() {
        match resolver
            .resolve(source_ref, &config.chunk_dict_image, &config.fs_version)
            .await
        {
            Ok(dict) => {
                config.chunk_dict_path = Some(dict.bootstrap_path);
                chunk_dict_digest = dict.bootstrap_digest;
            }
            Err(e) if e.is_data_corruption() => return Err(e),
            Err(e) => {
                warn!(
                    chunk_dict = %config.chunk_dict_image,
                    error = %e,
                    "nydus: failed to load chunk dict, continuing without it"
                );
            }
        }
    }

    Ok(scope
        .with_compression(&config.fs_version, &config.compressor, &chunk_dict_digest)
        .with_blob_link_key(&config.fs_version, &chunk_dict_digest))
}
