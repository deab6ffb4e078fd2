// Shared test utilities
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chunkdict::chunkdict::nydus::{
    LAYER_ANNOTATION_FS_VERSION, LAYER_ANNOTATION_NYDUS_BLOB, LAYER_ANNOTATION_NYDUS_BOOTSTRAP,
};
use chunkdict::chunkdict::oci::media_types;
use chunkdict::chunkdict::store::sha256_digest;
use chunkdict::chunkdict::stream_utils::BlobStream;
use chunkdict::chunkdict::{
    ContentStore, Descriptor, FetchError, Fetcher, ImageReference, Info, LocalStore, StoreError,
    Transport,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{stream, StreamExt};
use xz2::write::XzEncoder;

/// Install a fmt subscriber honoring RUST_LOG, once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Generate deterministic test data of a given size
pub fn create_test_data(size: usize) -> Vec<u8> {
    // Create a repeating pattern for easier debugging
    let pattern = b"TESTDATA";
    (0..size).map(|i| pattern[i % pattern.len()]).collect()
}

/// Compress data using xz compression
pub fn compress_xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder
        .write_all(data)
        .expect("Failed to write to xz encoder");
    encoder.finish().expect("Failed to finish xz compression")
}

/// Compress data using gzip compression
pub fn compress_gz(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .expect("Failed to write to gz encoder");
    encoder.finish().expect("Failed to finish gz compression")
}

/// Compress data using zstd compression
pub fn compress_zstd(data: &[u8]) -> Vec<u8> {
    zstd::encode_all(data, 3).expect("Failed to zstd compress")
}

/// Build an uncompressed tarball from (name, content) pairs
pub fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *data)
            .expect("Failed to append tar entry");
    }
    builder.into_inner().expect("Failed to finish tarball")
}

/// Gzipped bootstrap layer holding `image/image.boot`
pub fn bootstrap_layer(bootstrap: &[u8]) -> Vec<u8> {
    compress_gz(&build_tar(&[("image/image.boot", bootstrap)]))
}

/// A content-addressed image as a registry would serve it
pub struct TestImage {
    pub manifest_desc: Descriptor,
    pub manifest: Vec<u8>,
    pub blobs: HashMap<String, Vec<u8>>,
    pub layers: Vec<Descriptor>,
}

impl TestImage {
    /// Image whose layers are `blobs` followed by `bootstrap_layer`
    ///
    /// `annotate` may adjust the bootstrap descriptor before the manifest is
    /// serialized.
    pub fn new(
        blobs: &[&[u8]],
        bootstrap_layer: Vec<u8>,
        annotate: impl FnOnce(&mut Descriptor),
    ) -> Self {
        let mut contents = HashMap::new();
        let mut layers = Vec::new();

        for blob in blobs {
            let digest = sha256_digest(blob);
            layers.push(
                Descriptor::new(media_types::NYDUS_BLOB, digest.clone(), blob.len() as u64)
                    .with_annotation(LAYER_ANNOTATION_NYDUS_BLOB, "true"),
            );
            contents.insert(digest, blob.to_vec());
        }

        let digest = sha256_digest(&bootstrap_layer);
        let mut bootstrap = Descriptor::new(
            media_types::OCI_LAYER_GZIP,
            digest.clone(),
            bootstrap_layer.len() as u64,
        )
        .with_annotation(LAYER_ANNOTATION_NYDUS_BOOTSTRAP, "true");
        annotate(&mut bootstrap);
        contents.insert(digest, bootstrap_layer);
        layers.push(bootstrap);

        let config = b"{}".to_vec();
        let config_digest = sha256_digest(&config);
        contents.insert(config_digest.clone(), config);

        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": 2
            },
            "layers": layers,
        }))
        .expect("Failed to serialize manifest");

        let manifest_desc = Descriptor::new(
            media_types::OCI_MANIFEST,
            sha256_digest(&manifest),
            manifest.len() as u64,
        );
        contents.insert(manifest_desc.digest.clone(), manifest.clone());

        Self {
            manifest_desc,
            manifest,
            blobs: contents,
            layers,
        }
    }

    /// Chunk dictionary with the given blobs and bootstrap content
    pub fn chunk_dict(blobs: &[&[u8]], bootstrap: &[u8], fs_version: &str) -> Self {
        let fs_version = fs_version.to_string();
        Self::new(blobs, bootstrap_layer(bootstrap), move |desc| {
            if !fs_version.is_empty() {
                desc.annotations
                    .insert(LAYER_ANNOTATION_FS_VERSION.to_string(), fs_version);
            }
        })
    }
}

/// In-memory registry standing in for a real transport
#[derive(Default)]
pub struct FakeRegistry {
    images: Mutex<HashMap<String, Arc<TestImage>>>,
    fetches: Mutex<HashMap<String, usize>>,
    /// Delay before each blob fetch answers, to widen race windows
    pub fetch_delay: Duration,
    /// Digests whose fetch fails with a connection error
    pub failing: Mutex<Vec<String>>,
    /// Digests served with their first byte flipped
    pub tampered: Mutex<Vec<String>>,
    /// Digests whose stream hangs after the first chunk
    pub stalled: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Serve `image` under `reference` (a full reference string)
    pub fn push(&self, reference: &str, image: TestImage) -> Arc<TestImage> {
        let image = Arc::new(image);
        let key = ImageReference::parse(reference)
            .expect("valid test reference")
            .to_string();
        self.images.lock().unwrap().insert(key, image.clone());
        image
    }

    /// Number of times `digest` was fetched
    pub fn fetch_count(&self, digest: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(digest)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }
}

pub struct FakeFetcher {
    registry: Arc<FakeRegistry>,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor, FetchError> {
        self.registry
            .images
            .lock()
            .unwrap()
            .get(&reference.to_string())
            .map(|image| image.manifest_desc.clone())
            .ok_or_else(|| FetchError::from_http_status(reqwest::StatusCode::NOT_FOUND))
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobStream, FetchError> {
        *self
            .registry
            .fetches
            .lock()
            .unwrap()
            .entry(desc.digest.clone())
            .or_default() += 1;

        if !self.registry.fetch_delay.is_zero() {
            tokio::time::sleep(self.registry.fetch_delay).await;
        }
        if self.registry.failing.lock().unwrap().contains(&desc.digest) {
            return Err(FetchError::ConnectionError("connection reset".to_string()));
        }

        let mut content = self
            .registry
            .images
            .lock()
            .unwrap()
            .values()
            .find_map(|image| image.blobs.get(&desc.digest).cloned())
            .ok_or_else(|| FetchError::from_http_status(reqwest::StatusCode::NOT_FOUND))?;

        if self.registry.tampered.lock().unwrap().contains(&desc.digest) {
            content[0] ^= 0xff;
        }

        // Serve in small chunks so readers see a real stream
        let chunks: Vec<Result<Bytes, FetchError>> = content
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let body = stream::iter(chunks);
        if self.registry.stalled.lock().unwrap().contains(&desc.digest) {
            return Ok(body.take(1).chain(stream::pending()).boxed());
        }
        Ok(body.boxed())
    }
}

pub struct FakeTransport {
    pub registry: Arc<FakeRegistry>,
    pub sessions: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    pub fn new(registry: Arc<FakeRegistry>) -> Self {
        Self {
            registry,
            sessions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetcher(
        &self,
        source_ref: &str,
        session_id: &str,
        _target: &ImageReference,
    ) -> Result<Arc<dyn Fetcher>, FetchError> {
        self.sessions
            .lock()
            .unwrap()
            .push((source_ref.to_string(), session_id.to_string()));
        Ok(Arc::new(FakeFetcher {
            registry: self.registry.clone(),
        }))
    }
}

/// `LocalStore` wrapper counting commits per digest
pub struct CountingStore {
    inner: LocalStore,
    copies: Mutex<HashMap<String, usize>>,
    pub active: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: LocalStore) -> Self {
        Self {
            inner,
            copies: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }

    pub fn copy_count(&self, digest: &str) -> usize {
        self.copies
            .lock()
            .unwrap()
            .get(digest)
            .copied()
            .unwrap_or(0)
    }

    pub fn inner(&self) -> &LocalStore {
        &self.inner
    }
}

#[async_trait]
impl ContentStore for CountingStore {
    async fn info(&self, digest: &str) -> Result<Info, StoreError> {
        self.inner.info(digest).await
    }

    async fn update_labels(
        &self,
        digest: &str,
        labels: HashMap<String, String>,
    ) -> Result<Info, StoreError> {
        self.inner.update_labels(digest, labels).await
    }

    async fn copy(
        &self,
        key: &str,
        stream: BlobStream,
        expected_size: u64,
        expected_digest: &str,
    ) -> Result<Info, StoreError> {
        *self
            .copies
            .lock()
            .unwrap()
            .entry(expected_digest.to_string())
            .or_default() += 1;
        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self
            .inner
            .copy(key, stream, expected_size, expected_digest)
            .await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
