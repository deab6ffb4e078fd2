/// OCI Registry client
///
/// Implements the parts of the OCI Distribution Specification a chunk
/// dictionary pull needs:
/// - GET /v2/ - API version check and auth challenge
/// - GET /v2/<name>/manifests/<reference> - Resolve and fetch manifests
/// - GET /v2/<name>/blobs/<digest> - Stream blobs
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::auth::{request_token, BearerChallenge, Credentials};
use super::manifest::{media_types, Descriptor, MAX_MANIFEST_SIZE};
use super::reference::{ImageReference, Reference};
use crate::chunkdict::fetch_error::FetchError;
use crate::chunkdict::http::setup_http_client;
use crate::chunkdict::options::{HttpClientOptions, ResolverOptions};
use crate::chunkdict::resolver::{Fetcher, Transport};
use crate::chunkdict::store::sha256_digest;
use crate::chunkdict::stream_utils::BlobStream;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Registry client bound to one repository
pub struct RegistryClient {
    client: Client,
    image_ref: ImageReference,
    credentials: Credentials,
    token: Option<String>,
    plain_http: bool,
    max_retries: usize,
    retry_delay: Duration,
    /// Manifest bodies read while resolving, handed out once by digest
    resolved: Mutex<HashMap<String, Bytes>>,
}

impl RegistryClient {
    /// Build a client for `image_ref` and authenticate against its registry
    pub async fn connect(
        image_ref: ImageReference,
        options: &ResolverOptions,
    ) -> Result<Self, FetchError> {
        let client = setup_http_client(&HttpClientOptions::from(options))?;
        let credentials = Credentials::new(options.username.clone(), options.password.clone());

        let mut registry = Self {
            client,
            image_ref,
            credentials,
            token: None,
            plain_http: options.plain_http,
            max_retries: options.max_retries,
            retry_delay: Duration::from_secs(options.retry_delay_secs),
            resolved: Mutex::new(HashMap::new()),
        };
        registry.authenticate().await?;
        Ok(registry)
    }

    /// Probe `/v2/` and obtain a bearer token if the registry asks for one
    pub async fn authenticate(&mut self) -> Result<(), FetchError> {
        let v2_url = format!("{}/v2/", self.image_ref.registry_url(self.plain_http));
        debug!(url = %v2_url, "Checking registry API");

        let response = self
            .client
            .get(&v2_url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        match response.status() {
            StatusCode::OK => {
                debug!(registry = %self.image_ref.registry, "Registry allows anonymous access");
                Ok(())
            }
            StatusCode::UNAUTHORIZED => {
                let header = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .ok_or_else(|| {
                        FetchError::AuthError("no WWW-Authenticate header in 401 response".into())
                    })?
                    .to_str()
                    .map_err(|e| {
                        FetchError::AuthError(format!("invalid WWW-Authenticate header: {}", e))
                    })?;
                debug!(challenge = %header, "Registry requires authentication");

                // Registries that only speak basic auth get the credentials on
                // every request instead of a token
                if header.to_ascii_lowercase().starts_with("basic") {
                    return match self.credentials {
                        Credentials::Anonymous => Err(FetchError::AuthError(
                            "registry requires basic auth but no credentials were given".into(),
                        )),
                        Credentials::Basic { .. } => Ok(()),
                    };
                }

                let challenge = BearerChallenge::parse(header)?;
                let token = request_token(
                    &self.client,
                    &challenge,
                    &self.image_ref.repository,
                    &self.credentials,
                )
                .await?;
                debug!("Obtained bearer token");

                self.token = Some(token);
                Ok(())
            }
            _ => Err(FetchError::from_http_response(&response)),
        }
    }

    /// Add authorization header to request if we have a token
    fn add_auth(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request.header(AUTHORIZATION, format!("Bearer {}", token))
        } else if let Some(basic) = self.credentials.basic_auth_header() {
            request.header(AUTHORIZATION, basic)
        } else {
            request
        }
    }

    fn url(&self, repository: &str, kind: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/{}/{}",
            self.image_ref.registry_url(self.plain_http),
            repository,
            kind,
            reference
        )
    }

    /// GET `url`, retrying failures a later attempt could fix
    async fn get(&self, url: &str, accept: Option<&str>) -> Result<Response, FetchError> {
        let mut retry_count = 0;
        loop {
            let mut request = self.add_auth(self.client.get(url));
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => FetchError::from_http_response(&response),
                Err(e) => FetchError::from_reqwest(e),
            };

            if !error.is_retryable() || retry_count >= self.max_retries {
                return Err(error);
            }

            let delay = error.suggested_retry_delay().unwrap_or(self.retry_delay);
            retry_count += 1;
            warn!(
                url = %url,
                error = %error,
                attempt = retry_count,
                max_retries = self.max_retries,
                "Registry request failed, retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Fetch the manifest `reference` points at, returning its descriptor and body
    pub async fn fetch_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<(Descriptor, Bytes), FetchError> {
        let url = self.url(
            &reference.repository,
            "manifests",
            &reference.reference_string(),
        );
        debug!(url = %url, "Fetching manifest");

        let response = self.get(&url, Some(&manifest_accept_header())).await?;
        let header_digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_manifest_body(response).await?;

        let computed = sha256_digest(&body);
        let digest = match &reference.reference {
            Reference::Digest(pinned) => {
                if pinned.starts_with("sha256:") && *pinned != computed {
                    return Err(FetchError::Other(format!(
                        "manifest digest mismatch for {}: got {}",
                        reference, computed
                    )));
                }
                pinned.clone()
            }
            Reference::Tag(_) => header_digest.unwrap_or(computed),
        };

        let media_type = manifest_media_type(content_type.as_deref(), &body);
        debug!(
            digest = %digest,
            media_type = %media_type,
            size = body.len(),
            "Resolved manifest"
        );

        Ok((Descriptor::new(media_type, digest, body.len() as u64), body))
    }

    /// Start streaming the content `desc` points at
    ///
    /// A manifest read by `resolve` is served from memory the first time it
    /// is asked for.
    pub async fn get_blob_stream(&self, desc: &Descriptor) -> Result<BlobStream, FetchError> {
        let cached = self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&desc.digest);
        if let Some(body) = cached {
            debug!(digest = %desc.digest, "Serving resolved manifest from memory");
            return Ok(stream::once(async move { Ok::<_, FetchError>(body) }).boxed());
        }

        let (kind, accept) = if media_types::is_image_manifest(&desc.media_type) {
            ("manifests", Some(desc.media_type.as_str()))
        } else {
            ("blobs", None)
        };
        let url = self.url(&self.image_ref.repository, kind, &desc.digest);
        debug!(url = %url, size = desc.size, "Starting blob download");

        let response = self.get(&url, accept).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from_reqwest))
            .boxed())
    }

    pub fn image_ref(&self) -> &ImageReference {
        &self.image_ref
    }
}

#[async_trait]
impl Fetcher for RegistryClient {
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor, FetchError> {
        let (desc, body) = self.fetch_manifest(reference).await?;
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(desc.digest.clone(), body);
        Ok(desc)
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobStream, FetchError> {
        self.get_blob_stream(desc).await
    }
}

/// `Transport` that talks to registries directly over HTTP(S)
///
/// Every fetcher authenticates with the static credentials of its
/// `ResolverOptions`. The source image and session are only logged.
pub struct RegistryTransport {
    options: ResolverOptions,
}

impl RegistryTransport {
    pub fn new(options: ResolverOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Transport for RegistryTransport {
    async fn fetcher(
        &self,
        source_ref: &str,
        session_id: &str,
        target: &ImageReference,
    ) -> Result<Arc<dyn Fetcher>, FetchError> {
        debug!(
            source = %source_ref,
            session = %session_id,
            target = %target,
            "Connecting to registry"
        );
        let client = RegistryClient::connect(target.clone(), &self.options).await?;
        Ok(Arc::new(client))
    }
}

/// Read a manifest body, refusing anything over `MAX_MANIFEST_SIZE`
async fn read_manifest_body(response: Response) -> Result<Bytes, FetchError> {
    let too_large = |size: u64| {
        FetchError::Other(format!(
            "manifest of {} bytes exceeds {} bytes",
            size, MAX_MANIFEST_SIZE
        ))
    };
    if let Some(length) = response.content_length() {
        if length > MAX_MANIFEST_SIZE as u64 {
            return Err(too_large(length));
        }
    }

    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(FetchError::from_reqwest)?;
        body.extend_from_slice(&chunk);
        if body.len() > MAX_MANIFEST_SIZE {
            return Err(too_large(body.len() as u64));
        }
    }
    Ok(Bytes::from(body))
}

fn manifest_accept_header() -> String {
    format!(
        "{}, {}",
        media_types::OCI_MANIFEST,
        media_types::DOCKER_MANIFEST_V2
    )
}

#[derive(Deserialize)]
struct MediaTypeProbe {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

/// Media type from the `Content-Type` header, else the body's `mediaType`
fn manifest_media_type(content_type: Option<&str>, body: &[u8]) -> String {
    let from_header = content_type
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .filter(|ct| !ct.is_empty() && *ct != "application/json");
    if let Some(media_type) = from_header {
        return media_type.to_string();
    }

    serde_json::from_slice::<MediaTypeProbe>(body)
        .ok()
        .and_then(|probe| probe.media_type)
        .unwrap_or_default()
}
