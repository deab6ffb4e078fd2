mod common;

use std::sync::Arc;

use chunkdict::chunkdict::oci::{media_types, RegistryClient};
use chunkdict::chunkdict::{
    ContentStore, ErrorKind, FetchError, ImageReference, LocalStore, ResolveError, Resolver,
    ResolverOptions, RegistryTransport, StoreError,
};
use common::{init_tracing, TestImage};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REPO: &str = "nydus/dict";
const SOURCE_REF: &str = "docker.io/library/app:latest";

fn options(tmp: &TempDir) -> ResolverOptions {
    ResolverOptions {
        plain_http: true,
        work_dir: Some(tmp.path().join("work")),
        max_retries: 2,
        retry_delay_secs: 0,
        ..Default::default()
    }
}

fn dict_ref(server: &MockServer, reference: &str) -> String {
    let separator = if reference.starts_with("sha256:") { '@' } else { ':' };
    format!("{}/{}{}{}", server.address(), REPO, separator, reference)
}

async fn serve_api(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Serve every blob and the manifest (by tag and digest) of `image`
async fn serve_image(server: &MockServer, tag: &str, image: &TestImage, auth: Option<&str>) {
    for (digest, content) in &image.blobs {
        let mut mock = Mock::given(method("GET")).and(path(format!("/v2/{}/blobs/{}", REPO, digest)));
        if let Some(auth) = auth {
            mock = mock.and(header("authorization", auth));
        }
        mock.respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
            .mount(server)
            .await;
    }

    for reference in [tag.to_string(), image.manifest_desc.digest.clone()] {
        let mut mock =
            Mock::given(method("GET")).and(path(format!("/v2/{}/manifests/{}", REPO, reference)));
        if let Some(auth) = auth {
            mock = mock.and(header("authorization", auth));
        }
        mock.respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(image.manifest.clone(), media_types::OCI_MANIFEST)
                .insert_header("docker-content-digest", image.manifest_desc.digest.as_str()),
        )
        .mount(server)
        .await;
    }
}

fn resolver(tmp: &TempDir, options: ResolverOptions) -> (Resolver, Arc<LocalStore>) {
    let store = Arc::new(LocalStore::new(tmp.path().join("store")));
    let resolver = Resolver::new(
        Arc::new(RegistryTransport::new(options.clone())),
        store.clone(),
        options,
    );
    (resolver, store)
}

#[tokio::test]
async fn test_resolve_from_registry() {
    init_tracing();
    let server = MockServer::start().await;
    let blobs: [&[u8]; 2] = [b"registry-blob-1", b"registry-blob-2"];
    let image = TestImage::chunk_dict(&blobs, b"registry-bootstrap", "6");
    serve_api(&server).await;
    serve_image(&server, "v1", &image, None).await;

    let tmp = tempfile::tempdir().unwrap();
    let (resolver, store) = resolver(&tmp, options(&tmp));
    let dict = resolver
        .resolve(SOURCE_REF, &dict_ref(&server, "v1"), "6")
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(&dict.bootstrap_path).unwrap(),
        b"registry-bootstrap"
    );
    assert_eq!(dict.bootstrap_digest, image.layers[2].digest);
    for layer in &image.layers[..2] {
        let info = store.info(&layer.digest).await.unwrap();
        assert_eq!(info.size, layer.size);
    }
}

#[tokio::test]
async fn test_manifest_downloaded_once_per_resolve() {
    init_tracing();
    let server = MockServer::start().await;
    let blobs: [&[u8]; 1] = [b"counted-blob"];
    let image = TestImage::chunk_dict(&blobs, b"counted", "");
    serve_api(&server).await;
    serve_image(&server, "v1", &image, None).await;

    let tmp = tempfile::tempdir().unwrap();
    let (resolver, _) = resolver(&tmp, options(&tmp));
    resolver
        .resolve(SOURCE_REF, &dict_ref(&server, "v1"), "")
        .await
        .unwrap();

    let manifest_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path().contains("/manifests/"))
        .count();
    assert_eq!(manifest_requests, 1);
}

#[tokio::test]
async fn test_oversized_manifest_rejected() {
    init_tracing();
    let server = MockServer::start().await;
    serve_api(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/v1", REPO)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(vec![b' '; 5 * 1024 * 1024], media_types::OCI_MANIFEST),
        )
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let reference = ImageReference::parse(&dict_ref(&server, "v1")).unwrap();
    let client = RegistryClient::connect(reference.clone(), &options(&tmp))
        .await
        .unwrap();

    let err = client.fetch_manifest(&reference).await.unwrap_err();
    assert!(err.to_string().contains("exceeds"));
}

#[tokio::test]
async fn test_resolve_by_digest() {
    init_tracing();
    let server = MockServer::start().await;
    let image = TestImage::chunk_dict(&[], b"pinned", "");
    serve_api(&server).await;
    serve_image(&server, "v1", &image, None).await;

    let tmp = tempfile::tempdir().unwrap();
    let (resolver, _) = resolver(&tmp, options(&tmp));
    let dict = resolver
        .resolve(
            SOURCE_REF,
            &dict_ref(&server, &image.manifest_desc.digest),
            "",
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(&dict.bootstrap_path).unwrap(), b"pinned");
}

#[tokio::test]
async fn test_bearer_token_flow() {
    init_tracing();
    let server = MockServer::start().await;
    let image = TestImage::chunk_dict(&[&b"private-blob"[..]], b"private", "");

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "www-authenticate",
            format!(
                r#"Bearer realm="http://{}/token",service="registry.test""#,
                server.address()
            )
            .as_str(),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "secret"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    serve_image(&server, "v1", &image, Some("Bearer secret")).await;

    let tmp = tempfile::tempdir().unwrap();
    let options = ResolverOptions {
        username: Some("user".to_string()),
        password: Some("pass".to_string()),
        ..options(&tmp)
    };
    let (resolver, store) = resolver(&tmp, options);
    resolver
        .resolve(SOURCE_REF, &dict_ref(&server, "v1"), "")
        .await
        .unwrap();
    assert!(store.info(&image.layers[0].digest).await.is_ok());
}

#[tokio::test]
async fn test_manifest_retried_after_server_error() {
    init_tracing();
    let server = MockServer::start().await;
    let image = TestImage::chunk_dict(&[], b"boot", "");
    serve_api(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/v1", REPO)))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    serve_image(&server, "v1", &image, None).await;

    let tmp = tempfile::tempdir().unwrap();
    let (resolver, _) = resolver(&tmp, options(&tmp));
    resolver
        .resolve(SOURCE_REF, &dict_ref(&server, "v1"), "")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_missing_blob_fails_copy() {
    init_tracing();
    let server = MockServer::start().await;
    let mut image = TestImage::chunk_dict(&[&b"gone"[..]], b"boot", "");
    let gone = image.layers[0].digest.clone();
    image.blobs.remove(&gone);
    serve_api(&server).await;
    serve_image(&server, "v1", &image, None).await;

    let tmp = tempfile::tempdir().unwrap();
    let (resolver, _) = resolver(&tmp, options(&tmp));
    let err = resolver
        .resolve(SOURCE_REF, &dict_ref(&server, "v1"), "")
        .await
        .unwrap_err();

    match &err {
        ResolveError::CopyBlob { digest, source } => {
            assert_eq!(digest, &gone);
            assert!(matches!(
                **source,
                StoreError::Fetch {
                    source: FetchError::HttpClientError(404, _),
                    ..
                }
            ));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn test_unreachable_registry_is_transport_error() {
    init_tracing();
    // Nothing listens on a port that was bound and released
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let reference = format!("{}/{}:v1", listener.local_addr().unwrap(), REPO);
    drop(listener);

    let tmp = tempfile::tempdir().unwrap();
    let options = ResolverOptions {
        max_retries: 0,
        ..options(&tmp)
    };
    let (resolver, _) = resolver(&tmp, options);
    let err = resolver
        .resolve(SOURCE_REF, &reference, "")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn test_client_resolves_manifest_descriptor() {
    init_tracing();
    let server = MockServer::start().await;
    let image = TestImage::chunk_dict(&[], b"boot", "");
    serve_api(&server).await;
    serve_image(&server, "v1", &image, None).await;

    let tmp = tempfile::tempdir().unwrap();
    let reference = ImageReference::parse(&dict_ref(&server, "v1")).unwrap();
    let client = RegistryClient::connect(reference.clone(), &options(&tmp))
        .await
        .unwrap();

    let (desc, body) = client.fetch_manifest(&reference).await.unwrap();
    assert_eq!(desc, image.manifest_desc);
    assert_eq!(body.as_ref(), image.manifest.as_slice());
}

#[tokio::test]
async fn test_client_rejects_tampered_pinned_manifest() {
    init_tracing();
    let server = MockServer::start().await;
    let image = TestImage::chunk_dict(&[], b"boot", "");
    let other = TestImage::chunk_dict(&[], b"other", "");
    serve_api(&server).await;

    // Serve a different manifest under the pinned digest
    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/{}/manifests/{}",
            REPO, image.manifest_desc.digest
        )))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(other.manifest.clone(), media_types::OCI_MANIFEST),
        )
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let reference =
        ImageReference::parse(&dict_ref(&server, &image.manifest_desc.digest)).unwrap();
    let client = RegistryClient::connect(reference.clone(), &options(&tmp))
        .await
        .unwrap();

    let err = client.fetch_manifest(&reference).await.unwrap_err();
    assert!(err.to_string().contains("digest mismatch"));
}
