use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::chunkdict::fetch_error::FetchError;
use crate::chunkdict::options::HttpClientOptions;

/// Build the HTTP client used for registry traffic
pub(crate) fn setup_http_client(options: &HttpClientOptions) -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .http2_adaptive_window(true)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(10)))
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(30))
        .user_agent(concat!("chunkdict/", env!("CARGO_PKG_VERSION")));

    if let Some(ca_cert_path) = &options.cacert {
        debug!(path = %ca_cert_path.display(), "Loading CA certificate");
        let cert_bytes = std::fs::read(ca_cert_path).map_err(|e| {
            FetchError::TlsError(format!(
                "failed to read CA certificate {}: {}",
                ca_cert_path.display(),
                e
            ))
        })?;
        let cert = reqwest::Certificate::from_pem(&cert_bytes)
            .map_err(|e| FetchError::TlsError(format!("failed to parse CA certificate: {}", e)))?;
        builder = builder.add_root_certificate(cert);
    }

    if options.insecure_tls {
        warn!("Certificate verification is disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(FetchError::from_reqwest)
}
