use std::time::Duration;

use thiserror::Error;

/// Errors talking to a registry.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP client error (4xx) - non-retryable
    #[error("HTTP error: {0} {1}")]
    HttpClientError(u16, String),
    /// HTTP server error (5xx) - retryable
    #[error("HTTP error: {0} {1}")]
    HttpServerError(u16, String),
    /// HTTP 429 Rate Limited, with optional retry-after seconds
    #[error("HTTP error: 429 Too Many Requests - rate limited")]
    HttpRateLimited(Option<u64>),
    /// TLS/Certificate error - non-retryable
    #[error("TLS/SSL error - certificate validation failed ({0})")]
    TlsError(String),
    #[error("DNS resolution failed - unable to resolve hostname ({0})")]
    DnsError(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Connection timeout - server did not respond in time ({0})")]
    TimeoutError(String),
    #[error("Authentication failed: {0}")]
    AuthError(String),
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Get a human-readable description for an HTTP status code
    fn http_status_description(code: u16) -> String {
        match code {
            400 => "Bad Request".to_string(),
            401 => "Unauthorized - authentication required".to_string(),
            403 => "Forbidden - access denied".to_string(),
            404 => "Not Found - manifest or blob unknown to registry".to_string(),
            429 => "Too Many Requests - rate limited".to_string(),
            500 => "Internal Server Error - server error".to_string(),
            502 => "Bad Gateway - proxy/gateway error".to_string(),
            503 => "Service Unavailable - server temporarily unavailable".to_string(),
            504 => "Gateway Timeout".to_string(),
            _ => "Unknown".to_string(),
        }
    }

    /// Create a FetchError from an HTTP status code
    pub fn from_http_status(status: reqwest::StatusCode) -> Self {
        let code = status.as_u16();
        if code == 429 {
            return FetchError::HttpRateLimited(None);
        }

        let description = Self::http_status_description(code);
        if (400..500).contains(&code) {
            FetchError::HttpClientError(code, description)
        } else {
            FetchError::HttpServerError(code, description)
        }
    }

    /// Create a FetchError from an HTTP response (includes headers for retry-after)
    pub fn from_http_response(response: &reqwest::Response) -> Self {
        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            return FetchError::HttpRateLimited(retry_after);
        }
        Self::from_http_status(response.status())
    }

    /// Create a FetchError from a reqwest::Error
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_status() {
            if let Some(status) = error.status() {
                return Self::from_http_status(status);
            }
        }

        if error.is_timeout() {
            return FetchError::TimeoutError(error.to_string());
        }

        if error.is_connect() {
            let error_str = error.to_string();

            // Type information is erased once errors are boxed, so look at
            // every message in the source chain.
            let mut current: Option<&dyn std::error::Error> = Some(&error);
            while let Some(err) = current {
                let msg = err.to_string().to_lowercase();
                if msg.contains("certificate")
                    || msg.contains("tls")
                    || msg.contains("ssl")
                    || msg.contains("trust setting")
                    || msg.contains("trust policy")
                {
                    return FetchError::TlsError(error_str);
                }
                current = err.source();
            }

            if error_str.contains("dns") || error_str.contains("failed to lookup address") {
                return FetchError::DnsError(error_str);
            }
            return FetchError::ConnectionError(error_str);
        }

        FetchError::Other(error.to_string())
    }

    /// Check if a later attempt could succeed without a configuration change
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpClientError(_, _) => false,
            FetchError::TlsError(_) => false,
            FetchError::AuthError(_) => false,
            FetchError::HttpServerError(_, _) => true,
            FetchError::HttpRateLimited(_) => true,
            FetchError::DnsError(_) => true,
            FetchError::ConnectionError(_) => true,
            FetchError::TimeoutError(_) => true,
            FetchError::Other(_) => true,
        }
    }

    /// Suggested extra delay before retrying, if the registry asked for one
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            FetchError::HttpRateLimited(retry_after_secs) => {
                Some(Duration::from_secs(retry_after_secs.unwrap_or(60)))
            }
            _ => None,
        }
    }
}
