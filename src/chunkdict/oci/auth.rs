/// Registry authentication
///
/// Token flow: probe `/v2/`, parse the `WWW-Authenticate` challenge from a
/// 401, exchange credentials for a bearer token scoped to pull access, then
/// send that token on every request.
use std::collections::HashMap;

use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::chunkdict::fetch_error::FetchError;

/// Authentication credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
}

impl Credentials {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        match (username, password) {
            (Some(username), Some(password)) => Credentials::Basic { username, password },
            _ => Credentials::Anonymous,
        }
    }

    /// Encode as basic auth header value
    pub fn basic_auth_header(&self) -> Option<String> {
        match self {
            Credentials::Anonymous => None,
            Credentials::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                Some(format!("Basic {}", encoded))
            }
        }
    }
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge
#[derive(Debug, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parse `Bearer realm="...",service="...",scope="..."`
    pub fn parse(header: &str) -> Result<Self, FetchError> {
        let params_str = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .unwrap_or(header);

        let mut params = parse_auth_params(params_str);
        let realm = params.remove("realm").ok_or_else(|| {
            FetchError::AuthError("missing realm in WWW-Authenticate header".to_string())
        })?;

        Ok(Self {
            realm,
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }

    /// Token endpoint URL with service and pull scope for `repository`
    pub fn token_url(&self, repository: &str) -> String {
        let scope = self
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", repository));

        let mut query = Vec::with_capacity(2);
        if let Some(service) = &self.service {
            query.push(format!("service={}", url_encode(service)));
        }
        query.push(format!("scope={}", url_encode(&scope)));

        let separator = if self.realm.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.realm, separator, query.join("&"))
    }
}

/// Parse comma separated `key="value"` pairs
fn parse_auth_params(s: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut in_quotes = false;

    for c in s.chars() {
        match c {
            '=' if !in_value => in_value = true,
            '"' if in_value => {
                if in_quotes {
                    params.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                    in_value = false;
                }
                in_quotes = !in_quotes;
            }
            ',' if !in_quotes => {
                if in_value && !value.is_empty() {
                    params.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                    in_value = false;
                }
            }
            ' ' if !in_quotes && !in_value => {}
            _ if in_value => value.push(c),
            _ => key.push(c),
        }
    }

    if in_value && !value.is_empty() {
        params.insert(key, value);
    }

    params
}

/// Percent-encode a query parameter value
fn url_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char)
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

/// Token response from auth service
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Request a bearer token from the auth service
pub async fn request_token(
    client: &Client,
    challenge: &BearerChallenge,
    repository: &str,
    credentials: &Credentials,
) -> Result<String, FetchError> {
    let token_url = challenge.token_url(repository);
    debug!(url = %token_url, "Requesting registry token");

    let mut request = client.get(&token_url);
    if let Some(auth_header) = credentials.basic_auth_header() {
        request = request.header("Authorization", auth_header);
    }

    let response = request.send().await.map_err(FetchError::from_reqwest)?;
    if !response.status().is_success() {
        return Err(FetchError::AuthError(format!(
            "token request failed with status: {}",
            response.status()
        )));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| FetchError::AuthError(format!("failed to parse token response: {}", e)))?;

    // Some registries answer with `token`, others with `access_token`
    body.token
        .or(body.access_token)
        .ok_or_else(|| FetchError::AuthError("no token in response".to_string()))
}
