/// Image reference parsing
///
/// Supports formats:
/// - registry.example.com/namespace/repo:tag
/// - registry.example.com/namespace/repo@sha256:digest
/// - registry.example.com/namespace/repo:tag@sha256:digest (the digest wins)
/// - namespace/repo:tag (Docker Hub)
/// - repo:tag (Docker Hub library)
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,
    #[error("invalid digest {digest}: {reason}")]
    InvalidDigest { digest: String, reason: String },
    #[error("invalid repository name {0:?}")]
    InvalidRepository(String),
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
}

/// Parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "myorg/myimage")
    pub repository: String,
    pub reference: Reference,
}

/// Reference type - either a tag or a digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(t) => write!(f, "{}", t),
            Reference::Digest(d) => write!(f, "{}", d),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(t) => write!(f, "{}/{}:{}", self.registry, self.repository, t),
            Reference::Digest(d) => write!(f, "{}/{}@{}", self.registry, self.repository, d),
        }
    }
}

impl ImageReference {
    /// Parse and normalize an image reference string
    ///
    /// Examples:
    /// - "ghcr.io/org/dict:v1" -> ghcr.io, org/dict, v1
    /// - "dict:latest" -> docker.io, library/dict, latest
    /// - "registry.example.com:5000/dict" -> registry.example.com:5000, dict, latest
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (name_part, reference) = if let Some((name_part, digest)) = input.rsplit_once('@') {
            validate_digest(digest)?;

            // `name:tag@digest` is pinned by the digest; the tag is only checked
            let (name, tag) = split_name_and_tag(name_part);
            if let Some(tag) = tag {
                validate_tag(tag)?;
            }

            (name, Reference::Digest(digest.to_string()))
        } else {
            let (name, tag) = split_name_and_tag(input);
            let tag = tag.unwrap_or("latest");
            validate_tag(tag)?;
            (name, Reference::Tag(tag.to_string()))
        };

        let (registry, repository) = parse_registry_and_repo(name_part)?;

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Tag or digest to put in manifest requests
    pub fn reference_string(&self) -> String {
        self.reference.to_string()
    }

    /// Base URL of the registry API
    pub fn registry_url(&self, plain_http: bool) -> String {
        let scheme = if plain_http { "http" } else { "https" };
        // Docker Hub serves the registry API from a different host
        if self.registry == "docker.io" {
            format!("{}://registry-1.docker.io", scheme)
        } else {
            format!("{}://{}", scheme, self.registry)
        }
    }
}

/// Validate digest format: `algorithm:hex`, lowercase hex of the algorithm's length
pub fn validate_digest(digest: &str) -> Result<(), ReferenceError> {
    let invalid = |reason: String| ReferenceError::InvalidDigest {
        digest: digest.to_string(),
        reason,
    };

    let (algorithm, hash) = digest
        .split_once(':')
        .ok_or_else(|| invalid("missing ':'".to_string()))?;

    let expected_len = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        _ => {
            return Err(invalid(format!(
                "unsupported digest algorithm '{}' (expected sha256 or sha512)",
                algorithm
            )))
        }
    };

    if hash.len() != expected_len {
        return Err(invalid(format!(
            "expected {} hex characters, got {}",
            expected_len,
            hash.len()
        )));
    }

    if !hash
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return Err(invalid(
            "must contain only lowercase hex characters (0-9, a-f)".to_string(),
        ));
    }

    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok || tag.len() > 128 {
        return Err(ReferenceError::InvalidTag(tag.to_string()));
    }
    Ok(())
}

/// Repository path components are lowercase alphanumerics joined by separators
fn validate_repository(repository: &str) -> Result<(), ReferenceError> {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let component_ok = |component: &str| {
        component.starts_with(alnum)
            && component.ends_with(alnum)
            && component
                .chars()
                .all(|c| alnum(c) || matches!(c, '.' | '_' | '-'))
    };

    if repository.split('/').all(component_ok) {
        Ok(())
    } else {
        Err(ReferenceError::InvalidRepository(repository.to_string()))
    }
}

/// Check if a string looks like a hostname (contains dot, is localhost, or is IP literal)
fn looks_like_hostname(authority: &str) -> bool {
    authority.contains('.') || authority == "localhost" || authority.starts_with('[')
}

/// Split image name and tag, handling registry ports correctly
fn split_name_and_tag(input: &str) -> (&str, Option<&str>) {
    let Some((before_colon, after_colon)) = input.rsplit_once(':') else {
        return (input, None);
    };

    // registry:port/repo, no tag
    if after_colon.contains('/') {
        return (input, None);
    }

    // "host.name:5000" alone is a registry with a port, not an image with a tag
    if !before_colon.contains('/')
        && after_colon.len() <= 5
        && after_colon.chars().all(|c| c.is_ascii_digit())
        && looks_like_hostname(before_colon)
    {
        return (input, None);
    }

    (before_colon, Some(after_colon))
}

/// Parse registry and repository from the name part
fn parse_registry_and_repo(name: &str) -> Result<(String, String), ReferenceError> {
    let (registry, repository) = match name.split_once('/') {
        None => ("docker.io".to_string(), format!("library/{}", name)),
        Some((first, rest)) => {
            // A registry has a dot, a port, or is localhost
            if first == "docker.io" && !rest.contains('/') {
                (first.to_string(), format!("library/{}", rest))
            } else if first.contains('.') || first.contains(':') || first == "localhost" {
                (first.to_string(), rest.to_string())
            } else {
                ("docker.io".to_string(), name.to_string())
            }
        }
    };

    validate_repository(&repository)?;
    Ok((registry, repository))
}
