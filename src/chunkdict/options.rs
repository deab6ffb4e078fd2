use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunkdict::compression::CompressionType;

/// Environment variable naming the scratch directory for bootstrap files
pub const WORK_DIR_ENV: &str = "NYDUS_WORKDIR";

/// Options for resolving chunk dictionary images
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub insecure_tls: bool,
    pub cacert: Option<PathBuf>,
    /// Talk to registries over plain http instead of https
    pub plain_http: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Session identity handed to the transport when building a fetcher
    pub session_id: String,
    /// Scratch directory; `None` reads it from the environment
    pub work_dir: Option<PathBuf>,
    /// Deadline for a whole resolution
    pub timeout: Option<Duration>,
    /// Deadline for each chunk of a streamed blob
    pub stall_timeout: Duration,
    /// Attempts after the first for retryable registry requests
    pub max_retries: usize,
    pub retry_delay_secs: u64,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            insecure_tls: false,
            cacert: None,
            plain_http: false,
            username: None,
            password: None,
            session_id: String::new(),
            work_dir: None,
            timeout: None,
            stall_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay_secs: 2,
        }
    }
}

impl ResolverOptions {
    /// The configured working directory, or the one named by the environment
    pub fn resolve_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(work_dir_from_env)
    }
}

/// Options for HTTP client setup
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub insecure_tls: bool,
    pub cacert: Option<PathBuf>,
}

impl From<&ResolverOptions> for HttpClientOptions {
    fn from(opts: &ResolverOptions) -> Self {
        Self {
            insecure_tls: opts.insecure_tls,
            cacert: opts.cacert.clone(),
        }
    }
}

/// Compression settings of the image being exported
#[derive(Debug, Clone, Default)]
pub struct ExportConfig {
    pub compression: CompressionType,
    /// Reference of the chunk dictionary image, empty when not configured
    pub chunk_dict_image: String,
    pub fs_version: String,
    pub compressor: String,
    /// Local bootstrap path, filled in once the dictionary is resolved
    pub chunk_dict_path: Option<PathBuf>,
}

/// Working directory from `NYDUS_WORKDIR`, falling back to the system temp dir
pub fn work_dir_from_env() -> PathBuf {
    match std::env::var_os(WORK_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    }
}

/// Create the working directory (and parents) readable only by the owner
pub fn ensure_work_dir(path: &Path) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}
