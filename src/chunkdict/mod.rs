// Module declarations
pub mod archive;
pub mod compression;
pub mod context;
mod fetch_error;
pub(crate) mod http;
pub mod nydus;
pub mod oci;
mod options;
pub mod resolver;
pub mod singleflight;
pub mod store;
pub mod stream_utils;

// Public re-exports
pub use archive::{unpack_file, ExtractError};
pub use compression::{Compression, CompressionType};
pub use context::Scope;
pub use fetch_error::FetchError;
pub use oci::{Descriptor, ImageReference, RegistryTransport};
pub use options::{
    ensure_work_dir, work_dir_from_env, ExportConfig, HttpClientOptions, ResolverOptions,
    WORK_DIR_ENV,
};
pub use resolver::{
    configure, BlobCopyResult, ChunkDictionary, ErrorKind, Fetcher, ResolveError, Resolver,
    Transport,
};
pub use singleflight::SingleFlight;
pub use store::{ContentStore, Info, LocalStore, StoreError};
