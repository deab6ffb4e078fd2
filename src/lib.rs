// Library module for chunkdict
// Resolves nydus chunk dictionary images and carries their compression
// parameters through an export.

pub mod chunkdict;

// Re-export the main public API
pub use chunkdict::{
    configure, ChunkDictionary, ContentStore, LocalStore, ResolveError, Resolver,
    ResolverOptions, Scope,
};
