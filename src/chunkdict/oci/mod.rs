/// OCI registry support
///
/// Reference parsing, the manifest model, registry authentication and a
/// client that streams manifests and blobs for the resolver.
pub mod auth;
pub mod manifest;
pub mod reference;
pub mod registry;

pub use manifest::{media_types, Descriptor, ImageManifest};
pub use reference::{ImageReference, Reference, ReferenceError};
pub use registry::{RegistryClient, RegistryTransport};
