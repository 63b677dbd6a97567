//! Versioned Artifact Store
//!
//! Immutable, named, versioned artifacts with mutable alias pointers.
//!
//! - [`model`]: Artifact, references, versions
//! - [`store`]: The backend-agnostic [`ArtifactStore`] trait
//! - [`local`]: Filesystem backend

pub mod local;
pub mod model;
pub mod store;

pub use local::LocalArtifactStore;
pub use model::{
    Artifact, ArtifactRef, PayloadKind, PublishRequest, Selector, Version, LATEST_ALIAS,
};
pub use store::ArtifactStore;
