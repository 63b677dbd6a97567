//! Artifact Store Interface
//!
//! The orchestrator only talks to artifacts through this trait, so the
//! physical backend (local disk, object store, database) stays swappable.

use std::path::{Path, PathBuf};

use crate::error::Result;

use super::model::{Artifact, ArtifactRef, PublishRequest, Version};

/// Versioned, aliased artifact storage.
///
/// Implementations must make `publish` atomic per `(name, version)` so two
/// concurrent runs never claim the same version, and `set_alias` must be
/// last-writer-wins.
pub trait ArtifactStore: Send + Sync {
    /// Resolves a reference to a concrete artifact version.
    ///
    /// Fails with `UnknownArtifact` when the name or version does not exist
    /// and `UnknownAlias` when the alias is unset.
    fn resolve(&self, reference: &ArtifactRef) -> Result<Artifact>;

    /// Stores a new immutable version and moves `latest` to it.
    fn publish(&self, request: PublishRequest) -> Result<Artifact>;

    /// Publishes several artifacts as one unit.
    ///
    /// Either every request gets a new version and `latest` moves for all
    /// of them, or none of them is visible in the store afterwards.
    fn publish_all(&self, requests: Vec<PublishRequest>) -> Result<Vec<Artifact>>;

    /// Materializes the payload under `workspace` and returns its path.
    ///
    /// Repeated fetches of the same version are cache hits.
    fn fetch(&self, artifact: &Artifact, workspace: &Path) -> Result<PathBuf>;

    /// Points `alias` at `version`, overwriting any previous target.
    fn set_alias(&self, name: &str, alias: &str, version: Version) -> Result<()>;

    /// All versions published under `name`, oldest first.
    fn versions(&self, name: &str) -> Result<Vec<Artifact>>;

    /// Alias → version pairs for `name`, sorted by alias.
    fn aliases(&self, name: &str) -> Result<Vec<(String, Version)>>;

    /// All artifact names present in the store, sorted.
    fn names(&self) -> Result<Vec<String>>;

    /// Root location, exported to steps so they can inspect the store.
    fn location(&self) -> Option<&Path> {
        None
    }

    /// Parses and resolves a textual reference.
    fn resolve_str(&self, reference: &str) -> Result<Artifact> {
        self.resolve(&ArtifactRef::parse(reference)?)
    }
}
