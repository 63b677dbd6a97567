//! Filesystem Artifact Store
//!
//! Stores artifacts under a root directory:
//!
//! ```text
//! <root>/<name>/versions/v<N>/manifest.json
//! <root>/<name>/versions/v<N>/payload/<file-or-dir>
//! <root>/<name>/aliases/<alias>            contains "v<N>"
//! <root>/<name>/.staging-<uuid>/           transient, during publish
//! ```
//!
//! A version is claimed by renaming a fully staged directory into
//! `versions/`. The rename fails when the target already exists, which is
//! what keeps `(name, version)` write-once across concurrent publishers.
//! Alias pointers are replaced by rename as well, so readers never observe
//! a half-written pointer.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, RunError};

use super::model::{
    validate_alias, validate_name, Artifact, ArtifactRef, PayloadKind, PublishRequest, Selector,
    Version, LATEST_ALIAS,
};
use super::store::ArtifactStore;

const MANIFEST_FILE: &str = "manifest.json";
const PAYLOAD_DIR: &str = "payload";
const VERSIONS_DIR: &str = "versions";
const ALIASES_DIR: &str = "aliases";
const FETCH_MARKER: &str = ".complete";

/// Upper bound on version claims lost to concurrent publishers.
const MAX_PUBLISH_ATTEMPTS: usize = 32;

/// Artifact store backed by a local (or network-mounted) directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Opens the store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| RunError::io("failed to create artifact store", &root, e))?;
        debug!("Artifact store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn version_dir(&self, name: &str, version: Version) -> PathBuf {
        self.artifact_dir(name)
            .join(VERSIONS_DIR)
            .join(version.to_string())
    }

    fn alias_path(&self, name: &str, alias: &str) -> PathBuf {
        self.artifact_dir(name).join(ALIASES_DIR).join(alias)
    }

    fn read_manifest(&self, name: &str, version: Version) -> Result<Artifact> {
        let dir = self.version_dir(name, version);
        let manifest_path = dir.join(MANIFEST_FILE);

        let content = match fs::read_to_string(&manifest_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RunError::UnknownArtifact {
                    name: name.to_string(),
                    version: Some(version.to_string()),
                })
            }
            Err(e) => return Err(RunError::io("failed to read manifest", manifest_path, e)),
        };

        let mut artifact: Artifact = serde_json::from_str(&content)
            .map_err(|e| RunError::json(format!("manifest of {}:{}", name, version), e))?;
        artifact.payload_path = dir.join(PAYLOAD_DIR).join(&artifact.payload_name);
        Ok(artifact)
    }

    /// Version numbers present on disk, ascending.
    fn version_numbers(&self, name: &str) -> Result<Vec<Version>> {
        let dir = self.artifact_dir(name).join(VERSIONS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RunError::io("failed to list versions", dir, e)),
        };

        let mut versions: Vec<Version> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(Version::parse))
            .collect();
        versions.sort();
        Ok(versions)
    }

    /// Copies the payload into the staging directory and writes the manifest
    /// for the first version number, returning the unfinished artifact.
    fn stage(&self, request: &PublishRequest, staging: &Path) -> Result<Artifact> {
        let payload_name = request
            .payload
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| RunError::InvalidReference {
                reference: request.payload.display().to_string(),
                reason: "payload path has no file name".to_string(),
            })?;

        let metadata = fs::metadata(&request.payload)
            .map_err(|e| RunError::io("failed to read payload", &request.payload, e))?;
        let payload_kind = if metadata.is_dir() {
            PayloadKind::Directory
        } else {
            PayloadKind::File
        };

        let payload_root = staging.join(PAYLOAD_DIR);
        fs::create_dir_all(&payload_root)
            .map_err(|e| RunError::io("failed to create staging directory", &payload_root, e))?;
        copy_recursively(&request.payload, &payload_root.join(&payload_name))?;

        let digest = digest_path(&request.payload)?;

        Ok(Artifact {
            name: request.name.clone(),
            version: Version(0),
            artifact_type: request.artifact_type.clone(),
            description: request.description.clone(),
            metadata: request.metadata.clone(),
            payload_name,
            payload_kind,
            digest,
            created_at: Utc::now(),
            payload_path: PathBuf::new(),
        })
    }

    fn write_manifest(dir: &Path, artifact: &Artifact) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(artifact)
            .map_err(|e| RunError::json(format!("manifest of {}", artifact.name), e))?;
        fs::write(&path, json).map_err(|e| RunError::io("failed to write manifest", path, e))
    }

    /// Claims the next free version by renaming the staged directory.
    fn claim_version(&self, staging: &Path, artifact: &mut Artifact) -> Result<()> {
        let versions_dir = self.artifact_dir(&artifact.name).join(VERSIONS_DIR);
        fs::create_dir_all(&versions_dir)
            .map_err(|e| RunError::io("failed to create versions directory", &versions_dir, e))?;

        let mut candidate = self
            .version_numbers(&artifact.name)?
            .last()
            .map(|v| v.next())
            .unwrap_or(Version(0));

        for _ in 0..MAX_PUBLISH_ATTEMPTS {
            artifact.version = candidate;
            Self::write_manifest(staging, artifact)?;

            let target = versions_dir.join(candidate.to_string());
            match fs::rename(staging, &target) {
                Ok(()) => {
                    artifact.payload_path = target.join(PAYLOAD_DIR).join(&artifact.payload_name);
                    return Ok(());
                }
                Err(_) if target.exists() => {
                    debug!(
                        "Version {} of '{}' claimed concurrently, retrying",
                        candidate, artifact.name
                    );
                    candidate = candidate.next();
                }
                Err(e) => return Err(RunError::io("failed to commit version", target, e)),
            }
        }

        Err(RunError::DuplicateVersion {
            name: artifact.name.clone(),
            version: candidate.to_string(),
        })
    }

    /// Stages one request in a fresh `.staging-<uuid>` directory.
    fn stage_request(&self, request: &PublishRequest) -> Result<Staged> {
        validate_name(&request.name).map_err(|reason| RunError::InvalidReference {
            reference: request.name.clone(),
            reason,
        })?;

        let staging = self
            .artifact_dir(&request.name)
            .join(format!(".staging-{}", Uuid::new_v4()));
        fs::create_dir_all(&staging)
            .map_err(|e| RunError::io("failed to create staging directory", &staging, e))?;

        match self.stage(request, &staging) {
            Ok(artifact) => Ok(Staged { staging, artifact }),
            Err(e) => {
                self.discard(&staging, &request.name);
                Err(e)
            }
        }
    }

    /// Removes a staging directory, and the name directory if nothing else is in it.
    fn discard(&self, staging: &Path, name: &str) {
        if staging.exists() {
            if let Err(e) = fs::remove_dir_all(staging) {
                warn!("Failed to remove staging {}: {}", staging.display(), e);
            }
        }
        // Only succeeds when nothing was ever published under this name
        let _ = fs::remove_dir(self.artifact_dir(name));
    }

    /// Deletes a claimed version no alias points at yet.
    fn retract(&self, artifact: &Artifact) {
        let dir = self.version_dir(&artifact.name, artifact.version);
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!("Retracted {}", artifact.reference()),
            Err(e) => warn!("Failed to retract {}: {}", artifact.reference(), e),
        }
    }

    fn has_versions(&self, name: &str) -> Result<bool> {
        Ok(!self.version_numbers(name)?.is_empty())
    }
}

/// A fully copied payload that is not visible in the store yet.
struct Staged {
    staging: PathBuf,
    artifact: Artifact,
}

impl ArtifactStore for LocalArtifactStore {
    fn resolve(&self, reference: &ArtifactRef) -> Result<Artifact> {
        let name = &reference.name;
        if !self.has_versions(name)? {
            return Err(RunError::UnknownArtifact {
                name: name.clone(),
                version: None,
            });
        }

        let version = match &reference.selector {
            Selector::Version(v) => *v,
            Selector::Alias(alias) => {
                let pointer = self.alias_path(name, alias);
                let content = match fs::read_to_string(&pointer) {
                    Ok(content) => content,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(RunError::UnknownAlias {
                            name: name.clone(),
                            alias: alias.clone(),
                        })
                    }
                    Err(e) => return Err(RunError::io("failed to read alias", pointer, e)),
                };
                Version::parse(content.trim()).ok_or_else(|| RunError::InvalidReference {
                    reference: reference.to_string(),
                    reason: format!("alias file holds '{}'", content.trim()),
                })?
            }
        };

        let artifact = self.read_manifest(name, version)?;
        debug!("Resolved {} -> {}", reference, artifact.reference());
        Ok(artifact)
    }

    fn publish(&self, request: PublishRequest) -> Result<Artifact> {
        let name = request.name.clone();
        self.publish_all(vec![request])?
            .pop()
            .ok_or(RunError::UnknownArtifact {
                name,
                version: None,
            })
    }

    fn publish_all(&self, requests: Vec<PublishRequest>) -> Result<Vec<Artifact>> {
        let mut staged: Vec<Staged> = Vec::with_capacity(requests.len());
        for request in &requests {
            match self.stage_request(request) {
                Ok(s) => staged.push(s),
                Err(e) => {
                    for s in &staged {
                        self.discard(&s.staging, &s.artifact.name);
                    }
                    return Err(e);
                }
            }
        }

        let mut claimed: Vec<Artifact> = Vec::with_capacity(staged.len());
        let mut pending = staged.into_iter();
        while let Some(mut s) = pending.next() {
            if let Err(e) = self.claim_version(&s.staging, &mut s.artifact) {
                self.discard(&s.staging, &s.artifact.name);
                for rest in pending.by_ref() {
                    self.discard(&rest.staging, &rest.artifact.name);
                }
                for artifact in &claimed {
                    self.retract(artifact);
                }
                return Err(e);
            }
            claimed.push(s.artifact);
        }

        // Nothing is reachable through an alias until every version is claimed
        for artifact in &claimed {
            self.set_alias(&artifact.name, LATEST_ALIAS, artifact.version)?;
            info!(
                "Published {} ({}, sha256 {})",
                artifact.reference(),
                artifact.artifact_type,
                &artifact.digest[..artifact.digest.len().min(12)]
            );
        }
        Ok(claimed)
    }

    fn fetch(&self, artifact: &Artifact, workspace: &Path) -> Result<PathBuf> {
        let dest_dir = workspace
            .join("artifacts")
            .join(&artifact.name)
            .join(artifact.version.to_string());
        let dest = dest_dir.join(&artifact.payload_name);
        let marker = dest_dir.join(FETCH_MARKER);

        if let Ok(expected) = fs::read_to_string(&marker) {
            match digest_path(&dest) {
                Ok(actual) if actual == expected.trim() => {
                    debug!("Fetch cache hit for {}", artifact.reference());
                    return Ok(dest);
                }
                _ => warn!(
                    "Fetched copy of {} was modified, fetching it again",
                    artifact.reference()
                ),
            }
        }

        if dest_dir.exists() {
            // Leftover from an interrupted or tampered fetch
            fs::remove_dir_all(&dest_dir)
                .map_err(|e| RunError::io("failed to clear partial fetch", &dest_dir, e))?;
        }
        fs::create_dir_all(&dest_dir)
            .map_err(|e| RunError::io("failed to create fetch directory", &dest_dir, e))?;

        copy_recursively(&artifact.payload_path, &dest)?;
        fs::write(&marker, artifact.digest.as_bytes())
            .map_err(|e| RunError::io("failed to write fetch marker", &marker, e))?;

        debug!("Fetched {} into {}", artifact.reference(), dest.display());
        Ok(dest)
    }

    fn set_alias(&self, name: &str, alias: &str, version: Version) -> Result<()> {
        validate_name(name).map_err(|reason| RunError::InvalidReference {
            reference: name.to_string(),
            reason,
        })?;
        validate_alias(alias).map_err(|reason| RunError::InvalidReference {
            reference: format!("{}:{}", name, alias),
            reason,
        })?;

        if !self.version_dir(name, version).join(MANIFEST_FILE).exists() {
            return Err(RunError::UnknownArtifact {
                name: name.to_string(),
                version: Some(version.to_string()),
            });
        }

        let aliases_dir = self.artifact_dir(name).join(ALIASES_DIR);
        fs::create_dir_all(&aliases_dir)
            .map_err(|e| RunError::io("failed to create aliases directory", &aliases_dir, e))?;

        let tmp = aliases_dir.join(format!(".{}.{}.tmp", alias, Uuid::new_v4()));
        fs::write(&tmp, version.to_string())
            .map_err(|e| RunError::io("failed to write alias", &tmp, e))?;

        let target = aliases_dir.join(alias);
        fs::rename(&tmp, &target).map_err(|e| RunError::io("failed to update alias", target, e))?;

        debug!("Alias {}:{} -> {}", name, alias, version);
        Ok(())
    }

    fn versions(&self, name: &str) -> Result<Vec<Artifact>> {
        self.version_numbers(name)?
            .into_iter()
            .map(|v| self.read_manifest(name, v))
            .collect()
    }

    fn aliases(&self, name: &str) -> Result<Vec<(String, Version)>> {
        let dir = self.artifact_dir(name).join(ALIASES_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RunError::io("failed to list aliases", dir, e)),
        };

        let mut aliases = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let Some(alias) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if alias.starts_with('.') {
                continue;
            }
            let content = fs::read_to_string(entry.path())
                .map_err(|e| RunError::io("failed to read alias", entry.path(), e))?;
            if let Some(version) = Version::parse(content.trim()) {
                aliases.push((alias, version));
            }
        }
        aliases.sort();
        Ok(aliases)
    }

    fn names(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| RunError::io("failed to list artifact store", &self.root, e))?;

        let mut names = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            // A name left behind by an interrupted publish holds no versions
            if self.has_versions(&name)? {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// Copies a file, or a directory tree, to `dest`.
pub(crate) fn copy_recursively(src: &Path, dest: &Path) -> Result<()> {
    let metadata =
        fs::metadata(src).map_err(|e| RunError::io("failed to read payload", src, e))?;

    if metadata.is_file() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RunError::io("failed to create directory", parent, e))?;
        }
        fs::copy(src, dest).map_err(|e| RunError::io("failed to copy payload", src, e))?;
        return Ok(());
    }

    fs::create_dir_all(dest).map_err(|e| RunError::io("failed to create directory", dest, e))?;
    let entries =
        fs::read_dir(src).map_err(|e| RunError::io("failed to read directory", src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| RunError::io("failed to read directory", src, e))?;
        copy_recursively(&entry.path(), &dest.join(entry.file_name()))?;
    }
    Ok(())
}

/// Hex sha256 of a file, or of a directory's sorted relative paths and contents.
pub(crate) fn digest_path(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    hash_into(&mut hasher, path, Path::new(""))?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_into(hasher: &mut Sha256, path: &Path, relative: &Path) -> Result<()> {
    let metadata =
        fs::metadata(path).map_err(|e| RunError::io("failed to read payload", path, e))?;

    if metadata.is_file() {
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let mut file =
            fs::File::open(path).map_err(|e| RunError::io("failed to open payload", path, e))?;
        let mut buffer = [0u8; 8192];
        loop {
            let n = file
                .read(&mut buffer)
                .map_err(|e| RunError::io("failed to read payload", path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        return Ok(());
    }

    let mut children: Vec<_> = fs::read_dir(path)
        .map_err(|e| RunError::io("failed to read directory", path, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    children.sort();

    for child in children {
        hash_into(hasher, &path.join(&child), &relative.join(&child))?;
    }
    Ok(())
}
