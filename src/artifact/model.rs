//! Artifact Data Model
//!
//! An artifact is an immutable, named, versioned unit of data produced by a
//! step. Steps never hold direct handles to each other's outputs; they name
//! them through references of the form `name:alias_or_version`.
//!
//! # Reference Format
//!
//! ```text
//! clean_sample.csv:latest        alias
//! clean_sample.csv:v3            concrete version
//! clean_sample.csv               same as :latest
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RunError};

/// Alias moved to every newly published version.
pub const LATEST_ALIAS: &str = "latest";

/// A monotonic per-name version identifier (`v0`, `v1`, ...).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Version(pub u64);

impl Version {
    /// Returns the version that follows this one.
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }

    /// Parses `v<digits>`, returning `None` for anything else.
    pub fn parse(text: &str) -> Option<Self> {
        let digits = text.strip_prefix('v')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(Version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl TryFrom<String> for Version {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Version::parse(&value).ok_or_else(|| format!("invalid version identifier '{}'", value))
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

/// What a reference points at after the colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Version(Version),
    Alias(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Version(v) => write!(f, "{}", v),
            Selector::Alias(a) => write!(f, "{}", a),
        }
    }
}

/// A parsed `name:alias_or_version` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub name: String,
    pub selector: Selector,
}

impl ArtifactRef {
    pub fn version(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            selector: Selector::Version(version),
        }
    }

    pub fn alias(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: Selector::Alias(alias.into()),
        }
    }

    /// Parses a reference string.
    ///
    /// # Example
    ///
    /// ```
    /// use stagerunner::artifact::{ArtifactRef, Selector, Version};
    ///
    /// let r = ArtifactRef::parse("random_forest_export:production").unwrap();
    /// assert_eq!(r.name, "random_forest_export");
    /// assert_eq!(r.selector, Selector::Alias("production".to_string()));
    ///
    /// let r = ArtifactRef::parse("sample.csv:v2").unwrap();
    /// assert_eq!(r.selector, Selector::Version(Version(2)));
    /// ```
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let (name, selector) = match reference.rsplit_once(':') {
            Some((name, selector)) => (name, selector),
            None => (reference, LATEST_ALIAS),
        };

        validate_name(name).map_err(|reason| RunError::InvalidReference {
            reference: reference.to_string(),
            reason,
        })?;

        if selector.is_empty() {
            return Err(RunError::InvalidReference {
                reference: reference.to_string(),
                reason: "empty alias or version after ':'".to_string(),
            });
        }

        let selector = match Version::parse(selector) {
            Some(v) => Selector::Version(v),
            None => {
                validate_alias(selector).map_err(|reason| RunError::InvalidReference {
                    reference: reference.to_string(),
                    reason,
                })?;
                Selector::Alias(selector.to_string())
            }
        };

        Ok(Self {
            name: name.to_string(),
            selector,
        })
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.selector)
    }
}

impl FromStr for ArtifactRef {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        ArtifactRef::parse(s)
    }
}

/// Checks that an artifact name is usable as a store key.
pub fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.trim().is_empty() {
        return Err("artifact name is empty".to_string());
    }
    if name.starts_with('.') {
        return Err("artifact name must not start with '.'".to_string());
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '/' | '\\' | ':') || c.is_whitespace()) {
        return Err(format!("artifact name contains forbidden character {:?}", c));
    }
    Ok(())
}

/// Checks that an alias is usable; aliases must not look like versions.
pub fn validate_alias(alias: &str) -> std::result::Result<(), String> {
    if alias.is_empty() {
        return Err("alias is empty".to_string());
    }
    if Version::parse(alias).is_some() {
        return Err(format!("alias '{}' is indistinguishable from a version", alias));
    }
    if alias.starts_with('.')
        || alias
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':') || c.is_whitespace())
    {
        return Err(format!("alias '{}' contains forbidden characters", alias));
    }
    Ok(())
}

/// Whether the payload is a single file or a directory tree.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    File,
    Directory,
}

/// An immutable published artifact version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Artifact {
    pub name: String,
    pub version: Version,

    /// Free-form type tag (e.g. "raw_data", "model_export")
    #[serde(rename = "type")]
    pub artifact_type: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,

    /// File or directory name of the payload inside the version directory
    pub payload_name: String,
    pub payload_kind: PayloadKind,

    /// Hex sha256 over the payload contents
    pub digest: String,

    pub created_at: DateTime<Utc>,

    /// Location of the payload in the backing store (not serialized)
    #[serde(skip)]
    pub payload_path: PathBuf,
}

impl Artifact {
    /// The concrete reference identifying this exact version.
    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef::version(self.name.clone(), self.version)
    }
}

/// Parameters of a publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub name: String,
    pub artifact_type: String,
    pub description: String,
    pub metadata: BTreeMap<String, Value>,
    pub payload: PathBuf,
}

impl PublishRequest {
    pub fn new(
        name: impl Into<String>,
        artifact_type: impl Into<String>,
        payload: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            artifact_type: artifact_type.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
