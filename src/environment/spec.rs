//! Environment Specifications
//!
//! Declares how a step's execution environment is provisioned.
//!
//! # Example YAML Format
//!
//! ```yaml
//! # run inline, in the orchestrator's own environment
//! environment:
//!   kind: local
//!
//! # build an isolated micromamba environment
//! environment:
//!   kind: conda
//!   runtime: python=3.10
//!   dependencies: [pandas=2.1, scikit-learn, wandb]
//!   channels: [conda-forge]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

/// Prefix for environment names derived from a signature.
const ENV_NAME_PREFIX: &str = "stagerunner-";

/// Number of signature hex characters used in derived names.
const ENV_NAME_HASH_LEN: usize = 12;

/// Signature shared by every inline environment.
pub const LOCAL_SIGNATURE: &str = "local";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    /// Run in the orchestrator's own environment
    #[default]
    Local,
    /// Run inside an isolated micromamba environment
    Conda,
}

/// How to provision a step's execution environment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvironmentSpec {
    #[serde(default)]
    pub kind: EnvironmentKind,

    /// Explicit environment name (derived from the signature when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Pinned runtime, e.g. `python=3.10`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
}

impl EnvironmentSpec {
    /// Inline environment.
    pub fn local() -> Self {
        Self::default()
    }

    /// Isolated environment with a pinned runtime.
    pub fn conda(runtime: impl Into<String>) -> Self {
        Self {
            kind: EnvironmentKind::Conda,
            runtime: Some(runtime.into()),
            ..Default::default()
        }
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_isolated(&self) -> bool {
        self.kind == EnvironmentKind::Conda
    }

    /// Stable hash of everything that determines the built environment.
    ///
    /// Dependency order and duplicates do not affect the signature; the
    /// explicit name does not either. Channels keep their declared order,
    /// which is the solver's priority.
    pub fn signature(&self) -> String {
        if !self.is_isolated() {
            return LOCAL_SIGNATURE.to_string();
        }

        let mut dependencies: Vec<&str> = self.dependencies.iter().map(|d| d.trim()).collect();
        dependencies.sort_unstable();
        dependencies.dedup();

        let canonical = json!({
            "runtime": self.runtime.as_deref().map(str::trim),
            "dependencies": dependencies,
            "channels": self.channels,
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Name of the environment this spec provisions.
    pub fn env_name(&self) -> String {
        if !self.is_isolated() {
            return LOCAL_SIGNATURE.to_string();
        }
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => {
                let signature = self.signature();
                format!("{}{}", ENV_NAME_PREFIX, &signature[..ENV_NAME_HASH_LEN])
            }
        }
    }

    /// Package list handed to the environment builder: runtime first.
    pub fn packages(&self) -> Vec<String> {
        self.runtime
            .iter()
            .chain(self.dependencies.iter())
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_signature() {
        let spec = EnvironmentSpec::local();
        assert!(!spec.is_isolated());
        assert_eq!(spec.signature(), LOCAL_SIGNATURE);
        assert_eq!(spec.env_name(), "local");
    }

    #[test]
    fn test_signature_ignores_dependency_order() {
        let a = EnvironmentSpec::conda("python=3.10")
            .with_dependency("pandas")
            .with_dependency("scikit-learn");
        let b = EnvironmentSpec::conda("python=3.10")
            .with_dependency("scikit-learn")
            .with_dependency("pandas")
            .with_dependency("pandas");

        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.env_name(), b.env_name());
    }

    #[test]
    fn test_signature_depends_on_channel_priority() {
        let a = EnvironmentSpec::conda("python=3.10")
            .with_channel("conda-forge")
            .with_channel("defaults");
        let b = EnvironmentSpec::conda("python=3.10")
            .with_channel("defaults")
            .with_channel("conda-forge");

        assert_ne!(a.signature(), b.signature());
        assert_eq!(a.channels, vec!["conda-forge", "defaults"]);
    }

    #[test]
    fn test_signature_changes_with_runtime() {
        let a = EnvironmentSpec::conda("python=3.10");
        let b = EnvironmentSpec::conda("python=3.11");
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_explicit_name_does_not_change_signature() {
        let a = EnvironmentSpec::conda("python=3.10");
        let b = EnvironmentSpec::conda("python=3.10").with_name("cleaning");
        assert_eq!(a.signature(), b.signature());
        assert_eq!(b.env_name(), "cleaning");
        assert!(a.env_name().starts_with("stagerunner-"));
        assert_eq!(a.env_name().len(), "stagerunner-".len() + 12);
    }

    #[test]
    fn test_packages_runtime_first() {
        let spec = EnvironmentSpec::conda("python=3.10").with_dependency("pandas");
        assert_eq!(spec.packages(), vec!["python=3.10", "pandas"]);
    }

    #[test]
    fn test_deserialize_yaml() {
        let yaml = "kind: conda\nruntime: python=3.10\ndependencies: [pandas]\n";
        let spec: EnvironmentSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.is_isolated());
        assert_eq!(spec.dependencies, vec!["pandas"]);

        let spec: EnvironmentSpec = serde_yaml::from_str("kind: local").unwrap();
        assert!(!spec.is_isolated());
    }
}
