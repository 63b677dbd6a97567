//! Error Types
//!
//! A single error enum shared by the artifact store, the environment
//! manager and the orchestrator. Validation-class errors are raised before
//! any side effect of a run takes place.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RunError>;

/// Every failure a run can end with.
#[derive(Debug, Error)]
pub enum RunError {
    /// The artifact name, or the requested version of it, does not exist.
    #[error("unknown artifact '{name}'{}", version_suffix(.version))]
    UnknownArtifact {
        name: String,
        version: Option<String>,
    },

    /// The alias is not set on the artifact.
    #[error("alias '{alias}' is not set on artifact '{name}'")]
    UnknownAlias { name: String, alias: String },

    /// The step selector names a step the pipeline does not define.
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    /// An artifact reference or name is malformed.
    #[error("invalid artifact reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// The pipeline definition is inconsistent.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Two publishers claimed the same version identifier.
    #[error("version {version} of artifact '{name}' already exists")]
    DuplicateVersion { name: String, version: String },

    /// The execution environment for a step could not be built.
    #[error("failed to provision environment '{environment}': {reason}")]
    EnvironmentProvision { environment: String, reason: String },

    /// The step's source could not be checked out.
    #[error("failed to check out '{repository}' at '{version}': {reason}")]
    SourceCheckout {
        repository: String,
        version: String,
        reason: String,
    },

    /// The step process exited with a non-zero status.
    #[error("step '{step}' failed with exit code {}", exit_code_label(.exit_code))]
    StepExecution { step: String, exit_code: Option<i32> },

    /// The step exited zero without producing a declared output.
    #[error("step '{step}' exited successfully but did not publish declared output '{artifact}'")]
    PartialPublishViolation { step: String, artifact: String },

    #[error("{context} '{}': {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {what}: {source}")]
    Json {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RunError {
    /// Shorthand for an I/O error with the path that caused it.
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    pub fn json(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            what: what.into(),
            source,
        }
    }

    /// True for errors detected before a run performs any work.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownArtifact { .. }
                | Self::UnknownAlias { .. }
                | Self::UnknownStep(_)
                | Self::InvalidReference { .. }
                | Self::InvalidPipeline(_)
        )
    }
}

fn version_suffix(version: &Option<String>) -> String {
    match version {
        Some(v) => format!(" (version {})", v),
        None => String::new(),
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_artifact_display() {
        let err = RunError::UnknownArtifact {
            name: "sample.csv".to_string(),
            version: None,
        };
        assert_eq!(err.to_string(), "unknown artifact 'sample.csv'");

        let err = RunError::UnknownArtifact {
            name: "sample.csv".to_string(),
            version: Some("v7".to_string()),
        };
        assert!(err.to_string().contains("version v7"));
    }

    #[test]
    fn test_step_execution_display_signal() {
        let err = RunError::StepExecution {
            step: "train".to_string(),
            exit_code: None,
        };
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn test_is_validation() {
        assert!(RunError::UnknownStep("d".to_string()).is_validation());
        assert!(RunError::UnknownAlias {
            name: "a".to_string(),
            alias: "production".to_string()
        }
        .is_validation());
        assert!(!RunError::StepExecution {
            step: "a".to_string(),
            exit_code: Some(1)
        }
        .is_validation());
    }
}
