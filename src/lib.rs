//! StageRunner - Linear Step Orchestrator
//!
//! Runs a fixed, ordered pipeline of steps (download, clean, check, split,
//! train, test, ...). Steps never talk to each other directly: each one
//! reads named, versioned artifacts from a store and publishes new ones,
//! running inside its own inline or isolated environment.
//!
//! # Architecture
//!
//! - [`artifact`]: Versioned artifact store with mutable aliases
//! - [`environment`]: Inline and micromamba-isolated step environments
//! - [`pipeline`]: Pipeline definitions, YAML loading, validation, step selection
//! - [`execution`]: Run orchestrator, step contract and scratch workspace
//! - [`monitoring`]: Run timeline
//! - [`error`]: Shared error type
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stagerunner::{load_pipeline, LocalArtifactStore, Orchestrator, StepSelector};
//! use stagerunner::environment::{EnvironmentManager, MicromambaBackend};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = load_pipeline("pipeline.yaml")?;
//!     let store = Arc::new(LocalArtifactStore::open("artifacts")?);
//!     let environments = EnvironmentManager::new(
//!         Arc::new(MicromambaBackend::default()),
//!         "env_registry.json",
//!     );
//!
//!     let orchestrator = Orchestrator::new(pipeline, store, environments);
//!     orchestrator.run(&StepSelector::All)?;
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod environment;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod pipeline;

// Re-export commonly used types
pub use artifact::{ArtifactRef, ArtifactStore, LocalArtifactStore};
pub use error::{Result, RunError};
pub use execution::{Orchestrator, RunReport};
pub use pipeline::{load_pipeline, Pipeline, StepDefinition, StepSelector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "StageRunner";
