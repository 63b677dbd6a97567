//! Execution Environment Module
//!
//! Provisions per-step execution environments (inline, or isolated via
//! micromamba) and runs step processes inside them.

pub mod conda;
pub mod manager;
pub mod registry;
pub mod spec;

pub use conda::{MicromambaBackend, MAMBA_ROOT_PREFIX, MICROMAMBA_PATH};
pub use manager::{
    EnvironmentBackend, EnvironmentHandle, EnvironmentManager, ExitResult, ProcessSpec,
};
pub use registry::EnvRegistry;
pub use spec::{EnvironmentKind, EnvironmentSpec};
