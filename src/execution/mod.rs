//! Run Execution Module
//!
//! Drives pipeline runs: step selection is validated up front, each active
//! step is invoked in declared order inside a scoped workspace, and its
//! outputs are committed to the artifact store once it exits cleanly.
//!
//! # Architecture
//!
//! - [`orchestrator`]: Run state machine and reports
//! - [`step`]: The step process contract
//! - [`context`]: Run grouping identifiers
//! - [`workspace`]: Scratch directory with guaranteed cleanup
//! - [`source`]: Git checkouts of step sources

pub mod context;
pub mod orchestrator;
pub mod source;
pub mod step;
pub mod workspace;

pub use context::RunContext;
pub use orchestrator::{
    InvocationRecord, Orchestrator, PlannedInput, PlannedStep, RunPlan, RunReport, RunState,
    StepStatus,
};
pub use source::SourceCheckouts;
pub use step::{interpret_exit, ResolvedInput, StepInvocation, StepOutcome, RECOVERABLE_EXIT_CODE};
pub use workspace::Workspace;
