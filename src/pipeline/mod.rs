//! Pipeline Definition Module
//!
//! Data structures, loading and validation for pipeline definitions.
//!
//! # Structure
//!
//! - [`model`]: Step definitions, parameter schemas, run settings
//! - [`parser`]: YAML loading
//! - [`validator`]: Load-time validation
//! - [`selector`]: Active step selection

pub mod model;
pub mod parser;
pub mod selector;
pub mod validator;

pub use model::{
    OutputSpec, ParamSchema, ParamType, Pipeline, RunSettings, StepDefinition, StepSource,
    STEP_DIR_PLACEHOLDER,
};
pub use parser::{load_pipeline, parse_pipeline, save_pipeline};
pub use selector::{StepSelector, ALL_STEPS};
pub use validator::validate_pipeline;
