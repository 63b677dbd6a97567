//! Pipeline Parser
//!
//! Loads pipeline definitions from YAML files and validates them before
//! anything can be run.

use std::env;
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{Result, RunError};

use super::model::Pipeline;
use super::validator::validate_pipeline;

/// Loads a pipeline from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Anchors relative step paths at the file's directory
/// 3. Builds the step name index
/// 4. Validates the whole definition
///
/// # Example
///
/// ```rust,no_run
/// use stagerunner::pipeline::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = load_pipeline("pipeline.yaml")?;
///     println!("Loaded {} steps", pipeline.len());
///     Ok(())
/// }
/// ```
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<Pipeline> {
    let path = path.as_ref();
    info!("Loading pipeline from: {}", path.display());

    let yaml_content = fs::read_to_string(path)
        .map_err(|e| RunError::io("failed to read pipeline file", path, e))?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let mut pipeline = parse_pipeline(&yaml_content)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    pipeline.base_dir = if parent.is_absolute() {
        parent.to_path_buf()
    } else {
        let cwd = env::current_dir()
            .map_err(|e| RunError::io("failed to read current directory", ".", e))?;
        cwd.join(parent)
    };

    info!(
        "Parsed {} steps (project '{}')",
        pipeline.steps.len(),
        pipeline.settings.project
    );

    validate_pipeline(&pipeline)?;
    Ok(pipeline)
}

/// Parses pipeline YAML without touching the filesystem or validating.
pub fn parse_pipeline(yaml: &str) -> Result<Pipeline> {
    let mut pipeline: Pipeline = serde_yaml::from_str(yaml)?;
    pipeline.reindex();
    Ok(pipeline)
}

/// Saves a pipeline to a YAML file.
pub fn save_pipeline(pipeline: &Pipeline, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let yaml_content = serde_yaml::to_string(pipeline)?;
    fs::write(path, yaml_content)
        .map_err(|e| RunError::io("failed to write pipeline file", path, e))?;
    info!("Pipeline saved to: {}", path.display());
    Ok(())
}
