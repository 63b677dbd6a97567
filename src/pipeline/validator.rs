//! Pipeline Validation
//!
//! Load-time checks that make every later lookup total:
//! - Step field validation
//! - Unique step names
//! - Artifact reference and output name syntax
//! - Parameter schema conformance

use std::collections::{BTreeSet, HashSet};
use std::path::Component;

use log::{debug, info, warn};

use crate::artifact::model::{validate_alias, validate_name, ArtifactRef};
use crate::error::{Result, RunError};

use super::model::{ParamType, Pipeline, StepDefinition, STEP_DIR_PLACEHOLDER};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyPipeline,
    EmptyStepName,
    DuplicateStepName(String),
    EmptyEntryPoint(String),
    MissingStepDir(String),
    SourceConflict(String),
    InvalidSource { step: String, reason: String },
    MissingRepository(String),
    InvalidInput { step: String, param: String, reason: String },
    InvalidOutput { step: String, output: String, reason: String },
    DuplicateOutput { step: String, output: String },
    ParameterConflict { step: String, param: String },
    UnknownParameter { step: String, param: String },
    MissingParameter { step: String, param: String },
    TypeMismatch { step: String, param: String, expected: ParamType },
    EmptyEnvironment(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPipeline => write!(f, "Pipeline has no steps"),
            Self::EmptyStepName => write!(f, "Step has empty or whitespace-only name"),
            Self::DuplicateStepName(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::EmptyEntryPoint(step) => write!(f, "Step '{}' has no entry point", step),
            Self::MissingStepDir(step) => write!(
                f,
                "Step '{}': entry point uses {} but neither path nor source is set",
                step, STEP_DIR_PLACEHOLDER
            ),
            Self::SourceConflict(step) => {
                write!(f, "Step '{}' sets both path and source", step)
            }
            Self::InvalidSource { step, reason } => {
                write!(f, "Step '{}': source is invalid: {}", step, reason)
            }
            Self::MissingRepository(step) => write!(
                f,
                "Step '{}': source has no repository and settings.components_repository is not set",
                step
            ),
            Self::InvalidInput { step, param, reason } => {
                write!(f, "Step '{}': input '{}' is invalid: {}", step, param, reason)
            }
            Self::InvalidOutput { step, output, reason } => {
                write!(f, "Step '{}': output '{}' is invalid: {}", step, output, reason)
            }
            Self::DuplicateOutput { step, output } => {
                write!(f, "Step '{}' declares output '{}' twice", step, output)
            }
            Self::ParameterConflict { step, param } => write!(
                f,
                "Step '{}': '{}' is both a literal parameter and an input",
                step, param
            ),
            Self::UnknownParameter { step, param } => {
                write!(f, "Step '{}': parameter '{}' is not in its schema", step, param)
            }
            Self::MissingParameter { step, param } => {
                write!(f, "Step '{}': required parameter '{}' is not supplied", step, param)
            }
            Self::TypeMismatch { step, param, expected } => {
                write!(f, "Step '{}': parameter '{}' must be of type {}", step, param, expected)
            }
            Self::EmptyEnvironment(step) => write!(
                f,
                "Step '{}': isolated environment declares neither runtime nor dependencies",
                step
            ),
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &StepDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName);
        return errors; // Can't validate further without a name
    }
    let name = step.name.clone();

    if step.entry_point.trim().is_empty() {
        errors.push(ValidationError::EmptyEntryPoint(name.clone()));
    }

    if step.entry_point.contains(STEP_DIR_PLACEHOLDER) && step.path.is_none() && step.source.is_none()
    {
        errors.push(ValidationError::MissingStepDir(name.clone()));
    }

    if let Some(source) = &step.source {
        if step.path.is_some() {
            errors.push(ValidationError::SourceConflict(name.clone()));
        }
        if source.version.trim().is_empty() {
            errors.push(ValidationError::InvalidSource {
                step: name.clone(),
                reason: "version is empty".to_string(),
            });
        }
        let escapes = source.path.as_ref().map_or(false, |p| {
            p.is_absolute() || p.components().any(|c| matches!(c, Component::ParentDir))
        });
        if escapes {
            errors.push(ValidationError::InvalidSource {
                step: name.clone(),
                reason: "path must stay inside the repository".to_string(),
            });
        }
    }

    if step.environment.is_isolated() && step.environment.packages().is_empty() {
        errors.push(ValidationError::EmptyEnvironment(name.clone()));
    }

    for (param, reference) in &step.inputs {
        if let Err(e) = ArtifactRef::parse(reference) {
            errors.push(ValidationError::InvalidInput {
                step: name.clone(),
                param: param.clone(),
                reason: e.to_string(),
            });
        }
        if step.parameters.contains_key(param) {
            errors.push(ValidationError::ParameterConflict {
                step: name.clone(),
                param: param.clone(),
            });
        }
    }

    let mut seen_outputs = HashSet::new();
    for output in &step.outputs {
        if let Err(reason) = validate_name(&output.name) {
            errors.push(ValidationError::InvalidOutput {
                step: name.clone(),
                output: output.name.clone(),
                reason,
            });
        }
        for alias in &output.aliases {
            if let Err(reason) = validate_alias(alias) {
                errors.push(ValidationError::InvalidOutput {
                    step: name.clone(),
                    output: output.name.clone(),
                    reason,
                });
            }
        }
        if !seen_outputs.insert(output.name.as_str()) {
            errors.push(ValidationError::DuplicateOutput {
                step: name.clone(),
                output: output.name.clone(),
            });
        }
    }

    errors.extend(validate_schema(step));

    if step.outputs.is_empty() {
        debug!("Step '{}' declares no outputs", step.name);
    }

    errors
}

/// Checks supplied parameters against the declared schema.
fn validate_schema(step: &StepDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if step.parameter_schema.is_empty() {
        return errors;
    }

    let declared: BTreeSet<&str> = step
        .parameter_schema
        .iter()
        .map(|p| p.name.as_str())
        .collect();

    for param in step.parameters.keys().chain(step.inputs.keys()) {
        if !declared.contains(param.as_str()) {
            errors.push(ValidationError::UnknownParameter {
                step: step.name.clone(),
                param: param.clone(),
            });
        }
    }

    for schema in &step.parameter_schema {
        let literal = step.parameters.get(&schema.name);
        let input = step.inputs.get(&schema.name);

        match (schema.param_type, literal, input) {
            (ParamType::Artifact, Some(_), _) => errors.push(ValidationError::TypeMismatch {
                step: step.name.clone(),
                param: schema.name.clone(),
                expected: ParamType::Artifact,
            }),
            (expected, _, Some(_)) if expected != ParamType::Artifact => {
                errors.push(ValidationError::TypeMismatch {
                    step: step.name.clone(),
                    param: schema.name.clone(),
                    expected,
                })
            }
            (expected, Some(value), None) if !expected.accepts(value) => {
                errors.push(ValidationError::TypeMismatch {
                    step: step.name.clone(),
                    param: schema.name.clone(),
                    expected,
                })
            }
            (_, None, None) if schema.required && schema.default.is_none() => {
                errors.push(ValidationError::MissingParameter {
                    step: step.name.clone(),
                    param: schema.name.clone(),
                })
            }
            _ => {}
        }
    }

    errors
}

/// Validates the entire pipeline.
///
/// Performs the following checks:
/// 1. Pipeline is not empty
/// 2. No duplicate step names
/// 3. All steps have valid fields, references and outputs
/// 4. Parameters conform to each step's schema
///
/// All problems are reported together.
pub fn validate_pipeline(pipeline: &Pipeline) -> Result<()> {
    let errors = collect_errors(pipeline);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(RunError::InvalidPipeline(messages.join("\n")));
    }

    let mut producers: HashSet<&str> = HashSet::new();
    for step in &pipeline.steps {
        for output in &step.outputs {
            if !producers.insert(output.name.as_str()) {
                // Allowed: the later publish becomes a new version
                warn!(
                    "Artifact '{}' is produced by more than one step; the last one run becomes latest",
                    output.name
                );
            }
        }
    }

    info!("Pipeline validated: {} steps", pipeline.steps.len());
    Ok(())
}

/// All validation errors, in declaration order.
pub fn collect_errors(pipeline: &Pipeline) -> Vec<ValidationError> {
    if pipeline.steps.is_empty() {
        return vec![ValidationError::EmptyPipeline];
    }

    let mut errors = Vec::new();
    let mut seen_names: HashSet<&str> = HashSet::new();

    for step in &pipeline.steps {
        if !step.name.trim().is_empty() && !seen_names.insert(step.name.as_str()) {
            errors.push(ValidationError::DuplicateStepName(step.name.clone()));
        }
        errors.extend(validate_step(step));
        if step.source.is_some() && pipeline.source_repository(step).is_none() {
            errors.push(ValidationError::MissingRepository(step.name.clone()));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentSpec;
    use crate::pipeline::model::{OutputSpec, ParamSchema, StepSource};
    use serde_json::json;

    fn cleaning_step() -> StepDefinition {
        StepDefinition::new("basic_cleaning", "python {step_dir}/run.py")
            .with_path("src/basic_cleaning")
            .with_input("input_artifact", "sample.csv:latest")
            .with_parameter("min_price", 10)
            .with_parameter("max_price", 350)
            .with_output(OutputSpec::new("clean_sample.csv", "clean_sample"))
    }

    #[test]
    fn test_valid_pipeline() {
        let pipeline = Pipeline::from_steps(vec![
            StepDefinition::new("download", "echo download")
                .with_output(OutputSpec::new("sample.csv", "raw_data")),
            cleaning_step(),
        ]);
        assert!(validate_pipeline(&pipeline).is_ok());
    }

    #[test]
    fn test_empty_pipeline() {
        let pipeline = Pipeline::new();
        assert_eq!(collect_errors(&pipeline), vec![ValidationError::EmptyPipeline]);
        assert!(validate_pipeline(&pipeline).is_err());
    }

    #[test]
    fn test_duplicate_names() {
        let pipeline = Pipeline::from_steps(vec![
            StepDefinition::new("same", "echo 1"),
            StepDefinition::new("same", "echo 2"),
        ]);
        let errors = collect_errors(&pipeline);
        assert!(errors.contains(&ValidationError::DuplicateStepName("same".to_string())));
    }

    #[test]
    fn test_empty_entry_point_and_name() {
        let errors = validate_step(&StepDefinition::new("x", ""));
        assert!(errors.contains(&ValidationError::EmptyEntryPoint("x".to_string())));

        let errors = validate_step(&StepDefinition::new("", "echo"));
        assert_eq!(errors, vec![ValidationError::EmptyStepName]);
    }

    #[test]
    fn test_step_dir_placeholder_requires_path() {
        let step = StepDefinition::new("x", "python {step_dir}/run.py");
        let errors = validate_step(&step);
        assert!(errors.contains(&ValidationError::MissingStepDir("x".to_string())));
    }

    #[test]
    fn test_step_source_satisfies_step_dir() {
        let mut pipeline = Pipeline::from_steps(vec![StepDefinition::new(
            "download",
            "python {step_dir}/run.py",
        )
        .with_source(StepSource::component("get_data"))]);

        assert_eq!(
            collect_errors(&pipeline),
            vec![ValidationError::MissingRepository("download".to_string())]
        );

        pipeline.settings.components_repository =
            Some("https://github.com/acme/components".to_string());
        assert!(collect_errors(&pipeline).is_empty());
    }

    #[test]
    fn test_step_source_checks() {
        let step = StepDefinition::new("x", "echo")
            .with_path("src/x")
            .with_source(StepSource::component("../outside").with_version(" "));
        let errors = validate_step(&step);

        assert!(errors.contains(&ValidationError::SourceConflict("x".to_string())));
        assert_eq!(
            errors
                .iter()
                .filter(|e| matches!(e, ValidationError::InvalidSource { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_invalid_input_reference() {
        let step = StepDefinition::new("x", "echo").with_input("csv", "bad/name:latest");
        let errors = validate_step(&step);
        assert!(matches!(errors[0], ValidationError::InvalidInput { .. }));
    }

    #[test]
    fn test_output_checks() {
        let step = StepDefinition::new("x", "echo")
            .with_output(OutputSpec::new("a.csv", "t"))
            .with_output(OutputSpec::new("a.csv", "t"))
            .with_output(OutputSpec::new("b.csv", "t").with_alias("v2"));
        let errors = validate_step(&step);

        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateOutput { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidOutput { .. })));
    }

    #[test]
    fn test_parameter_conflict() {
        let step = StepDefinition::new("x", "echo")
            .with_parameter("csv", "literal")
            .with_input("csv", "a.csv:latest");
        let errors = validate_step(&step);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::ParameterConflict { .. })));
    }

    #[test]
    fn test_schema_conformance() {
        let step = cleaning_step()
            .with_schema(ParamSchema::required("input_artifact", ParamType::Artifact))
            .with_schema(ParamSchema::required("min_price", ParamType::Float))
            .with_schema(ParamSchema::required("max_price", ParamType::Float));
        assert!(validate_schema(&step).is_empty());
    }

    #[test]
    fn test_schema_type_mismatch_and_missing() {
        let step = StepDefinition::new("split", "echo")
            .with_parameter("test_size", "big")
            .with_schema(ParamSchema::required("test_size", ParamType::Float))
            .with_schema(ParamSchema::required("random_seed", ParamType::Int))
            .with_schema(ParamSchema::optional("stratify_by", ParamType::String, Some(json!("none"))));

        let errors = validate_schema(&step);
        assert!(errors.contains(&ValidationError::TypeMismatch {
            step: "split".to_string(),
            param: "test_size".to_string(),
            expected: ParamType::Float,
        }));
        assert!(errors.contains(&ValidationError::MissingParameter {
            step: "split".to_string(),
            param: "random_seed".to_string(),
        }));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_schema_unknown_parameter() {
        let step = StepDefinition::new("x", "echo")
            .with_parameter("surprise", 1)
            .with_schema(ParamSchema::optional("known", ParamType::Int, None));
        let errors = validate_schema(&step);
        assert!(matches!(errors[0], ValidationError::UnknownParameter { .. }));
    }

    #[test]
    fn test_artifact_param_must_be_input() {
        let step = StepDefinition::new("x", "echo")
            .with_parameter("model", "random_forest_export:production")
            .with_schema(ParamSchema::required("model", ParamType::Artifact));
        let errors = validate_schema(&step);
        assert!(matches!(errors[0], ValidationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_isolated_environment_needs_packages() {
        let mut env = EnvironmentSpec::conda("python=3.10");
        env.runtime = None;
        let step = StepDefinition::new("x", "echo").with_environment(env);
        let errors = validate_step(&step);
        assert!(errors.contains(&ValidationError::EmptyEnvironment("x".to_string())));
    }

    #[test]
    fn test_validation_error_display() {
        assert_eq!(ValidationError::EmptyPipeline.to_string(), "Pipeline has no steps");
        assert!(ValidationError::DuplicateStepName("a".to_string())
            .to_string()
            .contains("'a'"));
    }
}
