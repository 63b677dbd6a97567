//! Pipeline Data Model
//!
//! A pipeline is a fixed, ordered list of step definitions. Position in the
//! list is the only ordering there is: no branching, no dependency graph.
//! Steps depend on each other only through artifact names.
//!
//! # Example YAML Format
//!
//! ```yaml
//! settings:
//!   project: nyc_airbnb
//!   group: development
//!   steps: all
//!
//! steps:
//!   - name: basic_cleaning
//!     path: src/basic_cleaning
//!     entry_point: python {step_dir}/run.py
//!     environment:
//!       kind: local
//!     inputs:
//!       input_artifact: sample.csv:latest
//!     parameters:
//!       min_price: 10
//!       max_price: 350
//!     outputs:
//!       - name: clean_sample.csv
//!         type: clean_sample
//!         description: Data with outliers removed
//!
//!   - name: download
//!     entry_point: python {step_dir}/run.py sample1.csv
//!     source:
//!       path: get_data
//!       version: main
//! ```
//!
//! A step with a `source` runs from a git checkout of
//! `settings.components_repository` (or `source.repository`) at `version`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::EnvironmentSpec;

/// Placeholder in entry points expanded to the step's source directory.
pub const STEP_DIR_PLACEHOLDER: &str = "{step_dir}";

/// Declared type of a step parameter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Float,
    Int,
    Bool,
    /// Artifact reference, supplied through `inputs`
    Artifact,
    /// Filesystem path, or a mapping written to a JSON file
    Path,
}

impl ParamType {
    /// Whether a literal value is acceptable for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Float => value.is_number(),
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Artifact => false,
            ParamType::Path => value.is_string() || value.is_object(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::String => "string",
            ParamType::Float => "float",
            ParamType::Int => "int",
            ParamType::Bool => "bool",
            ParamType::Artifact => "artifact",
            ParamType::Path => "path",
        };
        f.write_str(name)
    }
}

/// One entry of a step's parameter schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParamSchema {
    pub name: String,

    #[serde(rename = "type")]
    pub param_type: ParamType,

    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_required() -> bool {
    true
}

impl ParamSchema {
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, default: Option<Value>) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default,
        }
    }
}

/// An artifact a step promises to publish.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputSpec {
    /// Artifact name
    pub name: String,

    #[serde(rename = "type")]
    pub artifact_type: String,

    #[serde(default)]
    pub description: String,

    /// Aliases moved to the new version in addition to `latest`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, artifact_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifact_type: artifact_type.into(),
            description: String::new(),
            aliases: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }
}

/// Step code kept in a git repository.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepSource {
    /// Repository URL or local path; the pipeline's `components_repository` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Directory of the step inside the checkout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Branch, tag or commit to check out
    #[serde(default = "default_source_version")]
    pub version: String,
}

fn default_source_version() -> String {
    "main".to_string()
}

impl StepSource {
    /// Step in `path` of the components repository, at `main`.
    pub fn component(path: impl Into<PathBuf>) -> Self {
        Self {
            repository: None,
            path: Some(path.into()),
            version: default_source_version(),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// Static description of one pipeline stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepDefinition {
    /// Unique step name
    pub name: String,

    /// Step source directory, relative to the pipeline file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Step source checked out from git; excludes `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StepSource>,

    /// Command run by bash; receives parameters as `--name value`
    pub entry_point: String,

    #[serde(default)]
    pub environment: EnvironmentSpec,

    /// Literal parameters fixed at definition time
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,

    /// Parameter name -> artifact reference (`name:alias_or_version`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputSpec>,

    /// Declared parameters; empty means "accept anything"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_schema: Vec<ParamSchema>,

    /// A failing best-effort step is logged and skipped instead of aborting
    #[serde(default)]
    pub best_effort: bool,
}

impl StepDefinition {
    /// Creates a new inline step.
    ///
    /// # Example
    ///
    /// ```
    /// use stagerunner::pipeline::{OutputSpec, StepDefinition};
    ///
    /// let step = StepDefinition::new("basic_cleaning", "python {step_dir}/run.py")
    ///     .with_path("src/basic_cleaning")
    ///     .with_input("input_artifact", "sample.csv:latest")
    ///     .with_parameter("min_price", 10)
    ///     .with_output(OutputSpec::new("clean_sample.csv", "clean_sample"));
    /// assert_eq!(step.inputs.len(), 1);
    /// ```
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        let name: String = name.into();
        let entry_point: String = entry_point.into();
        Self {
            name: name.trim().to_string(),
            path: None,
            source: None,
            entry_point: entry_point.trim().to_string(),
            environment: EnvironmentSpec::local(),
            parameters: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            parameter_schema: Vec::new(),
            best_effort: false,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_source(mut self, source: StepSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentSpec) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_input(mut self, param: impl Into<String>, reference: impl Into<String>) -> Self {
        self.inputs.insert(param.into(), reference.into());
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_schema(mut self, schema: ParamSchema) -> Self {
        self.parameter_schema.push(schema);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    /// Output declared under an artifact name.
    pub fn output(&self, artifact_name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == artifact_name)
    }
}

/// Run-level settings carried by the pipeline file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Project/namespace identifier propagated to every step
    #[serde(default = "default_project")]
    pub project: String,

    /// Run group; a timestamped group is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Default step selector: `all` or a comma-separated list
    #[serde(default = "default_steps")]
    pub steps: String,

    /// Artifact store root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<PathBuf>,

    /// Micromamba root prefix for isolated environments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_root: Option<PathBuf>,

    /// Where step stdout/stderr are kept; inside the workspace when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Parent directory for scratch workspaces (system temp when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Default git repository for steps declaring a `source`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components_repository: Option<String>,
}

fn default_project() -> String {
    "stagerunner".to_string()
}

fn default_steps() -> String {
    "all".to_string()
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            project: default_project(),
            group: None,
            steps: default_steps(),
            store: None,
            env_root: None,
            log_dir: None,
            workspace_root: None,
            components_repository: None,
        }
    }
}

/// An ordered list of uniquely named steps.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Pipeline {
    #[serde(default)]
    pub settings: RunSettings,

    pub steps: Vec<StepDefinition>,

    /// Directory relative step paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,

    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Pipeline {
    /// Creates a new empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pipeline from steps in their execution order.
    ///
    /// Duplicate names are reported by validation, not here.
    pub fn from_steps(steps: Vec<StepDefinition>) -> Self {
        let mut pipeline = Self {
            steps,
            ..Default::default()
        };
        pipeline.reindex();
        pipeline
    }

    /// Appends a step at the end of the pipeline.
    pub fn add_step(&mut self, step: StepDefinition) -> Result<(), String> {
        if self.index.contains_key(&step.name) {
            return Err(format!("Step '{}' already exists", step.name));
        }
        self.index.insert(step.name.clone(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    /// Rebuilds the name -> position lookup table.
    pub fn reindex(&mut self) {
        self.index = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
    }

    /// Gets a step by name.
    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).and_then(|&i| self.steps.get(i))
    }

    /// Position of a step in the declared order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Absolute source directory of a step, if it declares one.
    pub fn step_dir(&self, step: &StepDefinition) -> Option<PathBuf> {
        step.path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.base_dir.join(p)
            }
        })
    }

    /// Repository a step's source is checked out from.
    ///
    /// Relative local paths are taken against the pipeline directory.
    pub fn source_repository(&self, step: &StepDefinition) -> Option<String> {
        let source = step.source.as_ref()?;
        let repository = source
            .repository
            .as_ref()
            .or(self.settings.components_repository.as_ref())?;

        let local = Path::new(repository);
        if !repository.contains("://") && !repository.contains(':') && local.is_relative() {
            Some(self.base_dir.join(local).to_string_lossy().into_owned())
        } else {
            Some(repository.clone())
        }
    }

    /// Returns the number of steps in the pipeline.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the pipeline has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_builder() {
        let step = StepDefinition::new(" train ", "python run.py")
            .with_parameter("val_size", 0.2)
            .with_input("trainval_artifact", "trainval_data.csv:latest")
            .with_output(OutputSpec::new("random_forest_export", "model_export").with_alias("candidate"))
            .best_effort();

        assert_eq!(step.name, "train");
        assert_eq!(step.parameters.get("val_size"), Some(&json!(0.2)));
        assert!(step.best_effort);
        assert_eq!(step.output("random_forest_export").unwrap().aliases, vec!["candidate"]);
        assert!(step.output("missing").is_none());
    }

    #[test]
    fn test_pipeline_add_step_rejects_duplicates() {
        let mut pipeline = Pipeline::new();
        assert!(pipeline.add_step(StepDefinition::new("a", "true")).is_ok());
        assert!(pipeline.add_step(StepDefinition::new("a", "true")).is_err());
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn test_pipeline_positions_follow_declaration() {
        let pipeline = Pipeline::from_steps(vec![
            StepDefinition::new("download", "true"),
            StepDefinition::new("basic_cleaning", "true"),
            StepDefinition::new("data_check", "true"),
        ]);

        assert_eq!(pipeline.position("download"), Some(0));
        assert_eq!(pipeline.position("data_check"), Some(2));
        assert_eq!(pipeline.step_names(), vec!["download", "basic_cleaning", "data_check"]);
        assert!(pipeline.get_step("nope").is_none());
    }

    #[test]
    fn test_step_dir_resolution() {
        let mut pipeline = Pipeline::from_steps(vec![
            StepDefinition::new("rel", "true").with_path("src/rel"),
            StepDefinition::new("abs", "true").with_path("/opt/steps/abs"),
            StepDefinition::new("none", "true"),
        ]);
        pipeline.base_dir = PathBuf::from("/repo");

        assert_eq!(pipeline.step_dir(&pipeline.steps[0]), Some(PathBuf::from("/repo/src/rel")));
        assert_eq!(pipeline.step_dir(&pipeline.steps[1]), Some(PathBuf::from("/opt/steps/abs")));
        assert_eq!(pipeline.step_dir(&pipeline.steps[2]), None);
    }

    #[test]
    fn test_source_repository_resolution() {
        let mut pipeline = Pipeline::from_steps(vec![
            StepDefinition::new("download", "true").with_source(StepSource::component("get_data")),
            StepDefinition::new("split", "true").with_source(
                StepSource::component("train_val_test_split")
                    .with_repository("https://github.com/acme/components")
                    .with_version("v1.2"),
            ),
            StepDefinition::new("local", "true").with_path("src/local"),
        ]);
        pipeline.base_dir = PathBuf::from("/repo");

        assert_eq!(pipeline.source_repository(&pipeline.steps[0]), None);
        pipeline.settings.components_repository = Some("components".to_string());
        assert_eq!(
            pipeline.source_repository(&pipeline.steps[0]).as_deref(),
            Some("/repo/components")
        );
        assert_eq!(
            pipeline.source_repository(&pipeline.steps[1]).as_deref(),
            Some("https://github.com/acme/components")
        );
        assert_eq!(pipeline.source_repository(&pipeline.steps[2]), None);
        assert_eq!(pipeline.steps[0].source.as_ref().unwrap().version, "main");
    }

    #[test]
    fn test_source_version_defaults_to_main() {
        let step: StepDefinition = serde_yaml::from_str(
            "name: download\nentry_point: python {step_dir}/run.py\nsource:\n  path: get_data\n",
        )
        .unwrap();
        let source = step.source.unwrap();
        assert_eq!(source.version, "main");
        assert_eq!(source.path, Some(PathBuf::from("get_data")));
        assert!(source.repository.is_none());
    }

    #[test]
    fn test_param_type_accepts() {
        assert!(ParamType::Float.accepts(&json!(10)));
        assert!(ParamType::Float.accepts(&json!(0.5)));
        assert!(ParamType::Int.accepts(&json!(42)));
        assert!(!ParamType::Int.accepts(&json!(0.5)));
        assert!(ParamType::Bool.accepts(&json!(true)));
        assert!(!ParamType::String.accepts(&json!(1)));
        assert!(ParamType::Path.accepts(&json!({"n_estimators": 100})));
        assert!(!ParamType::Artifact.accepts(&json!("x:latest")));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = RunSettings::default();
        assert_eq!(settings.project, "stagerunner");
        assert_eq!(settings.steps, "all");
        assert!(settings.group.is_none());
    }
}
