//! Step Invocation
//!
//! Implements the contract between the orchestrator and a step process:
//! - Parameter merging (schema defaults, literals, resolved inputs)
//! - Script generation with `{step_dir}` expansion
//! - Run context and outbox export through environment variables
//! - Exit code interpretation
//! - Collection of declared outputs from the outbox
//!
//! A step publishes an output by writing it to
//! `$STAGERUNNER_OUTPUT_DIR/<artifact name>`, optionally next to an
//! `<artifact name>.metadata.json` object. Nothing in the outbox reaches
//! the store until the process has exited zero and every declared output
//! is present.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde_json::{json, Value};

use crate::artifact::{Artifact, PublishRequest};
use crate::environment::ProcessSpec;
use crate::error::{Result, RunError};
use crate::pipeline::{StepDefinition, STEP_DIR_PLACEHOLDER};

use super::context::RunContext;

/// Exit status a step uses to report a temporary, skippable failure
/// (`EX_TEMPFAIL`).
pub const RECOVERABLE_EXIT_CODE: i32 = 75;

pub const ENV_PARAMS: &str = "STAGERUNNER_PARAMS";
pub const ENV_OUTPUT_DIR: &str = "STAGERUNNER_OUTPUT_DIR";
pub const ENV_STORE: &str = "STAGERUNNER_STORE";

const SCRIPT_FILE: &str = "step.sh";
const PARAMS_FILE: &str = "params.json";
const OUTBOX_DIR: &str = "outputs";
const METADATA_SUFFIX: &str = ".metadata.json";

/// An input artifact pinned to a version and fetched into the workspace.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub param: String,
    pub artifact: Artifact,
    pub path: PathBuf,
}

/// How a finished step process should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    /// Exited with [`RECOVERABLE_EXIT_CODE`]
    Recoverable,
    /// Any other non-zero exit, or killed by a signal (`None`)
    Failed(Option<i32>),
}

/// Maps an exit code to a step outcome.
pub fn interpret_exit(code: Option<i32>) -> StepOutcome {
    match code {
        Some(0) => StepOutcome::Succeeded,
        Some(RECOVERABLE_EXIT_CODE) => StepOutcome::Recoverable,
        other => StepOutcome::Failed(other),
    }
}

/// One invocation of a step inside a run's workspace.
#[derive(Debug)]
pub struct StepInvocation<'a> {
    step: &'a StepDefinition,
    step_dir: Option<PathBuf>,
    dir: PathBuf,
    log_dir: PathBuf,
    inputs: Vec<ResolvedInput>,
}

impl<'a> StepInvocation<'a> {
    /// Creates an invocation using `dir` for its private files.
    pub fn new(step: &'a StepDefinition, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            step,
            step_dir: None,
            log_dir: dir.clone(),
            dir,
            inputs: Vec::new(),
        }
    }

    pub fn with_step_dir(mut self, step_dir: Option<PathBuf>) -> Self {
        self.step_dir = step_dir;
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_input(mut self, input: ResolvedInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn step(&self) -> &StepDefinition {
        self.step
    }

    pub fn inputs(&self) -> &[ResolvedInput] {
        &self.inputs
    }

    /// Directory the step writes its outputs to.
    pub fn outbox(&self) -> PathBuf {
        self.dir.join(OUTBOX_DIR)
    }

    /// The flat parameter mapping handed to the step.
    ///
    /// Literals override schema defaults; inputs appear as pinned
    /// `name:vN` references.
    pub fn parameters(&self) -> BTreeMap<String, Value> {
        let mut params: BTreeMap<String, Value> = self
            .step
            .parameter_schema
            .iter()
            .filter_map(|p| p.default.clone().map(|d| (p.name.clone(), d)))
            .collect();

        params.extend(
            self.step
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        for input in &self.inputs {
            params.insert(
                input.param.clone(),
                Value::String(input.artifact.reference().to_string()),
            );
        }
        params
    }

    /// Command line arguments as `--name value` pairs.
    ///
    /// Inputs are passed as the local path of the fetched payload. Mapping
    /// values are written to `<name>.json` in the invocation directory and
    /// passed by path.
    pub fn command_args(&self) -> Result<Vec<String>> {
        let mut args = Vec::new();

        for (name, value) in self.parameters() {
            let rendered = match self.inputs.iter().find(|i| i.param == name) {
                Some(input) => input.path.display().to_string(),
                None => match value {
                    Value::Null => {
                        debug!("Skipping null parameter '{}' of step '{}'", name, self.step.name);
                        continue;
                    }
                    Value::String(s) => s,
                    Value::Object(_) => self.write_json_param(&name, &value)?.display().to_string(),
                    other => other.to_string(),
                },
            };
            args.push(format!("--{}", name));
            args.push(rendered);
        }
        Ok(args)
    }

    fn write_json_param(&self, name: &str, value: &Value) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}.json", name));
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| RunError::json(format!("parameter '{}'", name), e))?;
        fs::write(&path, content)
            .map_err(|e| RunError::io("failed to write parameter file", &path, e))?;
        Ok(path)
    }

    /// Entry point with `{step_dir}` expanded to the quoted source directory.
    pub fn command_text(&self) -> String {
        match &self.step_dir {
            Some(dir) => self
                .step
                .entry_point
                .replace(STEP_DIR_PLACEHOLDER, &shell_quote(&dir.display().to_string())),
            None => self.step.entry_point.clone(),
        }
    }

    /// Writes the bash script wrapping the entry point.
    pub fn write_script(&self) -> Result<PathBuf> {
        let script_path = self.dir.join(SCRIPT_FILE);
        let io_err = |e: std::io::Error| RunError::io("failed to write step script", &script_path, e);

        let mut file = File::create(&script_path).map_err(io_err)?;
        writeln!(file, "#!/bin/bash").map_err(io_err)?;
        writeln!(file, "set -e").map_err(io_err)?;
        writeln!(file, "{} \"$@\"", self.command_text()).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))
                .map_err(io_err)?;
        }

        Ok(script_path)
    }

    /// Writes `params.json` with the flat mapping and the fetched inputs.
    pub fn write_params(&self) -> Result<PathBuf> {
        let inputs: BTreeMap<&str, Value> = self
            .inputs
            .iter()
            .map(|i| {
                (
                    i.param.as_str(),
                    json!({
                        "reference": i.artifact.reference().to_string(),
                        "type": i.artifact.artifact_type,
                        "path": i.path,
                    }),
                )
            })
            .collect();

        let document = json!({
            "step": self.step.name,
            "parameters": self.parameters(),
            "inputs": inputs,
        });

        let path = self.dir.join(PARAMS_FILE);
        let content = serde_json::to_string_pretty(&document)
            .map_err(|e| RunError::json("step parameters", e))?;
        fs::write(&path, content).map_err(|e| RunError::io("failed to write params file", &path, e))?;
        Ok(path)
    }

    /// Prepares every file the step needs and describes the process to run.
    pub fn prepare(&self, ctx: &RunContext, store: Option<&Path>) -> Result<ProcessSpec> {
        let outbox = self.outbox();
        fs::create_dir_all(&outbox)
            .map_err(|e| RunError::io("failed to create step outbox", &outbox, e))?;

        let script = self.write_script()?;
        let params = self.write_params()?;
        let args = self.command_args()?;

        let mut env = ctx.step_env(&self.step.name);
        env.push((ENV_PARAMS.to_string(), params.display().to_string()));
        env.push((ENV_OUTPUT_DIR.to_string(), outbox.display().to_string()));
        if let Some(store) = store {
            env.push((ENV_STORE.to_string(), store.display().to_string()));
        }

        debug!(
            "Prepared step '{}': {} {}",
            self.step.name,
            script.display(),
            args.join(" ")
        );

        Ok(ProcessSpec {
            script,
            args,
            env,
            working_dir: self.dir.clone(),
            stdout_path: self.log_dir.join(format!("{}.stdout", self.step.name)),
            stderr_path: self.log_dir.join(format!("{}.stderr", self.step.name)),
        })
    }

    /// Turns the outbox into publish requests for every declared output.
    ///
    /// Fails with `PartialPublishViolation` on the first missing output, in
    /// which case nothing may be published.
    pub fn collect_outputs(&self) -> Result<Vec<PublishRequest>> {
        let outbox = self.outbox();
        let mut requests = Vec::with_capacity(self.step.outputs.len());

        for output in &self.step.outputs {
            let payload = outbox.join(&output.name);
            if !payload.exists() {
                return Err(RunError::PartialPublishViolation {
                    step: self.step.name.clone(),
                    artifact: output.name.clone(),
                });
            }

            let mut request = PublishRequest::new(&output.name, &output.artifact_type, payload)
                .with_description(&output.description);
            request.metadata = output.metadata.clone();
            request.metadata.extend(read_metadata(&outbox, &output.name)?);
            request
                .metadata
                .insert("producer_step".to_string(), json!(self.step.name));

            requests.push(request);
        }
        Ok(requests)
    }
}

/// Reads the optional metadata object a step left next to an output.
fn read_metadata(outbox: &Path, artifact: &str) -> Result<BTreeMap<String, Value>> {
    let path = outbox.join(format!("{}{}", artifact, METADATA_SUFFIX));
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = fs::read_to_string(&path)
        .map_err(|e| RunError::io("failed to read output metadata", &path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| RunError::json(format!("metadata of output '{}'", artifact), e))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
