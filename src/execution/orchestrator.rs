//! Run Orchestrator
//!
//! Drives one run through its linear state machine:
//!
//! ```text
//! Initializing -> { StepPending -> StepRunning -> StepCompleted }* -> Finalizing -> Succeeded | Failed
//! ```
//!
//! Steps run strictly one after another in declared order. Before any side
//! effect, the pipeline and its active subset are validated: unknown step names and
//! unresolvable input references abort the run with nothing executed and
//! nothing published. An input naming an artifact that an earlier active
//! step will publish under the requested alias is resolved when its step
//! starts instead.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::artifact::{Artifact, ArtifactRef, ArtifactStore, Selector, LATEST_ALIAS};
use crate::environment::EnvironmentManager;
use crate::error::{Result, RunError};
use crate::monitoring::{EventType, RunTimeline};
use crate::pipeline::{
    validate_pipeline, Pipeline, RunSettings, StepDefinition, StepSelector, StepSource,
};

use super::context::RunContext;
use super::source::SourceCheckouts;
use super::step::{interpret_exit, ResolvedInput, StepInvocation, StepOutcome};
use super::workspace::Workspace;

/// Workspace subdirectory holding step source checkouts.
const SOURCES_DIR: &str = "sources";

/// Orchestrator state.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    StepPending,
    StepRunning,
    StepCompleted,
    Finalizing,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Initializing => "initializing",
            RunState::StepPending => "step pending",
            RunState::StepRunning => "step running",
            RunState::StepCompleted => "step completed",
            RunState::Finalizing => "finalizing",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a step invocation ended.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Dry run: validated, not executed
    Planned,
    Completed,
    Skipped,
    Failed,
}

/// What happened to one active step.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InvocationRecord {
    pub step: String,
    pub status: StepStatus,
    pub environment: String,
    /// Parameter name -> pinned input reference
    pub inputs: BTreeMap<String, String>,
    /// Published `name:vN` references
    pub published: Vec<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl InvocationRecord {
    fn new(step: &StepDefinition, status: StepStatus) -> Self {
        Self {
            step: step.name.clone(),
            status,
            environment: step.environment.env_name(),
            inputs: BTreeMap::new(),
            published: Vec::new(),
            exit_code: None,
            duration_ms: 0,
        }
    }
}

/// An input as validated before the run starts.
#[derive(Debug, Clone)]
pub struct PlannedInput {
    pub param: String,
    pub reference: ArtifactRef,
    /// Resolved up front; `None` when an earlier active step produces it
    pub resolved: Option<Artifact>,
    pub producer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlannedStep<'a> {
    pub position: usize,
    pub step: &'a StepDefinition,
    pub inputs: Vec<PlannedInput>,
}

/// The validated active steps of a run, in execution order.
#[derive(Debug, Clone)]
pub struct RunPlan<'a> {
    pub steps: Vec<PlannedStep<'a>>,
}

impl RunPlan<'_> {
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step.name.as_str()).collect()
    }
}

/// Result of a run, successful or not.
#[derive(Debug)]
pub struct RunReport {
    pub context: RunContext,
    pub state: RunState,
    pub steps: Vec<InvocationRecord>,
    pub timeline: RunTimeline,
    pub error: Option<RunError>,
    /// Set when the run reaches a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunReport {
    fn new(context: RunContext) -> Self {
        Self {
            context,
            state: RunState::Initializing,
            steps: Vec::new(),
            timeline: RunTimeline::new(),
            error: None,
            completed_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn record(&self, step: &str) -> Option<&InvocationRecord> {
        self.steps.iter().find(|r| r.step == step)
    }

    /// Every `name:vN` published during the run, in order.
    pub fn published(&self) -> Vec<&str> {
        self.steps
            .iter()
            .flat_map(|r| r.published.iter().map(String::as_str))
            .collect()
    }

    /// Converts a failed report into its error.
    pub fn into_result(mut self) -> Result<RunReport> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!("Run {}: {} -> {}", self.context.run_id, self.state, next);
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }
}

/// Runs pipelines against an artifact store and environment manager.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use stagerunner::artifact::LocalArtifactStore;
/// use stagerunner::environment::{EnvironmentManager, MicromambaBackend};
/// use stagerunner::execution::Orchestrator;
/// use stagerunner::pipeline::{load_pipeline, StepSelector};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = load_pipeline("pipeline.yaml")?;
///     let store = Arc::new(LocalArtifactStore::open("artifacts")?);
///     let environments = EnvironmentManager::new(
///         Arc::new(MicromambaBackend::default()),
///         "env_registry.json",
///     );
///
///     let orchestrator = Orchestrator::new(pipeline, store, environments);
///     let report = orchestrator.run(&StepSelector::parse("basic_cleaning,data_check")?)?;
///     println!("published: {:?}", report.published());
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    pipeline: Pipeline,
    store: Arc<dyn ArtifactStore>,
    environments: EnvironmentManager,
    dry_run: bool,
}

impl Orchestrator {
    pub fn new(
        mut pipeline: Pipeline,
        store: Arc<dyn ArtifactStore>,
        environments: EnvironmentManager,
    ) -> Self {
        pipeline.reindex();
        Self {
            pipeline,
            store,
            environments,
            dry_run: false,
        }
    }

    /// Enables or disables dry run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn set_project(&mut self, project: impl Into<String>) {
        self.pipeline.settings.project = project.into();
    }

    pub fn set_group(&mut self, group: impl Into<String>) {
        self.pipeline.settings.group = Some(group.into());
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn settings(&self) -> &RunSettings {
        &self.pipeline.settings
    }

    pub fn environments(&self) -> &EnvironmentManager {
        &self.environments
    }

    /// Validates the pipeline, the active subset and its input references.
    ///
    /// Performs no side effects.
    pub fn plan(&self, selector: &StepSelector) -> Result<RunPlan<'_>> {
        validate_pipeline(&self.pipeline)?;
        let active = selector.active_steps(&self.pipeline)?;
        let mut steps = Vec::with_capacity(active.len());

        for (i, &step) in active.iter().enumerate() {
            let mut inputs = Vec::with_capacity(step.inputs.len());

            for (param, raw) in &step.inputs {
                let reference = ArtifactRef::parse(raw)?;
                let producer = producer_in_run(&active[..i], &reference);

                let resolved = match producer {
                    Some(ref p) => {
                        debug!(
                            "Input '{}' of step '{}' will be produced by '{}'",
                            reference, step.name, p
                        );
                        None
                    }
                    None => Some(self.store.resolve(&reference)?),
                };

                inputs.push(PlannedInput {
                    param: param.clone(),
                    reference,
                    resolved,
                    producer,
                });
            }

            steps.push(PlannedStep {
                position: i,
                step,
                inputs,
            });
        }

        Ok(RunPlan { steps })
    }

    /// Runs the selected steps, failing with the first error.
    pub fn run(&self, selector: &StepSelector) -> Result<RunReport> {
        self.execute(selector).into_result()
    }

    /// Runs the selected steps and reports the outcome, including failures.
    pub fn execute(&self, selector: &StepSelector) -> RunReport {
        let settings = &self.pipeline.settings;
        let ctx = RunContext::new(&settings.project, settings.group.clone());
        let mut report = RunReport::new(ctx);

        info!(
            "Run {} (project '{}', group '{}', steps: {})",
            report.context.run_id, report.context.project, report.context.group, selector
        );

        let plan = match self.plan(selector) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Validation failed: {}", e);
                report.error = Some(e);
                report.transition(RunState::Failed);
                return report;
            }
        };

        if self.dry_run {
            self.report_dry_run(&plan, &mut report);
            report.transition(RunState::Finalizing);
            report.transition(RunState::Succeeded);
            return report;
        }

        let workspace = match Workspace::create(settings.workspace_root.as_deref()) {
            Ok(ws) => ws,
            Err(e) => {
                error!("{}", e);
                report.error = Some(e);
                report.transition(RunState::Failed);
                return report;
            }
        };

        for planned in &plan.steps {
            report.transition(RunState::StepPending);
            if let Err(e) = self.run_step(planned, &workspace, &mut report) {
                error!("Step '{}' failed: {}", planned.step.name, e);
                report.error = Some(e);
                break;
            }
        }

        report.transition(RunState::Finalizing);
        if let Err(e) = workspace.close() {
            warn!("{}", e);
        }

        if report.error.is_some() {
            report.transition(RunState::Failed);
        } else {
            info!(
                "Run {} succeeded ({} steps, {} artifacts published)",
                report.context.run_id,
                report.steps.len(),
                report.published().len()
            );
            report.transition(RunState::Succeeded);
        }
        report
    }

    fn report_dry_run(&self, plan: &RunPlan<'_>, report: &mut RunReport) {
        for planned in &plan.steps {
            let mut record = InvocationRecord::new(planned.step, StepStatus::Planned);
            for input in &planned.inputs {
                let shown = match &input.resolved {
                    Some(artifact) => artifact.reference().to_string(),
                    None => input.reference.to_string(),
                };
                record.inputs.insert(input.param.clone(), shown);
            }
            info!("[DRY RUN] Step '{}' ({})", record.step, record.environment);
            report.steps.push(record);
        }
    }

    /// Runs one step end to end. An `Err` aborts the run.
    fn run_step(
        &self,
        planned: &PlannedStep<'_>,
        workspace: &Workspace,
        report: &mut RunReport,
    ) -> Result<()> {
        let step = planned.step;
        let started = Instant::now();
        let mut record = InvocationRecord::new(step, StepStatus::Failed);

        report.timeline.add_event(&step.name, EventType::Started);
        info!("Starting step: {}", step.name);

        let result = self.invoke(planned, workspace, report, &mut record);
        record.duration_ms = started.elapsed().as_millis() as u64;

        let event = match (&result, record.status) {
            (Err(_), _) | (Ok(()), StepStatus::Failed) => EventType::Failed,
            (Ok(()), StepStatus::Skipped) => EventType::Skipped,
            _ => EventType::Completed,
        };
        if result.is_err() {
            record.status = StepStatus::Failed;
        }

        report.timeline.add_event(&step.name, event);
        report.steps.push(record);
        result
    }

    /// Checkout directory of a step that runs from a git source.
    fn source_dir(
        &self,
        step: &StepDefinition,
        source: &StepSource,
        workspace: &Workspace,
    ) -> Result<PathBuf> {
        let repository = self.pipeline.source_repository(step).ok_or_else(|| {
            RunError::InvalidPipeline(format!(
                "step '{}' has a source but no repository",
                step.name
            ))
        })?;
        SourceCheckouts::new(workspace.path().join(SOURCES_DIR)).step_dir(
            &repository,
            &source.version,
            source.path.as_deref(),
        )
    }

    fn invoke(
        &self,
        planned: &PlannedStep<'_>,
        workspace: &Workspace,
        report: &mut RunReport,
        record: &mut InvocationRecord,
    ) -> Result<()> {
        let step = planned.step;
        let dir = workspace.invocation_dir(planned.position, &step.name)?;

        let step_dir = match &step.source {
            Some(source) => Some(self.source_dir(step, source, workspace)?),
            None => self.pipeline.step_dir(step),
        };
        let mut invocation = StepInvocation::new(step, &dir).with_step_dir(step_dir);
        if let Some(log_dir) = &self.pipeline.settings.log_dir {
            invocation = invocation.with_log_dir(log_dir.join(report.context.run_id.to_string()));
        }

        for input in &planned.inputs {
            let artifact = match &input.resolved {
                Some(artifact) => artifact.clone(),
                None => self.store.resolve(&input.reference)?,
            };
            let path = self.store.fetch(&artifact, workspace.path())?;
            record
                .inputs
                .insert(input.param.clone(), artifact.reference().to_string());
            invocation = invocation.with_input(ResolvedInput {
                param: input.param.clone(),
                artifact,
                path,
            });
        }

        let handle = self.environments.provision(&step.environment)?;
        record.environment = handle.name.clone();

        let process = invocation.prepare(&report.context, self.store.location())?;
        report.transition(RunState::StepRunning);
        let exit = self.environments.execute(&handle, &process)?;
        record.exit_code = exit.code;

        match interpret_exit(exit.code) {
            StepOutcome::Succeeded => {
                // Every declared output is checked before anything is published,
                // and the outputs become visible together or not at all
                let requests = invocation.collect_outputs()?;
                for artifact in self.store.publish_all(requests)? {
                    if let Some(output) = step.output(&artifact.name) {
                        for alias in output.aliases.iter().filter(|a| *a != LATEST_ALIAS) {
                            self.store.set_alias(&artifact.name, alias, artifact.version)?;
                        }
                    }
                    record.published.push(artifact.reference().to_string());
                }
                record.status = StepStatus::Completed;
                report.transition(RunState::StepCompleted);
                info!(
                    "Step '{}' completed successfully ({:.2?})",
                    step.name, exit.duration
                );
                Ok(())
            }
            StepOutcome::Recoverable => {
                warn!(
                    "Step '{}' reported a recoverable failure, skipping (nothing published)",
                    step.name
                );
                record.status = StepStatus::Skipped;
                report.transition(RunState::StepCompleted);
                Ok(())
            }
            StepOutcome::Failed(code) => {
                log_stderr(&step.name, &exit.stderr_path);
                if step.best_effort {
                    warn!(
                        "Best-effort step '{}' failed with exit code {:?}, continuing",
                        step.name, code
                    );
                    record.status = StepStatus::Skipped;
                    report.transition(RunState::StepCompleted);
                    Ok(())
                } else {
                    Err(RunError::StepExecution {
                        step: step.name.clone(),
                        exit_code: code,
                    })
                }
            }
        }
    }
}

/// Closest earlier active step that publishes `reference` under its alias.
fn producer_in_run(earlier: &[&StepDefinition], reference: &ArtifactRef) -> Option<String> {
    let alias = match &reference.selector {
        Selector::Alias(alias) => alias,
        Selector::Version(_) => return None,
    };

    earlier
        .iter()
        .rev()
        .find(|s| {
            s.output(&reference.name)
                .map_or(false, |o| alias == LATEST_ALIAS || o.aliases.contains(alias))
        })
        .map(|s| s.name.clone())
}

fn log_stderr(step: &str, path: &std::path::Path) {
    match fs::read_to_string(path) {
        Ok(stderr) if !stderr.trim().is_empty() => {
            error!("Step '{}' stderr:\n{}", step, stderr.trim_end());
        }
        Ok(_) => {}
        Err(e) => debug!("No stderr captured for '{}': {}", step, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{LocalArtifactStore, PublishRequest};
    use crate::environment::manager::tests::FakeBackend;
    use crate::environment::EnvironmentSpec;
    use crate::execution::source::tests::{components_repo, git_available};
    use crate::pipeline::OutputSpec;
    use std::sync::atomic::Ordering;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        temp: TempDir,
        store: Arc<LocalArtifactStore>,
        backend: Arc<FakeBackend>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            let store = Arc::new(LocalArtifactStore::open(temp.path().join("store")).unwrap());
            Self {
                temp,
                store,
                backend: Arc::new(FakeBackend::default()),
            }
        }

        fn pipeline(&self, steps: Vec<StepDefinition>) -> Pipeline {
            let mut pipeline = Pipeline::from_steps(steps);
            pipeline.base_dir = self.temp.path().to_path_buf();
            pipeline.settings.workspace_root = Some(self.temp.path().join("ws"));
            pipeline
        }

        fn orchestrator(&self, steps: Vec<StepDefinition>) -> Orchestrator {
            self.orchestrator_for(self.pipeline(steps))
        }

        fn orchestrator_for(&self, pipeline: Pipeline) -> Orchestrator {
            Orchestrator::new(
                pipeline,
                self.store.clone(),
                EnvironmentManager::new(self.backend.clone(), self.temp.path().join("envs.json")),
            )
        }

        fn seed(&self, name: &str, content: &str) {
            let payload = self.temp.path().join(name);
            fs::write(&payload, content).unwrap();
            self.store
                .publish(PublishRequest::new(name, "raw_data", payload))
                .unwrap();
        }

        fn workspaces_left(&self) -> usize {
            fs::read_dir(self.temp.path().join("ws"))
                .map(|d| d.count())
                .unwrap_or(0)
        }
    }

    fn producer(name: &str, artifact: &str) -> StepDefinition {
        StepDefinition::new(
            name,
            format!("echo {} > \"$STAGERUNNER_OUTPUT_DIR/{}\"; true", name, artifact),
        )
        .with_output(OutputSpec::new(artifact, "data"))
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::StepRunning.to_string(), "step running");
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Finalizing.is_terminal());
    }

    #[test]
    fn test_linear_run_publishes_and_chains_inputs() {
        let fx = Fixture::new();
        let consumer = StepDefinition::new(
            "clean",
            "cat \"$2\" > \"$STAGERUNNER_OUTPUT_DIR/clean.csv\"; true",
        )
        .with_input("input_artifact", "raw.csv:latest")
        .with_output(OutputSpec::new("clean.csv", "clean").with_alias("candidate"));

        let orchestrator = fx.orchestrator(vec![producer("download", "raw.csv"), consumer]);
        let report = orchestrator.run(&StepSelector::All).unwrap();

        assert!(report.succeeded());
        let completed_at = report.completed_at.unwrap();
        assert!(completed_at >= report.context.started_at);
        assert_eq!(report.published(), vec!["raw.csv:v0", "clean.csv:v0"]);
        assert_eq!(
            report.record("clean").unwrap().inputs.get("input_artifact").unwrap(),
            "raw.csv:v0"
        );

        let clean = fx.store.resolve_str("clean.csv:candidate").unwrap();
        let content = fs::read_to_string(&clean.payload_path).unwrap();
        assert_eq!(content.trim(), "download");
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[test]
    fn test_unknown_step_runs_nothing() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(vec![producer("A", "a.txt")]);

        let report = orchestrator.execute(&StepSelector::named(["A", "D"]));
        assert_eq!(report.state, RunState::Failed);
        assert!(report.completed_at.is_some());
        assert!(report.steps.is_empty());
        assert!(matches!(report.error, Some(RunError::UnknownStep(_))));
        assert!(fx.store.names().unwrap().is_empty());
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[test]
    fn test_unresolvable_input_fails_before_running() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(vec![
            producer("A", "a.txt"),
            StepDefinition::new("B", "true").with_input("x", "missing.csv:latest"),
        ]);

        let err = orchestrator.run(&StepSelector::All).unwrap_err();
        assert!(err.is_validation());
        assert!(fx.store.names().unwrap().is_empty());
    }

    #[test]
    fn test_input_from_unselected_producer_must_exist() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(vec![
            producer("A", "a.txt"),
            StepDefinition::new("B", "true").with_input("x", "a.txt:latest"),
        ]);

        let err = orchestrator.run(&StepSelector::named(["B"])).unwrap_err();
        assert!(matches!(err, RunError::UnknownArtifact { .. }));
    }

    #[test]
    fn test_failure_aborts_remaining_steps() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(vec![
            producer("A", "a.txt"),
            StepDefinition::new("B", "echo broken >&2; exit 2"),
            producer("C", "c.txt"),
        ]);

        let report = orchestrator.execute(&StepSelector::All);
        assert_eq!(report.state, RunState::Failed);
        assert!(report.completed_at.unwrap() >= report.context.started_at);
        assert!(matches!(
            report.error,
            Some(RunError::StepExecution { exit_code: Some(2), .. })
        ));
        assert_eq!(report.record("B").unwrap().status, StepStatus::Failed);
        assert!(report.record("C").is_none());
        assert!(fx.store.resolve_str("a.txt:latest").is_ok());
        assert!(fx.store.versions("c.txt").unwrap().is_empty());
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[test]
    fn test_recoverable_exit_skips_step() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(vec![
            StepDefinition::new("A", "exit 75").with_output(OutputSpec::new("a.txt", "data")),
            producer("B", "b.txt"),
        ]);

        let report = orchestrator.run(&StepSelector::All).unwrap();
        assert_eq!(report.record("A").unwrap().status, StepStatus::Skipped);
        assert_eq!(report.published(), vec!["b.txt:v0"]);
        assert_eq!(report.timeline.outcome("A"), Some(EventType::Skipped));
    }

    #[test]
    fn test_best_effort_failure_continues() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(vec![
            StepDefinition::new("check", "exit 1").best_effort(),
            producer("B", "b.txt"),
        ]);

        let report = orchestrator.run(&StepSelector::All).unwrap();
        let check = report.record("check").unwrap();
        assert_eq!(check.status, StepStatus::Skipped);
        assert_eq!(check.exit_code, Some(1));
        assert!(report.record("B").is_some());
    }

    #[test]
    fn test_missing_output_publishes_nothing() {
        let fx = Fixture::new();
        let step = producer("A", "a.txt").with_output(OutputSpec::new("never.txt", "data"));
        let orchestrator = fx.orchestrator(vec![step]);

        let err = orchestrator.run(&StepSelector::All).unwrap_err();
        assert!(matches!(err, RunError::PartialPublishViolation { .. }));
        assert!(fx.store.versions("a.txt").unwrap().is_empty());
    }

    #[test]
    fn test_pinned_version_input() {
        let fx = Fixture::new();
        fx.seed("sample.csv", "first");
        fx.seed("sample.csv", "second");

        let step = StepDefinition::new(
            "copy",
            "cp \"$2\" \"$STAGERUNNER_OUTPUT_DIR/copy.csv\"; true",
        )
        .with_input("input_artifact", "sample.csv:v0")
        .with_output(OutputSpec::new("copy.csv", "data"));

        let report = fx.orchestrator(vec![step]).run(&StepSelector::All).unwrap();
        assert_eq!(
            report.record("copy").unwrap().inputs["input_artifact"],
            "sample.csv:v0"
        );
        let copy = fx.store.resolve_str("copy.csv").unwrap();
        assert_eq!(fs::read_to_string(copy.payload_path).unwrap(), "first");
    }

    #[test]
    fn test_dry_run_has_no_side_effects() {
        let fx = Fixture::new();
        let mut orchestrator = fx.orchestrator(vec![
            producer("A", "a.txt").with_environment(EnvironmentSpec::conda("python=3.10")),
            StepDefinition::new("B", "true").with_input("x", "a.txt:latest"),
        ]);
        orchestrator.set_dry_run(true);

        let report = orchestrator.run(&StepSelector::All).unwrap();
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps.iter().all(|r| r.status == StepStatus::Planned));
        assert_eq!(report.record("B").unwrap().inputs["x"], "a.txt:latest");
        assert!(fx.store.names().unwrap().is_empty());
        assert_eq!(fx.backend.creates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_isolated_environment_provisioned_once_per_signature() {
        let fx = Fixture::new();
        let env = EnvironmentSpec::conda("python=3.10").with_dependency("pandas");
        let orchestrator = fx.orchestrator(vec![
            producer("A", "a.txt").with_environment(env.clone()),
            producer("B", "b.txt").with_environment(env.clone()),
        ]);

        let report = orchestrator.run(&StepSelector::All).unwrap();
        assert_eq!(fx.backend.creates.load(Ordering::SeqCst), 1);
        assert_eq!(report.record("A").unwrap().environment, env.env_name());
    }

    #[test]
    fn test_steps_sharing_env_name_keep_their_own_dependencies() {
        let fx = Fixture::new();
        let py39 = EnvironmentSpec::conda("python=3.9").with_name("train");
        let py310 = EnvironmentSpec::conda("python=3.10").with_name("train");
        let orchestrator = fx.orchestrator(vec![
            producer("A", "a.txt").with_environment(py39.clone()),
            producer("B", "b.txt").with_environment(py310),
            producer("C", "c.txt").with_environment(py39.clone()),
        ]);

        orchestrator.run(&StepSelector::All).unwrap();
        assert_eq!(fx.backend.creates.load(Ordering::SeqCst), 3);
        assert_eq!(fx.backend.removes.load(Ordering::SeqCst), 2);

        let registry = crate::environment::EnvRegistry::load(&fx.temp.path().join("envs.json"));
        assert_eq!(registry.get("train"), Some(&py39.signature()));
    }

    #[test]
    fn test_context_reaches_step() {
        let fx = Fixture::new();
        let step = StepDefinition::new(
            "ctx",
            "echo \"$STAGERUNNER_PROJECT/$STAGERUNNER_GROUP/$STAGERUNNER_STEP\" > \"$STAGERUNNER_OUTPUT_DIR/ctx.txt\"",
        )
        .with_output(OutputSpec::new("ctx.txt", "data"));

        let mut orchestrator = fx.orchestrator(vec![step]);
        orchestrator.set_project("nyc_airbnb");
        orchestrator.set_group("development");
        orchestrator.run(&StepSelector::All).unwrap();

        let ctx = fx.store.resolve_str("ctx.txt").unwrap();
        assert_eq!(
            fs::read_to_string(ctx.payload_path).unwrap().trim(),
            "nyc_airbnb/development/ctx"
        );
    }

    #[test]
    fn test_report_completion_time_set_only_when_terminal() {
        let fx = Fixture::new();
        let mut report = RunReport::new(RunContext::new("p", None));
        assert!(report.completed_at.is_none());

        report.transition(RunState::StepPending);
        report.transition(RunState::Finalizing);
        assert!(report.completed_at.is_none());

        report.transition(RunState::Succeeded);
        assert!(report.completed_at.is_some());

        let mut orchestrator = fx.orchestrator(vec![producer("A", "a.txt")]);
        orchestrator.set_dry_run(true);
        let dry = orchestrator.run(&StepSelector::All).unwrap();
        assert!(dry.completed_at.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_publish_leaves_no_output_of_the_step() {
        let fx = Fixture::new();
        let step = StepDefinition::new(
            "split",
            "echo train > \"$STAGERUNNER_OUTPUT_DIR/first.txt\"; \
             mkdir -p \"$STAGERUNNER_OUTPUT_DIR/second\"; \
             ln -s /nonexistent/target \"$STAGERUNNER_OUTPUT_DIR/second/broken\"; true",
        )
        .with_output(OutputSpec::new("first.txt", "segregated_data"))
        .with_output(OutputSpec::new("second", "segregated_data"));

        let report = fx.orchestrator(vec![step]).execute(&StepSelector::All);

        assert_eq!(report.state, RunState::Failed);
        assert!(report.published().is_empty());
        assert!(fx.store.versions("first.txt").unwrap().is_empty());
        assert!(fx.store.versions("second").unwrap().is_empty());
        assert!(fx.store.names().unwrap().is_empty());
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[test]
    fn test_modified_input_does_not_leak_to_later_step() {
        let fx = Fixture::new();
        fx.seed("raw.csv", "id,price\n1,100\n");

        let vandal = StepDefinition::new("vandal", "echo tampered > \"$2\"; true")
            .with_input("input_artifact", "raw.csv:latest");
        let copy = StepDefinition::new(
            "copy",
            "cp \"$2\" \"$STAGERUNNER_OUTPUT_DIR/copy.csv\"; true",
        )
        .with_input("input_artifact", "raw.csv:latest")
        .with_output(OutputSpec::new("copy.csv", "data"));

        fx.orchestrator(vec![vandal, copy])
            .run(&StepSelector::All)
            .unwrap();

        let copy = fx.store.resolve_str("copy.csv").unwrap();
        assert_eq!(fs::read_to_string(copy.payload_path).unwrap(), "id,price\n1,100\n");
        let raw = fx.store.resolve_str("raw.csv:v0").unwrap();
        assert_eq!(fs::read_to_string(raw.payload_path).unwrap(), "id,price\n1,100\n");
    }

    #[test]
    fn test_same_output_from_two_steps_gets_two_versions() {
        let fx = Fixture::new();
        let consumer = StepDefinition::new(
            "C",
            "cp \"$2\" \"$STAGERUNNER_OUTPUT_DIR/y.txt\"; true",
        )
        .with_input("x", "x.txt:latest")
        .with_output(OutputSpec::new("y.txt", "data"));

        let report = fx
            .orchestrator(vec![producer("A", "x.txt"), producer("B", "x.txt"), consumer])
            .run(&StepSelector::All)
            .unwrap();

        assert_eq!(report.published(), vec!["x.txt:v0", "x.txt:v1", "y.txt:v0"]);
        assert_eq!(report.record("C").unwrap().inputs["x"], "x.txt:v1");
        assert_eq!(fx.store.resolve_str("x.txt:latest").unwrap().version.to_string(), "v1");

        let y = fx.store.resolve_str("y.txt").unwrap();
        assert_eq!(fs::read_to_string(y.payload_path).unwrap().trim(), "B");
    }

    #[test]
    fn test_invalid_pipeline_runs_nothing() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(vec![producer("A", "a.txt"), producer("A", "b.txt")]);

        let report = orchestrator.execute(&StepSelector::All);
        assert_eq!(report.state, RunState::Failed);
        assert!(matches!(report.error, Some(RunError::InvalidPipeline(_))));
        assert!(report.steps.is_empty());
        assert!(fx.store.names().unwrap().is_empty());
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[test]
    fn test_new_indexes_steps_added_after_construction() {
        let fx = Fixture::new();
        let mut pipeline = fx.pipeline(vec![producer("A", "a.txt")]);
        pipeline.steps.push(producer("B", "b.txt"));

        let report = fx
            .orchestrator_for(pipeline)
            .run(&StepSelector::named(["B"]))
            .unwrap();
        assert_eq!(report.published(), vec!["b.txt:v0"]);
    }

    #[test]
    fn test_step_runs_from_git_source() {
        if !git_available() {
            return;
        }
        let fx = Fixture::new();
        let repo = components_repo(fx.temp.path());

        let copy_script = "cp {step_dir}/run.sh \"$STAGERUNNER_OUTPUT_DIR/script.sh\"; true";
        let mut pipeline = fx.pipeline(vec![
            StepDefinition::new("download", copy_script)
                .with_source(StepSource::component("get_data"))
                .with_output(OutputSpec::new("script.sh", "code")),
            StepDefinition::new("download_v2", copy_script)
                .with_source(StepSource::component("get_data").with_version("v2"))
                .with_output(OutputSpec::new("script.sh", "code")),
        ]);
        pipeline.settings.components_repository = Some(repo.to_string_lossy().into_owned());

        let report = fx.orchestrator_for(pipeline).run(&StepSelector::All).unwrap();
        assert_eq!(report.published(), vec!["script.sh:v0", "script.sh:v1"]);

        let main = fx.store.resolve_str("script.sh:v0").unwrap();
        assert_eq!(fs::read_to_string(main.payload_path).unwrap(), "echo main");
        let v2 = fx.store.resolve_str("script.sh:v1").unwrap();
        assert_eq!(fs::read_to_string(v2.payload_path).unwrap(), "echo v2");
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[test]
    fn test_unreachable_source_fails_step_and_dry_run_skips_checkout() {
        let fx = Fixture::new();
        let mut pipeline = fx.pipeline(vec![StepDefinition::new(
            "download",
            "bash {step_dir}/run.sh",
        )
        .with_source(StepSource::component("get_data"))]);
        pipeline.settings.components_repository =
            Some(fx.temp.path().join("no-repo").to_string_lossy().into_owned());

        let mut orchestrator = fx.orchestrator_for(pipeline);
        orchestrator.set_dry_run(true);
        assert!(orchestrator.run(&StepSelector::All).unwrap().succeeded());

        orchestrator.set_dry_run(false);
        let report = orchestrator.execute(&StepSelector::All);
        assert_eq!(report.state, RunState::Failed);
        assert!(matches!(report.error, Some(RunError::SourceCheckout { .. })));
        assert_eq!(report.record("download").unwrap().status, StepStatus::Failed);
    }
}
