//! StageRunner CLI Entry Point
//!
//! Provides command-line interface for pipeline runs and artifact store
//! inspection.
//!
//! # Usage
//!
//! ```bash
//! # Run every step
//! stagerunner run pipeline.yaml
//!
//! # Rerun a subset (declared order is kept)
//! stagerunner run pipeline.yaml --steps basic_cleaning,data_check
//!
//! # Dry run mode (validate and show the plan)
//! stagerunner run pipeline.yaml --dry-run
//!
//! # Check a pipeline file
//! stagerunner validate pipeline.yaml
//!
//! # Inspect the store and promote a model
//! stagerunner artifacts ./artifacts random_forest_export
//! stagerunner alias ./artifacts random_forest_export prod v3
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};

use stagerunner::artifact::{ArtifactStore, LocalArtifactStore, Version};
use stagerunner::environment::registry::registry_path;
use stagerunner::environment::{EnvironmentManager, MicromambaBackend, MAMBA_ROOT_PREFIX};
use stagerunner::execution::{Orchestrator, RunReport, StepStatus};
use stagerunner::pipeline::{load_pipeline, RunSettings, StepSelector};
use stagerunner::{APP_NAME, VERSION};

/// Store directory used when neither settings nor flags name one,
/// relative to the pipeline file.
const DEFAULT_STORE_DIR: &str = "artifacts";

const ENV_STORE: &str = "STAGERUNNER_STORE";
const ENV_ENV_ROOT: &str = "STAGERUNNER_ENV_ROOT";
const ENV_PROJECT: &str = "STAGERUNNER_PROJECT";
const ENV_GROUP: &str = "STAGERUNNER_GROUP";

/// Subcommand selected on the command line.
#[derive(Debug, PartialEq)]
enum Command {
    Run,
    Validate,
    Artifacts,
    Alias,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    positional: Vec<String>,
    steps: Option<String>,
    dry_run: bool,
    project: Option<String>,
    group: Option<String>,
    store: Option<PathBuf>,
    env_root: Option<PathBuf>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: Command::Run,
            positional: Vec::new(),
            steps: None,
            dry_run: false,
            project: None,
            group: None,
            store: None,
            env_root: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Linear Step Orchestrator");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: stagerunner <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  run <PIPELINE>                       Run the pipeline");
    println!("  validate <PIPELINE>                  Load and validate a pipeline file");
    println!("  artifacts <STORE> [NAME]             List artifacts, or versions of NAME");
    println!("  alias <STORE> <NAME> <ALIAS> <VER>   Point ALIAS of NAME at version VER");
    println!();
    println!("Run options:");
    println!("  --steps LIST        'all' or comma-separated step names");
    println!("  --dry-run           Validate and show the plan without executing");
    println!("  --project NAME      Project identifier passed to every step");
    println!("  --group NAME        Run group identifier passed to every step");
    println!("  --store DIR         Artifact store root");
    println!("  --env-root DIR      Micromamba root prefix for isolated environments");
    println!();
    println!("Options:");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Environment:");
    println!("  {}, {}, {}, {}", ENV_STORE, ENV_ENV_ROOT, ENV_PROJECT, ENV_GROUP);
    println!("  override pipeline settings; command-line options override both.");
    println!();
    println!("Examples:");
    println!("  stagerunner run pipeline.yaml");
    println!("  stagerunner run pipeline.yaml --steps data_split,train_random_forest");
    println!("  stagerunner alias ./artifacts random_forest_export prod v3");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    let Some(command) = args.get(i) else {
        return Err("No command given".to_string());
    };
    config.command = match command.as_str() {
        "run" => Command::Run,
        "validate" => Command::Validate,
        "artifacts" => Command::Artifacts,
        "alias" => Command::Alias,
        "--help" | "-h" => {
            print_usage();
            std::process::exit(0);
        }
        "--version" | "-V" => {
            println!("{} {}", APP_NAME, VERSION);
            std::process::exit(0);
        }
        other => return Err(format!("Unknown command: {}", other)),
    };
    i += 1;

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--steps" | "--project" | "--group" | "--store" | "--env-root" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    return Err(format!("{} requires an argument", arg));
                };
                match arg.as_str() {
                    "--steps" => config.steps = Some(value.clone()),
                    "--project" => config.project = Some(value.clone()),
                    "--group" => config.group = Some(value.clone()),
                    "--store" => config.store = Some(PathBuf::from(value)),
                    _ => config.env_root = Some(PathBuf::from(value)),
                }
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => config.positional.push(arg.clone()),
        }
        i += 1;
    }

    let expected = match config.command {
        Command::Run | Command::Validate => 1..=1,
        Command::Artifacts => 1..=2,
        Command::Alias => 4..=4,
    };
    if !expected.contains(&config.positional.len()) {
        return Err(format!("Wrong number of arguments for '{}'", command));
    }

    Ok(config)
}

/// Layers environment variables and then flags over pipeline settings.
fn apply_overrides(
    settings: &mut RunSettings,
    config: &Config,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(store) = lookup(ENV_STORE) {
        settings.store = Some(PathBuf::from(store));
    }
    if let Some(env_root) = lookup(ENV_ENV_ROOT) {
        settings.env_root = Some(PathBuf::from(env_root));
    }
    if let Some(project) = lookup(ENV_PROJECT) {
        settings.project = project;
    }
    if let Some(group) = lookup(ENV_GROUP) {
        settings.group = Some(group);
    }

    if let Some(ref store) = config.store {
        settings.store = Some(store.clone());
    }
    if let Some(ref env_root) = config.env_root {
        settings.env_root = Some(env_root.clone());
    }
    if let Some(ref project) = config.project {
        settings.project = project.clone();
    }
    if let Some(ref group) = config.group {
        settings.group = Some(group.clone());
    }
    if let Some(ref steps) = config.steps {
        settings.steps = steps.clone();
    }
}

fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Resolves a settings path against the pipeline directory.
fn anchored(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Anchors every relative path setting to the pipeline directory.
fn anchor_settings(settings: &mut RunSettings, base: &Path) {
    for path in [
        &mut settings.store,
        &mut settings.env_root,
        &mut settings.log_dir,
        &mut settings.workspace_root,
    ] {
        if let Some(p) = path.as_mut() {
            *p = anchored(base, p);
        }
    }
}

fn run_pipeline(config: &Config) -> Result<bool, Box<dyn std::error::Error>> {
    let pipeline_path = &config.positional[0];
    let mut pipeline = load_pipeline(pipeline_path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!("Could not load pipeline from '{}': {}", pipeline_path, e)
    })?;

    apply_overrides(&mut pipeline.settings, config, env_lookup);
    let base = pipeline.base_dir.clone();
    anchor_settings(&mut pipeline.settings, &base);
    let settings = pipeline.settings.clone();

    let store_root = settings
        .store
        .clone()
        .unwrap_or_else(|| base.join(DEFAULT_STORE_DIR));
    let env_root = settings
        .env_root
        .clone()
        .unwrap_or_else(|| MAMBA_ROOT_PREFIX.clone());

    info!("Artifact store: {}", store_root.display());
    info!("Environment root: {}", env_root.display());

    let selector = StepSelector::parse(&settings.steps)?;
    let store = Arc::new(LocalArtifactStore::open(&store_root)?);
    let environments = EnvironmentManager::new(
        Arc::new(MicromambaBackend::new(&env_root)),
        registry_path(&env_root),
    );

    let mut orchestrator = Orchestrator::new(pipeline, store, environments);
    orchestrator.set_dry_run(config.dry_run);

    if config.dry_run {
        info!("Mode: DRY RUN (steps will not execute)");
        println!();
    }

    let report = orchestrator.execute(&selector);
    print_summary(&report);

    if let Some(ref e) = report.error {
        return Err(e.to_string().into());
    }
    Ok(report.succeeded())
}

/// Prints the per-step outcome of a run.
fn print_summary(report: &RunReport) {
    println!();
    println!(
        "Run {} ({} / {})",
        report.context.run_id, report.context.project, report.context.group
    );

    for record in &report.steps {
        let status = match record.status {
            StepStatus::Completed => "completed".green(),
            StepStatus::Skipped => "skipped".yellow(),
            StepStatus::Failed => "failed".red(),
            StepStatus::Planned => "planned".cyan(),
        };
        println!("  {:24} {:10} {:>8} ms", record.step, status, record.duration_ms);

        for (param, reference) in &record.inputs {
            println!("      in  {} = {}", param, reference);
        }
        for published in &record.published {
            println!("      out {}", published.bold());
        }
    }

    if report.steps.iter().any(|r| r.duration_ms > 0) {
        print!("{}", report.timeline.chart());
    }

    if let Some(completed_at) = report.completed_at {
        let elapsed = completed_at - report.context.started_at;
        println!(
            "Finished {} ({:.1} s)",
            completed_at.format("%Y-%m-%d %H:%M:%S"),
            elapsed.num_milliseconds() as f64 / 1000.0
        );
    }

    println!();
    if report.succeeded() {
        println!("{}", "Run succeeded".green().bold());
    } else {
        println!("{}", "Run failed".red().bold());
    }
}

fn validate_command(config: &Config) -> Result<bool, Box<dyn std::error::Error>> {
    let pipeline = load_pipeline(&config.positional[0])?;
    StepSelector::parse(&pipeline.settings.steps)?.active_steps(&pipeline)?;

    println!("{} ({} steps)", "Pipeline is valid".green(), pipeline.len());
    for (i, step) in pipeline.steps.iter().enumerate() {
        println!(
            "  {}. {} [{}]",
            i + 1,
            step.name,
            step.environment.env_name()
        );
    }
    Ok(true)
}

fn artifacts_command(config: &Config) -> Result<bool, Box<dyn std::error::Error>> {
    let store = LocalArtifactStore::open(&config.positional[0])?;

    match config.positional.get(1) {
        None => {
            for name in store.names()? {
                let count = store.versions(&name)?.len();
                println!("{:32} {} version(s)", name, count);
            }
        }
        Some(name) => {
            let aliases = store.aliases(name)?;
            for artifact in store.versions(name)? {
                let tags: Vec<&str> = aliases
                    .iter()
                    .filter(|(_, v)| *v == artifact.version)
                    .map(|(a, _)| a.as_str())
                    .collect();
                println!(
                    "{:6} {:16} {} {} {}",
                    artifact.version.to_string().bold(),
                    artifact.artifact_type,
                    artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
                    &artifact.digest[..artifact.digest.len().min(12)],
                    tags.join(",").cyan()
                );
            }
        }
    }
    Ok(true)
}

fn alias_command(config: &Config) -> Result<bool, Box<dyn std::error::Error>> {
    let store = LocalArtifactStore::open(&config.positional[0])?;
    let name = &config.positional[1];
    let alias = &config.positional[2];
    let version = Version::parse(&config.positional[3])
        .ok_or_else(|| format!("Invalid version '{}', expected v<N>", config.positional[3]))?;

    store.set_alias(name, alias, version)?;
    println!("{}:{} -> {}", name, alias, version);
    Ok(true)
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    match config.command {
        Command::Run => {
            print_banner();
            run_pipeline(&config)
        }
        Command::Validate => validate_command(&config),
        Command::Artifacts => artifacts_command(&config),
        Command::Alias => alias_command(&config),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
