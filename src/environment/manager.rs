//! Execution Environment Manager
//!
//! Turns [`EnvironmentSpec`]s into ready-to-use handles and runs step
//! processes inside them.
//!
//! Provisioning is cached per environment name for the lifetime of the
//! manager. A cached handle is only reused while it was built from the
//! requested signature. An already-built environment is likewise only
//! reused when the registry shows it was built from the same signature;
//! otherwise it is removed and rebuilt.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Result, RunError};

use super::registry::EnvRegistry;
use super::spec::{EnvironmentSpec, LOCAL_SIGNATURE};

/// Builds and launches isolated environments.
pub trait EnvironmentBackend: Send + Sync {
    /// Whether an environment with this name is currently built.
    fn exists(&self, env_name: &str) -> Result<bool>;

    /// Builds a new environment.
    fn create(&self, env_name: &str, packages: &[String], channels: &[String]) -> Result<()>;

    /// Deletes an environment.
    fn remove(&self, env_name: &str) -> Result<()>;

    /// A `bash` launcher running inside the environment; the caller appends
    /// the script and its arguments.
    fn launcher(&self, env_name: &str) -> Command;
}

/// A provisioned, ready-to-use environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    pub name: String,
    pub signature: String,
    pub isolated: bool,
}

impl EnvironmentHandle {
    fn local() -> Self {
        Self {
            name: LOCAL_SIGNATURE.to_string(),
            signature: LOCAL_SIGNATURE.to_string(),
            isolated: false,
        }
    }
}

/// Everything needed to launch one step process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Outcome of a step process.
#[derive(Debug, Clone)]
pub struct ExitResult {
    /// `None` when the process was terminated by a signal
    pub code: Option<i32>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub duration: Duration,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Provisions environments and executes processes in them.
pub struct EnvironmentManager {
    backend: Arc<dyn EnvironmentBackend>,
    registry_path: PathBuf,
    /// Environment name -> handle as last built by this manager
    cache: Mutex<HashMap<String, EnvironmentHandle>>,
}

impl EnvironmentManager {
    /// Creates a manager persisting build signatures at `registry_path`.
    pub fn new(backend: Arc<dyn EnvironmentBackend>, registry_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            registry_path: registry_path.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a handle for the spec, building the environment if needed.
    ///
    /// Concurrent callers are serialized so an environment is built once
    /// and the handle shared. Two specs sharing a name but not a signature
    /// replace each other's build.
    pub fn provision(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        if !spec.is_isolated() {
            return Ok(EnvironmentHandle::local());
        }

        let signature = spec.signature();
        let env_name = spec.env_name();

        let mut cache = self.cache.lock().map_err(|_| RunError::EnvironmentProvision {
            environment: env_name.clone(),
            reason: "environment cache poisoned".to_string(),
        })?;

        match cache.get(&env_name) {
            Some(handle) if handle.signature == signature => {
                debug!("Reusing environment '{}' from this run", handle.name);
                return Ok(handle.clone());
            }
            Some(_) => debug!(
                "Environment '{}' was built from other dependencies earlier in this run",
                env_name
            ),
            None => {}
        }

        let mut registry = EnvRegistry::load(&self.registry_path);
        let recorded = registry.get(&env_name).cloned();

        if self.backend.exists(&env_name)? {
            match recorded {
                Some(ref s) if *s == signature => {
                    info!("Environment '{}' is up to date", env_name);
                }
                _ => {
                    warn!(
                        "Environment '{}' does not match its declared dependencies, rebuilding",
                        env_name
                    );
                    self.backend.remove(&env_name)?;
                    registry.remove(&env_name);
                    self.backend
                        .create(&env_name, &spec.packages(), &spec.channels)?;
                }
            }
        } else {
            self.backend
                .create(&env_name, &spec.packages(), &spec.channels)?;
        }

        registry.set(&env_name, &signature);
        if let Err(e) = registry.save(&self.registry_path) {
            warn!("Failed to save environment registry: {}", e);
        }

        let handle = EnvironmentHandle {
            name: env_name.clone(),
            signature,
            isolated: true,
        };
        cache.insert(env_name, handle.clone());
        Ok(handle)
    }

    /// Runs a step process inside the environment and waits for it.
    ///
    /// Standard output and error are written to the paths in `process`.
    pub fn execute(&self, handle: &EnvironmentHandle, process: &ProcessSpec) -> Result<ExitResult> {
        let mut cmd = if handle.isolated {
            self.backend.launcher(&handle.name)
        } else {
            Command::new("bash")
        };

        cmd.arg(&process.script)
            .args(&process.args)
            .current_dir(&process.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(create_log(&process.stdout_path)?))
            .stderr(Stdio::from(create_log(&process.stderr_path)?));

        for (key, value) in &process.env {
            cmd.env(key, value);
        }

        debug!(
            "Executing {} in '{}' (cwd {})",
            process.script.display(),
            handle.name,
            process.working_dir.display()
        );

        let started = Instant::now();
        let status = cmd
            .status()
            .map_err(|e| RunError::EnvironmentProvision {
                environment: handle.name.clone(),
                reason: format!("failed to launch step process: {}", e),
            })?;

        Ok(ExitResult {
            code: status.code(),
            stdout_path: process.stdout_path.clone(),
            stderr_path: process.stderr_path.clone(),
            duration: started.elapsed(),
        })
    }

    /// Number of environments provisioned by this manager.
    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

fn create_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RunError::io("failed to create log directory", parent, e))?;
    }
    File::create(path).map_err(|e| RunError::io("failed to create log file", path, e))
}
