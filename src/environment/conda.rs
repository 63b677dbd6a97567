//! Conda/Micromamba Environment Backend
//!
//! Builds and runs isolated step environments with micromamba.
//!
//! # Environment Resolution Priority
//!
//! Micromamba binary is resolved in the following order:
//! 1. `STAGERUNNER_MICROMAMBA` environment variable
//! 2. Production path: Next to the stagerunner executable
//! 3. Development path: `{project_root}/runtime/micromamba`
//! 4. System PATH: Falls back to system-installed micromamba

use std::path::PathBuf;
use std::process::Command;

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;

use crate::error::{Result, RunError};

use super::manager::EnvironmentBackend;

/// Channels used when a spec declares none.
pub const DEFAULT_CHANNELS: &[&str] = &["conda-forge"];

/// Lazily-initialized path to the micromamba binary.
pub static MICROMAMBA_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Some(path) = std::env::var_os("STAGERUNNER_MICROMAMBA") {
        let path = PathBuf::from(path);
        info!("Using micromamba from STAGERUNNER_MICROMAMBA: {}", path.display());
        return path;
    }

    let prod_path = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("micromamba")));

    if let Some(path) = prod_path.as_ref().filter(|p| p.exists()) {
        info!("Using bundled micromamba: {}", path.display());
        return path.clone();
    }

    let dev_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("runtime")
        .join("micromamba");

    if dev_path.exists() {
        info!("Using development micromamba: {}", dev_path.display());
        return dev_path;
    }

    if let Ok(output) = Command::new("which").arg("micromamba").output() {
        if output.status.success() {
            let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path_str.is_empty() {
                let system_path = PathBuf::from(path_str);
                info!("Using system micromamba: {}", system_path.display());
                return system_path;
            }
        }
    }

    warn!("Micromamba binary not found");
    warn!("  Searched: STAGERUNNER_MICROMAMBA, executable directory, {}", dev_path.display());
    warn!("  Searched: system PATH");
    warn!("  Download from: https://micro.mamba.pm/");

    PathBuf::from("micromamba")
});

/// Default micromamba root prefix (where environments are stored).
///
/// Keeps step environments apart from the user's own conda setup.
pub static MAMBA_ROOT_PREFIX: Lazy<PathBuf> = Lazy::new(|| {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    PathBuf::from(home).join(".stagerunner").join("micromamba")
});

/// Micromamba-backed environment builder.
#[derive(Debug, Clone)]
pub struct MicromambaBackend {
    binary: PathBuf,
    root_prefix: PathBuf,
}

impl MicromambaBackend {
    /// Backend using the discovered binary and the given root prefix.
    pub fn new(root_prefix: impl Into<PathBuf>) -> Self {
        Self {
            binary: MICROMAMBA_PATH.clone(),
            root_prefix: root_prefix.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn root_prefix(&self) -> &PathBuf {
        &self.root_prefix
    }

    /// Creates a Command configured with the correct MAMBA_ROOT_PREFIX.
    fn micromamba_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.env("MAMBA_ROOT_PREFIX", &self.root_prefix);
        cmd
    }

    fn provision_error(env_name: &str, reason: impl Into<String>) -> RunError {
        RunError::EnvironmentProvision {
            environment: env_name.to_string(),
            reason: reason.into(),
        }
    }
}

impl Default for MicromambaBackend {
    fn default() -> Self {
        Self::new(MAMBA_ROOT_PREFIX.clone())
    }
}

impl EnvironmentBackend for MicromambaBackend {
    fn exists(&self, env_name: &str) -> Result<bool> {
        let output = self
            .micromamba_command()
            .arg("env")
            .arg("list")
            .output()
            .map_err(|e| Self::provision_error(env_name, format!("cannot run micromamba: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Failed to list environments: {}", stderr);
            return Err(Self::provision_error(
                env_name,
                "failed to list micromamba environments",
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(env_list_contains(&stdout, env_name))
    }

    fn create(&self, env_name: &str, packages: &[String], channels: &[String]) -> Result<()> {
        info!("Creating environment '{}' with packages: {:?}", env_name, packages);

        let mut cmd = self.micromamba_command();
        cmd.arg("create").arg("-y").arg("-n").arg(env_name);

        if channels.is_empty() {
            for channel in DEFAULT_CHANNELS {
                cmd.arg("-c").arg(channel);
            }
        } else {
            for channel in channels {
                cmd.arg("-c").arg(channel);
            }
        }

        let output = cmd
            .args(packages)
            .output()
            .map_err(|e| Self::provision_error(env_name, format!("cannot run micromamba: {}", e)))?;

        if output.status.success() {
            info!("Successfully created environment '{}'", env_name);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Failed to create environment '{}': {}", env_name, stderr);
            Err(Self::provision_error(env_name, stderr.trim().to_string()))
        }
    }

    fn remove(&self, env_name: &str) -> Result<()> {
        debug!("Removing environment '{}'", env_name);

        let output = self
            .micromamba_command()
            .arg("env")
            .arg("remove")
            .arg("-y")
            .arg("-n")
            .arg(env_name)
            .output()
            .map_err(|e| Self::provision_error(env_name, format!("cannot run micromamba: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Self::provision_error(
                env_name,
                format!("failed to remove stale environment: {}", stderr.trim()),
            ))
        }
    }

    fn launcher(&self, env_name: &str) -> Command {
        let mut cmd = self.micromamba_command();
        cmd.arg("run").arg("-n").arg(env_name).arg("bash");
        cmd
    }
}

/// Checks `micromamba env list` output for an environment name.
fn env_list_contains(listing: &str, env_name: &str) -> bool {
    listing.lines().any(|line| {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some(name) if name == env_name => true,
            // Active environment is listed as "* name" by some versions
            Some("*") => fields.next() == Some(env_name),
            _ => false,
        }
    })
}
