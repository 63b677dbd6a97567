//! Step Source Checkouts
//!
//! Steps declaring a `source` run from a git checkout instead of a
//! directory next to the pipeline file. Checkouts live under the run
//! workspace, so they disappear with it. Each repository and version pair
//! is cloned once per run and shared by every step that names it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

use crate::error::{Result, RunError};

/// Suffix of the marker written next to a finished checkout.
const CHECKOUT_MARKER: &str = ".complete";

/// Git binary, from `STAGERUNNER_GIT` or the system PATH.
pub static GIT_PATH: Lazy<PathBuf> = Lazy::new(|| match std::env::var_os("STAGERUNNER_GIT") {
    Some(path) => {
        let path = PathBuf::from(path);
        info!("Using git from STAGERUNNER_GIT: {}", path.display());
        path
    }
    None => PathBuf::from("git"),
});

/// Git checkouts of step sources below one directory.
#[derive(Debug, Clone)]
pub struct SourceCheckouts {
    root: PathBuf,
    git: PathBuf,
}

impl SourceCheckouts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git: GIT_PATH.clone(),
        }
    }

    pub fn with_git(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    /// Directory holding `repository` at `version`, cloned on first use.
    pub fn checkout(&self, repository: &str, version: &str) -> Result<PathBuf> {
        let key = checkout_key(repository, version);
        let dir = self.root.join(&key);
        let marker = self.root.join(format!("{}{}", key, CHECKOUT_MARKER));

        if marker.exists() && dir.is_dir() {
            debug!("Reusing checkout of {} at {}", repository, version);
            return Ok(dir);
        }
        if dir.exists() {
            // Interrupted clone
            fs::remove_dir_all(&dir)
                .map_err(|e| RunError::io("failed to clear partial checkout", &dir, e))?;
        }
        fs::create_dir_all(&self.root)
            .map_err(|e| RunError::io("failed to create checkout directory", &self.root, e))?;

        info!("Checking out {} at {}", repository, version);
        let mut clone = Command::new(&self.git);
        clone.arg("clone").arg("--quiet").arg(repository).arg(&dir);
        self.git_run(clone, repository, version)?;

        let mut checkout = Command::new(&self.git);
        checkout
            .arg("-C")
            .arg(&dir)
            .arg("checkout")
            .arg("--quiet")
            .arg(version);
        self.git_run(checkout, repository, version)?;

        fs::write(&marker, version)
            .map_err(|e| RunError::io("failed to write checkout marker", &marker, e))?;
        Ok(dir)
    }

    /// Step directory `path` inside the checkout of `repository` at `version`.
    pub fn step_dir(&self, repository: &str, version: &str, path: Option<&Path>) -> Result<PathBuf> {
        let checkout = self.checkout(repository, version)?;
        let dir = match path {
            Some(path) => checkout.join(path),
            None => checkout,
        };
        if !dir.is_dir() {
            return Err(RunError::SourceCheckout {
                repository: repository.to_string(),
                version: version.to_string(),
                reason: format!("'{}' is not a directory of the checkout", dir.display()),
            });
        }
        Ok(dir)
    }

    fn git_run(&self, mut cmd: Command, repository: &str, version: &str) -> Result<()> {
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        let output = cmd.output().map_err(|e| RunError::SourceCheckout {
            repository: repository.to_string(),
            version: version.to_string(),
            reason: format!("cannot run {}: {}", self.git.display(), e),
        })?;

        if !output.status.success() {
            return Err(RunError::SourceCheckout {
                repository: repository.to_string(),
                version: version.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Directory name for a checkout: repository hash plus a filesystem-safe version.
fn checkout_key(repository: &str, version: &str) -> String {
    let hash = format!("{:x}", Sha256::digest(repository.as_bytes()));
    let version: String = version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", &hash[..12], version)
}
