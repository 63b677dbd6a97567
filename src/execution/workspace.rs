//! Scratch Workspace
//!
//! Every run owns one temporary directory for fetched inputs, generated
//! scripts and step outboxes. The directory is removed when the
//! [`Workspace`] is dropped, whichever way the run ends. The process
//! working directory is never changed; steps get the workspace as their
//! own working directory instead.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tempfile::TempDir;

use crate::error::{Result, RunError};

const WORKSPACE_PREFIX: &str = "stagerunner-";
const STEPS_DIR: &str = "steps";

/// Exclusively owned scratch directory of one run.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    /// Creates a workspace under `root`, or the system temp dir.
    pub fn create(root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);

        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root)
                    .map_err(|e| RunError::io("failed to create workspace root", root, e))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| {
            let parent = root.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
            RunError::io("failed to create workspace", parent, e)
        })?;

        let path = dir.path().to_path_buf();
        debug!("Created workspace {}", path.display());

        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the private directory for one step invocation.
    ///
    /// The position keeps directories unique and ordered even when a step
    /// name would collide with another file system entry.
    pub fn invocation_dir(&self, position: usize, step: &str) -> Result<PathBuf> {
        let dir = self
            .path
            .join(STEPS_DIR)
            .join(format!("{:02}-{}", position + 1, step));
        fs::create_dir_all(&dir)
            .map_err(|e| RunError::io("failed to create invocation directory", &dir, e))?;
        Ok(dir)
    }

    /// Removes the workspace now, reporting failures instead of ignoring them.
    pub fn close(mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => {
                dir.close()
                    .map_err(|e| RunError::io("failed to remove workspace", &self.path, e))?;
                debug!("Removed workspace {}", self.path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove workspace {}: {}", self.path.display(), e);
            }
        }
    }
}
