//! Built Environment Registry
//!
//! Records which signature each isolated environment was built from, so a
//! later run can tell a reusable environment from a drifted one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunError};

/// File name of the registry inside the environment root.
pub const REGISTRY_FILE: &str = "env_registry.json";

/// Mapping of environment names to the signature they were built from.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EnvRegistry {
    map: HashMap<String, String>,
}

impl EnvRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the registry, treating a missing or corrupt file as empty.
    pub fn load(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::new();
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring unreadable environment registry {}: {}", path.display(), e);
            Self::new()
        })
    }

    /// Saves the registry to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RunError::io("failed to create registry directory", parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| RunError::json("environment registry", e))?;
        fs::write(path, json).map_err(|e| RunError::io("failed to write registry", path, e))
    }

    /// Signature the environment was last built from.
    pub fn get(&self, env_name: &str) -> Option<&String> {
        self.map.get(env_name)
    }

    pub fn set(&mut self, env_name: impl Into<String>, signature: impl Into<String>) {
        self.map.insert(env_name.into(), signature.into());
    }

    pub fn remove(&mut self, env_name: &str) {
        self.map.remove(env_name);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Default registry location under an environment root.
pub fn registry_path(env_root: &Path) -> PathBuf {
    env_root.join(REGISTRY_FILE)
}
