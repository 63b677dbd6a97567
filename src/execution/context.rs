//! Run Grouping Context
//!
//! Identifiers shared by every step of one run so that tracking from all
//! steps correlates under one experiment. The context is handed to each
//! step invocation explicitly and never stored in process-wide state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ENV_RUN_ID: &str = "STAGERUNNER_RUN_ID";
pub const ENV_PROJECT: &str = "STAGERUNNER_PROJECT";
pub const ENV_GROUP: &str = "STAGERUNNER_GROUP";
pub const ENV_STEP: &str = "STAGERUNNER_STEP";

/// Read-only identifiers for the duration of one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunContext {
    pub run_id: Uuid,
    pub project: String,
    pub group: String,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    /// Creates a context, generating a timestamped group when none is given.
    pub fn new(project: impl Into<String>, group: Option<String>) -> Self {
        let started_at = Utc::now();
        let group = group
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| default_group(&started_at));

        Self {
            run_id: Uuid::new_v4(),
            project: project.into(),
            group,
            started_at,
        }
    }

    /// Environment variables identifying this run to a step process.
    pub fn step_env(&self, step: &str) -> Vec<(String, String)> {
        vec![
            (ENV_RUN_ID.to_string(), self.run_id.to_string()),
            (ENV_PROJECT.to_string(), self.project.clone()),
            (ENV_GROUP.to_string(), self.group.clone()),
            (ENV_STEP.to_string(), step.to_string()),
        ]
    }
}

fn default_group(started_at: &DateTime<Utc>) -> String {
    format!("run-{}", started_at.format("%Y%m%d-%H%M%S"))
}
