//! Step Selection
//!
//! Picks the active subset of a pipeline. Selection never reorders steps:
//! the active list always follows the declared order, with unselected
//! steps simply left out.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RunError};

use super::model::{Pipeline, StepDefinition};

/// Sentinel selecting every step.
pub const ALL_STEPS: &str = "all";

/// Which steps of a pipeline a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StepSelector {
    #[default]
    All,
    /// Explicit names; order is irrelevant
    Named(BTreeSet<String>),
}

impl StepSelector {
    /// Parses `all` or a comma-separated list of step names.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(ALL_STEPS) {
            return Ok(StepSelector::All);
        }

        let names: BTreeSet<String> = text
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if names.is_empty() {
            return Err(RunError::InvalidPipeline(
                "step selector names no steps".to_string(),
            ));
        }
        Ok(StepSelector::Named(names))
    }

    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StepSelector::Named(names.into_iter().map(Into::into).collect())
    }

    /// Resolves the selector against a pipeline.
    ///
    /// Every named step is checked before anything is returned, so an
    /// unknown name fails the whole selection.
    pub fn active_steps<'a>(&self, pipeline: &'a Pipeline) -> Result<Vec<&'a StepDefinition>> {
        match self {
            StepSelector::All => Ok(pipeline.steps.iter().collect()),
            StepSelector::Named(names) => {
                let unknown: Vec<&str> = names
                    .iter()
                    .filter(|n| !pipeline.contains(n))
                    .map(String::as_str)
                    .collect();

                if !unknown.is_empty() {
                    return Err(RunError::UnknownStep(unknown.join(", ")));
                }

                Ok(pipeline
                    .steps
                    .iter()
                    .filter(|s| names.contains(&s.name))
                    .collect())
            }
        }
    }
}

impl FromStr for StepSelector {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        StepSelector::parse(s)
    }
}

impl fmt::Display for StepSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepSelector::All => f.write_str(ALL_STEPS),
            StepSelector::Named(names) => {
                let list: Vec<&str> = names.iter().map(String::as_str).collect();
                f.write_str(&list.join(","))
            }
        }
    }
}
