//! Monitoring Module
//!
//! Step timing for run reports.

pub mod timeline;

pub use timeline::{EventType, RunTimeline, TimelineEvent};
