//! Run Timeline
//!
//! Records when each step of a run starts and how it ends, for the run
//! report and the CLI summary chart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    /// Step ended without publishing (recoverable exit or best-effort failure)
    Skipped,
    Failed,
}

impl EventType {
    fn is_terminal(&self) -> bool {
        !matches!(self, EventType::Started)
    }

    fn marker(&self) -> char {
        match self {
            EventType::Started => '>',
            EventType::Completed => '#',
            EventType::Skipped => '~',
            EventType::Failed => '!',
        }
    }
}

/// A single event in the run timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Ordered step events of one run.
#[derive(Debug, Clone)]
pub struct RunTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl RunTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step: step.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Time since the timeline was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// How a step ended, if it has.
    pub fn outcome(&self, step: &str) -> Option<EventType> {
        self.events
            .iter()
            .rev()
            .find(|e| e.step == step && e.event_type.is_terminal())
            .map(|e| e.event_type)
    }

    /// Step durations in milliseconds, for steps that have ended.
    pub fn durations(&self) -> HashMap<String, u128> {
        let mut starts: HashMap<&str, Instant> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            if event.event_type.is_terminal() {
                if let Some(start) = starts.get(event.step.as_str()) {
                    durations.insert(
                        event.step.clone(),
                        event.timestamp.duration_since(*start).as_millis(),
                    );
                }
            } else {
                starts.insert(&event.step, event.timestamp);
            }
        }

        durations
    }

    /// ASCII chart with one bar per step, scaled to the run's duration.
    ///
    /// Bars use `#` for completed, `~` for skipped and `!` for failed steps.
    pub fn chart(&self) -> String {
        let mut output = String::from("\nRun Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // 50 columns wide
        let scale = 50.0 / total_time as f64;

        let mut rows: Vec<(String, u128, u128, EventType)> = Vec::new();
        let mut open: HashMap<&str, u128> = HashMap::new();

        for event in &self.events {
            let at = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type.is_terminal() {
                if let Some(start) = open.remove(event.step.as_str()) {
                    rows.push((event.step.clone(), start, at, event.event_type));
                }
            } else {
                open.insert(&event.step, at);
            }
        }

        rows.sort_by_key(|(_, start, _, _)| *start);

        for (step, start, end, event_type) in rows {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.extend(std::iter::repeat(event_type.marker()).take(width));

            output.push_str(&format!(
                "{:16} |{:50}| ({} ms)\n",
                truncate(&step, 16),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for RunTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a string to `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = RunTimeline::new();
        assert!(timeline.events().is_empty());
    }

    #[test]
    fn test_durations() {
        let mut timeline = RunTimeline::new();
        timeline.add_event("download", EventType::Started);
        thread::sleep(Duration::from_millis(50));
        timeline.add_event("download", EventType::Completed);

        let durations = timeline.durations();
        assert!(*durations.get("download").unwrap() >= 50);
    }

    #[test]
    fn test_durations_skip_running_steps() {
        let mut timeline = RunTimeline::new();
        timeline.add_event("download", EventType::Started);

        assert!(timeline.durations().is_empty());
        assert_eq!(timeline.outcome("download"), None);
    }

    #[test]
    fn test_outcome() {
        let mut timeline = RunTimeline::new();
        timeline.add_event("data_check", EventType::Started);
        timeline.add_event("data_check", EventType::Skipped);
        timeline.add_event("data_split", EventType::Started);
        timeline.add_event("data_split", EventType::Failed);

        assert_eq!(timeline.outcome("data_check"), Some(EventType::Skipped));
        assert_eq!(timeline.outcome("data_split"), Some(EventType::Failed));
        assert_eq!(timeline.outcome("train"), None);
    }

    #[test]
    fn test_chart_generation() {
        let mut timeline = RunTimeline::new();

        timeline.add_event("download", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("download", EventType::Completed);

        timeline.add_event("basic_cleaning", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("basic_cleaning", EventType::Failed);

        let chart = timeline.chart();
        assert!(chart.contains("download"));
        assert!(chart.contains("basic_cleaning"));
        assert!(chart.contains('!'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc  ");
        assert_eq!(truncate("test_regression_model", 10), "test_re...");
    }
}
