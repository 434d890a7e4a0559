//! Run log events.
//!
//! Every run appends events to a JSONL log as it progresses, so a run
//! that dies halfway still leaves a readable trail.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::report::StepReport;

/// A single entry in a run's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Step name (if applicable)
    pub step_name: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub summary: String,

    /// Pipeline name (run started only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,

    /// Run input directory (run started only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_dir: Option<PathBuf>,

    /// Full step report (step completed / failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_report: Option<StepReport>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        step_name: Option<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step_name,
            event_type,
            summary: summary.into(),
            pipeline_name: None,
            input_dir: None,
            step_report: None,
            error: None,
        }
    }

    /// Run-level event
    pub fn run(run_id: Uuid, event_type: EventType, summary: impl Into<String>) -> Self {
        Self::new(run_id, None, event_type, summary)
    }

    /// Step-level event
    pub fn step(
        run_id: Uuid,
        event_type: EventType,
        step_name: &str,
        summary: impl Into<String>,
    ) -> Self {
        Self::new(run_id, Some(step_name.to_string()), event_type, summary)
    }

    pub fn run_started(run_id: Uuid, pipeline_name: &str, input_dir: &Path) -> Self {
        let mut event = Self::run(
            run_id,
            EventType::RunStarted,
            format!("Pipeline '{}' started on {}", pipeline_name, input_dir.display()),
        );
        event.pipeline_name = Some(pipeline_name.to_string());
        event.input_dir = Some(input_dir.to_path_buf());
        event
    }

    /// Attach a step report
    pub fn with_report(mut self, report: StepReport) -> Self {
        self.step_report = Some(report);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// All steps ran
    RunCompleted,

    /// A step failed with stop_on_error set
    RunHalted,

    /// A step has started execution
    StepStarted,

    /// A step finished without errors
    StepCompleted,

    /// A step finished with at least one error
    StepFailed,

    /// A step had no output location and was skipped
    StepSkipped,
}
