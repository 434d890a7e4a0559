//! Step and run reports.
//!
//! A run report is the ordered list of step reports produced by one
//! execution of a pipeline. It can also be rebuilt from the run log.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::category::Category;
use super::events::{Event, EventType};

/// How files are transferred into a destination directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferAction {
    #[default]
    Copy,
    Move,
}

impl fmt::Display for TransferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferAction::Copy => f.write_str("copy"),
            TransferAction::Move => f.write_str("move"),
        }
    }
}

/// Where in a step an error happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    /// Preparing the step (output directory, classification)
    Prepare,
    /// Bridging a skipped category past the module
    Bridge,
    /// Copying a category into its working directory
    Stage,
    /// Resolving the module and its parameters
    Resolve,
    /// Checking local handler parameters
    Validate,
    /// Running the module
    Dispatch,
    /// Re-scanning the output directory
    Rescan,
}

/// Error taxonomy as it appears in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Validation,
    SpawnFailure,
    ExternalExecution,
    MalformedResponse,
    Timeout,
    Transfer,
    Handler,
    Io,
}

/// An error attributed to a category within a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Affected category (None when the whole step failed)
    pub category: Option<Category>,
    pub stage: ErrorStage,
    pub kind: ErrorKind,
    pub message: String,
}

/// A category that bypassed the step's module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgedEntry {
    pub category: Category,

    /// Files that reached the output directory
    pub count: usize,
    pub action: TransferAction,

    /// Files left in place by the overwrite policy
    #[serde(default)]
    pub skipped: usize,
}

/// Outcome of a single pipeline step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_name: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,

    /// Classification of the input directory
    pub input_counts: BTreeMap<Category, usize>,

    /// Categories dispatched to the module successfully
    pub processed_categories: Vec<Category>,

    /// Number of files in the processed categories
    pub processed_count: usize,

    pub bridged: Vec<BridgedEntry>,
    pub errors: Vec<StepError>,

    /// Module result per processed category
    pub module_details: BTreeMap<Category, serde_json::Value>,

    /// Classification of the output directory (input of the next step)
    pub output_counts: BTreeMap<Category, usize>,

    pub duration_ms: u64,
}

impl StepReport {
    pub fn new(step_name: impl Into<String>, input_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            step_name: step_name.into(),
            input_dir,
            output_dir,
            input_counts: BTreeMap::new(),
            processed_categories: Vec::new(),
            processed_count: 0,
            bridged: Vec::new(),
            errors: Vec::new(),
            module_details: BTreeMap::new(),
            output_counts: BTreeMap::new(),
            duration_ms: 0,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Record an error for a category (or the whole step)
    pub fn record_error(
        &mut self,
        category: Option<Category>,
        stage: ErrorStage,
        kind: ErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(StepError {
            category,
            stage,
            kind,
            message: message.into(),
        });
    }

    /// Errors attributed to one category
    pub fn errors_for(&self, category: Category) -> impl Iterator<Item = &StepError> {
        self.errors
            .iter()
            .filter(move |e| e.category == Some(category))
    }
}

/// Lifecycle of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Completed,
    /// Stopped early because a step failed and stop_on_error is set
    Halted,
}

/// Report of a whole pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunReport {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub input_dir: PathBuf,
    pub state: RunState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepReport>,
}

impl PipelineRunReport {
    pub fn new(run_id: Uuid, pipeline_name: impl Into<String>, input_dir: PathBuf) -> Self {
        Self {
            run_id,
            pipeline_name: pipeline_name.into(),
            input_dir,
            state: RunState::Idle,
            started_at: None,
            completed_at: None,
            steps: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.state = RunState::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn halt(&mut self) {
        self.state = RunState::Halted;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_halted(&self) -> bool {
        self.state == RunState::Halted
    }

    /// Total errors across all steps
    pub fn error_count(&self) -> usize {
        self.steps.iter().map(|s| s.errors.len()).sum()
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    /// Rebuild a run report from logged events.
    ///
    /// Used when a run died before its final report was written.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let mut report = Self::new(first.run_id, String::new(), PathBuf::new());

        for event in events {
            report.apply_event(event);
        }

        Some(report)
    }

    /// Apply a single event to the report
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = Some(event.timestamp);
                if let Some(name) = &event.pipeline_name {
                    self.pipeline_name = name.clone();
                }
                if let Some(dir) = &event.input_dir {
                    self.input_dir = dir.clone();
                }
            }
            EventType::StepCompleted | EventType::StepFailed => {
                if let Some(step) = &event.step_report {
                    self.steps.push(step.clone());
                }
            }
            EventType::StepStarted | EventType::StepSkipped => {}
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunHalted => {
                self.state = RunState::Halted;
                self.completed_at = Some(event.timestamp);
            }
        }
    }
}
