//! Domain types for the mediaflow orchestrator.
//!
//! This module contains the core data structures:
//! - Category: File categories and classified sets
//! - Report: Step and run reports
//! - Events: Run log entries

pub mod category;
pub mod events;
pub mod report;

// Re-export commonly used types
pub use category::{Category, ClassifiedFileSet};
pub use events::{Event, EventType};
pub use report::{
    BridgedEntry, ErrorKind, ErrorStage, PipelineRunReport, RunState, StepError, StepReport,
    TransferAction,
};
