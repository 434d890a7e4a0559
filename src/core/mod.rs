//! Core orchestration logic.
//!
//! This module contains:
//! - FileClassifier: partitions a directory tree by media category
//! - Transfer: flat and structure-preserving batch copy/move
//! - ModuleRegistry: named modules and local handler parameter contracts
//! - Pipeline: pipeline definitions and lenient loading
//! - RunLog: append-only event log and stored reports
//! - PipelineEngine: main execution engine

pub mod classifier;
pub mod engine;
pub mod pipeline;
pub mod registry;
pub mod run_log;
pub mod transfer;

// Re-export commonly used types
pub use classifier::FileClassifier;
pub use engine::PipelineEngine;
pub use pipeline::{
    BridgePolicy, ConfigurationError, ExecutionLimits, LoadedPipeline, PipelineConfig,
    PipelineStep, RetryPolicy,
};
pub use registry::{
    ModuleDescriptor, ModuleKind, ModuleRegistry, ParamSchema, ParamType, RegistryError,
    ValidationError, ValidationReport,
};
pub use run_log::RunLog;
pub use transfer::{
    transfer_flat, transfer_preserving, transfer_to, SkipReason, SkippedFile, TransferError,
    TransferOutcome,
};
