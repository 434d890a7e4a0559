//! mediaflow - Batch media-processing pipeline orchestrator
//!
//! Runs a configured, strictly linear sequence of steps over a directory
//! tree of image and video files. Each step is handled by a module that is
//! either compiled in (a local handler) or an external program running in
//! its own execution environment, reached through a file-based JSON bridge.
//!
//! # Modules
//!
//! - `adapters`: Module execution backends (local handlers, external bridge)
//! - `core`: Classification, transfer, registry, pipeline loading, engine
//! - `domain`: Data structures (Category, StepReport, PipelineRunReport, Event)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline over a directory
//! mediaflow run configs/clean.yaml data/input
//!
//! # Inspect what a pipeline file defines
//! mediaflow steps configs/clean.yaml
//!
//! # Show a stored run
//! mediaflow report <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{PipelineConfig, PipelineEngine};
pub use domain::{Category, PipelineRunReport, RunState, StepReport};
