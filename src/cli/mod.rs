//! Command-line interface for mediaflow.
//!
//! Provides commands for running pipelines, listing the modules and steps
//! a pipeline file defines, and inspecting stored run reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config;
use crate::core::{PipelineConfig, PipelineEngine, RunLog};
use crate::domain::{Category, PipelineRunReport, RunState, StepReport};

/// mediaflow - Batch media-processing pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "mediaflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline over an input directory
    Run {
        /// Pipeline file (defaults to configs/default_pipeline.yaml)
        pipeline: Option<PathBuf>,

        /// Input directory (defaults to data/input)
        input: Option<PathBuf>,

        /// Directory for run logs (overrides the configured one)
        #[arg(long, env = "MEDIAFLOW_LOG_DIR")]
        log_dir: Option<PathBuf>,

        /// Do not write a run log
        #[arg(long)]
        no_log: bool,
    },

    /// List the modules a pipeline registers
    Modules {
        /// Pipeline file (defaults to configs/default_pipeline.yaml)
        pipeline: Option<PathBuf>,
    },

    /// List the steps of a pipeline in execution order
    Steps {
        /// Pipeline file (defaults to configs/default_pipeline.yaml)
        pipeline: Option<PathBuf>,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the report of a stored run
    Report {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline,
                input,
                log_dir,
                no_log,
            } => run_pipeline(pipeline, input, log_dir, no_log).await,
            Commands::Modules { pipeline } => list_modules(pipeline),
            Commands::Steps { pipeline } => list_steps(pipeline),
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Report { run_id } => show_report(&run_id).await,
            Commands::Config => show_config(),
        }
    }
}

/// Load a pipeline file, falling back to the configured default
fn load_pipeline(path: Option<PathBuf>) -> Result<PipelineConfig> {
    let path = match path {
        Some(path) => path,
        None => config::config()?.default_pipeline.clone(),
    };

    let loaded = PipelineConfig::from_file(&path)?;
    for issue in &loaded.issues {
        eprintln!("warning: {}", issue);
    }
    Ok(loaded.config)
}

/// Run a pipeline and print its report
async fn run_pipeline(
    pipeline: Option<PathBuf>,
    input: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    no_log: bool,
) -> Result<()> {
    let pipeline = load_pipeline(pipeline)?;
    let input = match input {
        Some(input) => input,
        None => config::config()?.default_input.clone(),
    };

    let mut engine = PipelineEngine::new(pipeline)?;
    if !no_log {
        let dir = match log_dir {
            Some(dir) => dir,
            None => config::log_dir()?,
        };
        engine = engine.with_run_log(dir);
    }

    let report = engine
        .run(&input)
        .await
        .with_context(|| format!("Pipeline failed on {}", input.display()))?;

    print_report(&report);

    match report.state {
        RunState::Completed if report.error_count() == 0 => {
            eprintln!("\n[Run {} completed successfully]", report.run_id);
        }
        RunState::Completed => {
            eprintln!(
                "\n[Run {} completed with {} error(s)]",
                report.run_id,
                report.error_count()
            );
        }
        RunState::Halted => {
            eprintln!("\n[Run {} halted on error]", report.run_id);
            std::process::exit(1);
        }
        _ => {
            eprintln!("\n[Run {} in state: {:?}]", report.run_id, report.state);
        }
    }

    Ok(())
}

/// List registered modules
fn list_modules(pipeline: Option<PathBuf>) -> Result<()> {
    let pipeline = load_pipeline(pipeline)?;
    let engine = PipelineEngine::new(pipeline)?;
    let modules = engine.list_modules();

    if modules.is_empty() {
        println!("No modules registered");
        return Ok(());
    }

    println!("{:<20} {:<10} {:<40} {}", "MODULE", "KIND", "TARGET", "ENVIRONMENT");
    println!("{}", "-".repeat(90));
    for module in modules {
        let environment = module
            .environment
            .as_ref()
            .map(|e| e.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<10} {:<40} {}",
            module.name,
            module.kind.to_string(),
            module.target,
            environment
        );
    }

    Ok(())
}

/// List pipeline steps in order
fn list_steps(pipeline: Option<PathBuf>) -> Result<()> {
    let pipeline = load_pipeline(pipeline)?;
    let engine = PipelineEngine::new(pipeline)?;

    if engine.list_steps().is_empty() {
        println!("No steps defined");
        return Ok(());
    }

    for (i, step) in engine.list_steps().iter().enumerate() {
        let bridge = match &step.bridge {
            Some(policy) if !policy.skip_categories.is_empty() => {
                let skipped: Vec<&str> = policy.skip_categories.iter().map(Category::as_str).collect();
                format!(" (bridge {} by {})", skipped.join(","), policy.action)
            }
            _ => String::new(),
        };
        let output = engine
            .config()
            .output_dir_for(step)
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(no output, skipped)".to_string());

        println!("  {}. {} -> module: {}{} -> {}", i + 1, step.name, step.module, bridge, output);
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let log_dir = config::log_dir()?;
    let mut reports = Vec::new();
    for run_id in RunLog::list_runs(&log_dir).await? {
        if let Some(report) = RunLog::load_report(&log_dir, run_id).await? {
            reports.push(report);
        }
    }

    if reports.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    println!("{:<38} {:<25} {:<10} {:<6}", "RUN ID", "PIPELINE", "STATE", "ERRORS");
    println!("{}", "-".repeat(82));
    for report in reports.iter().take(limit) {
        println!(
            "{:<38} {:<25} {:<10} {:<6}",
            report.run_id,
            report.pipeline_name,
            state_label(report.state),
            report.error_count()
        );
    }

    Ok(())
}

/// Show a stored run report
async fn show_report(run_id_str: &str) -> Result<()> {
    let run_id =
        Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let log_dir = config::log_dir()?;
    let report = RunLog::load_report(&log_dir, run_id)
        .await?
        .with_context(|| format!("No run found with ID {} in {}", run_id, log_dir.display()))?;

    print_report(&report);
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("mediaflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Run logs:            {}", cfg.log_dir.display());
    println!("  Default pipeline:    {}", cfg.default_pipeline.display());
    println!("  Default input:       {}", cfg.default_input.display());

    Ok(())
}

fn state_label(state: RunState) -> &'static str {
    match state {
        RunState::Idle => "idle",
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Halted => "halted",
    }
}

fn format_counts(counts: &BTreeMap<Category, usize>) -> String {
    Category::ALL
        .iter()
        .map(|c| format!("{}={}", c, counts.get(c).copied().unwrap_or(0)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_step(index: usize, step: &StepReport) {
    println!("[{}] {}", index, step.step_name);
    println!("    input:  {} ({})", step.input_dir.display(), format_counts(&step.input_counts));
    println!("    output: {} ({})", step.output_dir.display(), format_counts(&step.output_counts));

    if !step.processed_categories.is_empty() {
        let processed: Vec<&str> = step.processed_categories.iter().map(Category::as_str).collect();
        println!(
            "    processed: {} file(s) [{}]",
            step.processed_count,
            processed.join(", ")
        );
    }
    for bridged in &step.bridged {
        if bridged.skipped > 0 {
            println!(
                "    bridged: {} x{} ({}, {} skipped)",
                bridged.category, bridged.count, bridged.action, bridged.skipped
            );
        } else {
            println!(
                "    bridged: {} x{} ({})",
                bridged.category, bridged.count, bridged.action
            );
        }
    }
    for error in &step.errors {
        let scope = error
            .category
            .map(|c| c.to_string())
            .unwrap_or_else(|| "step".to_string());
        println!("    error [{}/{:?}]: {}", scope, error.stage, error.message);
    }
    println!("    took {}ms", step.duration_ms);
}

fn print_report(report: &PipelineRunReport) {
    println!("Run ID:   {}", report.run_id);
    println!("Pipeline: {}", report.pipeline_name);
    println!("Input:    {}", display_or_dash(&report.input_dir));
    println!("State:    {}", state_label(report.state));
    if let Some(started) = report.started_at {
        println!("Started:  {}", started);
    }
    if let Some(completed) = report.completed_at {
        println!("Finished: {}", completed);
    }
    println!();

    for (i, step) in report.steps.iter().enumerate() {
        print_step(i + 1, step);
    }
}

fn display_or_dash(path: &Path) -> String {
    if path.as_os_str().is_empty() {
        "-".to_string()
    } else {
        path.display().to_string()
    }
}
