//! Pipeline engine.
//!
//! Runs the configured steps strictly in order. Each step classifies its
//! input directory afresh, bridges skipped categories straight into its
//! output directory, stages and dispatches the remaining categories to the
//! step's module, and finally re-scans the output directory, which becomes
//! the next step's input.
//!
//! Errors inside a step are attributed to the smallest unit possible (a
//! category) and collected in the step report. With `stop_on_error` the
//! first step that reports any error halts the run.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    Bridge, DispatchError, ExternalExecutor, HandlerCatalog, LocalExecutor, ModuleExecutor,
    ModuleRequest,
};
use crate::domain::{
    BridgedEntry, Category, ErrorKind, ErrorStage, Event, EventType, PipelineRunReport,
    StepReport, TransferAction,
};

use super::classifier::FileClassifier;
use super::pipeline::{PipelineConfig, PipelineStep};
use super::registry::{ModuleDescriptor, ModuleKind, ModuleRegistry};
use super::run_log::RunLog;
use super::transfer::{transfer_flat, transfer_to, TransferError};

/// Parameter bound when a step declares no input bindings
pub const DEFAULT_INPUT_PARAM: &str = "input_path";

/// Engine-provided values a step may bind module parameters to
pub const BINDING_KEYS: &[&str] = &[
    "input_dir",
    "category",
    "step_input_dir",
    "step_output_dir",
    "step_name",
];

/// Main pipeline engine
pub struct PipelineEngine {
    config: PipelineConfig,
    registry: ModuleRegistry,
    classifier: FileClassifier,
    local: LocalExecutor,
    external: ExternalExecutor,

    /// Where run logs are written (none when unset)
    run_log_dir: Option<PathBuf>,
}

impl PipelineEngine {
    /// Create an engine with the built-in local handlers
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_handlers(config, HandlerCatalog::builtin())
    }

    /// Create an engine with a custom handler catalog
    pub fn with_handlers(config: PipelineConfig, catalog: HandlerCatalog) -> Result<Self> {
        let classifier = FileClassifier::new(&config.image_extensions, &config.video_extensions)
            .with_follow_symlinks(config.follow_symlinks)
            .with_exclude_patterns(&config.exclude_patterns)?;

        let mut registry = ModuleRegistry::new();
        for (name, descriptor) in &config.modules {
            if descriptor.kind == ModuleKind::Local && !catalog.contains(&descriptor.target) {
                warn!(
                    module = %name,
                    handler = %descriptor.target,
                    available = ?catalog.targets(),
                    "Module targets an unknown local handler"
                );
            }
            registry.register(name.clone(), descriptor.clone());
        }

        let mut bridge = Bridge::new().with_spawn_retry(config.spawn_retry.clone());
        if let Some(dir) = &config.scratch_dir {
            bridge = bridge.with_scratch_dir(dir);
        }
        if let Some(conda) = &config.conda_binary {
            bridge = bridge.with_conda_binary(conda.clone().into_os_string());
        }

        Ok(Self {
            config,
            registry,
            classifier,
            local: LocalExecutor::new(catalog),
            external: ExternalExecutor::new(bridge),
            run_log_dir: None,
        })
    }

    /// Write an event log and final report per run under `dir`
    pub fn with_run_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_log_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Registered modules sorted by name
    pub fn list_modules(&self) -> Vec<&ModuleDescriptor> {
        self.registry.modules()
    }

    /// Steps in execution order
    pub fn list_steps(&self) -> &[PipelineStep] {
        &self.config.steps
    }

    /// Run every step over `input_dir`
    #[instrument(skip(self, input_dir), fields(pipeline = %self.config.pipeline_name))]
    pub async fn run(&self, input_dir: &Path) -> Result<PipelineRunReport> {
        if !input_dir.is_dir() {
            anyhow::bail!("Input directory does not exist: {}", input_dir.display());
        }

        let run_id = Uuid::new_v4();
        info!(%run_id, input = %input_dir.display(), "Starting pipeline execution");

        let log = match &self.run_log_dir {
            Some(dir) => Some(RunLog::open(dir, run_id).await?),
            None => None,
        };

        let mut report =
            PipelineRunReport::new(run_id, &self.config.pipeline_name, input_dir.to_path_buf());
        report.start();
        append(
            &log,
            Event::run_started(run_id, &self.config.pipeline_name, input_dir),
        )
        .await?;

        let mut current_input = input_dir.to_path_buf();

        for step in &self.config.steps {
            let Some(output_dir) = self.config.output_dir_for(step) else {
                warn!(step = %step.name, "Step has no output location, skipping");
                append(
                    &log,
                    Event::step(
                        run_id,
                        EventType::StepSkipped,
                        &step.name,
                        format!("Step '{}' skipped: no output location", step.name),
                    ),
                )
                .await?;
                continue;
            };

            append(
                &log,
                Event::step(
                    run_id,
                    EventType::StepStarted,
                    &step.name,
                    format!("Step '{}' started", step.name),
                ),
            )
            .await?;

            let step_report = self.run_step(step, &current_input, &output_dir).await;
            let failed = step_report.has_errors();

            let event = if failed {
                error!(
                    step = %step.name,
                    errors = step_report.errors.len(),
                    "Step finished with errors"
                );
                Event::step(
                    run_id,
                    EventType::StepFailed,
                    &step.name,
                    format!(
                        "Step '{}' finished with {} error(s)",
                        step.name,
                        step_report.errors.len()
                    ),
                )
                .with_error(
                    step_report
                        .errors
                        .iter()
                        .map(|e| e.message.as_str())
                        .collect::<Vec<_>>()
                        .join("; "),
                )
            } else {
                info!(
                    step = %step.name,
                    processed = step_report.processed_count,
                    bridged = step_report.bridged.len(),
                    duration_ms = step_report.duration_ms,
                    "Step completed"
                );
                Event::step(
                    run_id,
                    EventType::StepCompleted,
                    &step.name,
                    format!(
                        "Step '{}' completed in {}ms",
                        step.name, step_report.duration_ms
                    ),
                )
            };
            append(&log, event.with_report(step_report.clone())).await?;

            report.steps.push(step_report);
            current_input = output_dir;

            if failed && self.config.stop_on_error {
                warn!(step = %step.name, "Halting run (stop_on_error)");
                report.halt();
                append(
                    &log,
                    Event::run(
                        run_id,
                        EventType::RunHalted,
                        format!("Run halted at step '{}'", step.name),
                    ),
                )
                .await?;
                return finish(&log, report).await;
            }
        }

        report.complete();
        append(
            &log,
            Event::run(
                run_id,
                EventType::RunCompleted,
                format!(
                    "Pipeline '{}' completed with {} error(s)",
                    self.config.pipeline_name,
                    report.error_count()
                ),
            ),
        )
        .await?;

        info!(%run_id, steps = report.steps.len(), "Pipeline completed");
        finish(&log, report).await
    }

    /// Execute one step; every failure ends up in the returned report
    async fn run_step(&self, step: &PipelineStep, input_dir: &Path, output_dir: &Path) -> StepReport {
        let started = Instant::now();
        let mut report = StepReport::new(&step.name, input_dir.to_path_buf(), output_dir.to_path_buf());

        if let Err(e) = std::fs::create_dir_all(output_dir) {
            report.record_error(
                None,
                ErrorStage::Prepare,
                ErrorKind::Io,
                format!("Failed to create output directory {}: {}", output_dir.display(), e),
            );
            report.duration_ms = started.elapsed().as_millis() as u64;
            return report;
        }

        let files = match self.classifier.classify(input_dir) {
            Ok(files) => files,
            Err(e) => {
                report.record_error(None, ErrorStage::Prepare, ErrorKind::Io, format!("{:#}", e));
                report.duration_ms = started.elapsed().as_millis() as u64;
                return report;
            }
        };
        report.input_counts = files.counts();
        debug!(step = %step.name, counts = ?report.input_counts, "Classified step input");

        for (category, paths) in files.iter() {
            if paths.is_empty() {
                continue;
            }

            if step.skips(category) {
                self.bridge_category(step, category, paths, output_dir, &mut report);
                continue;
            }

            let staging_dir = output_dir.join(category.as_str());
            // The working copy always reflects the current input
            let staged = staging_placements(paths, input_dir, &staging_dir, category)
                .and_then(|placements| transfer_to(&placements, TransferAction::Copy, true));
            if let Err(e) = staged {
                report.record_error(
                    Some(category),
                    ErrorStage::Stage,
                    ErrorKind::Transfer,
                    e.to_string(),
                );
                continue;
            }

            match self
                .dispatch(step, category, &staging_dir, input_dir, output_dir)
                .await
            {
                Ok(details) => {
                    report.processed_categories.push(category);
                    report.processed_count += paths.len();
                    report.module_details.insert(category, details);
                }
                Err(e) => {
                    warn!(step = %step.name, %category, error = %e, "Module dispatch failed");
                    report.record_error(Some(category), e.stage(), e.kind(), e.to_string());
                }
            }
        }

        match self.classifier.classify(output_dir) {
            Ok(outputs) => report.output_counts = outputs.counts(),
            Err(e) => report.record_error(None, ErrorStage::Rescan, ErrorKind::Io, format!("{:#}", e)),
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Copy or move a skipped category straight into the step output
    fn bridge_category(
        &self,
        step: &PipelineStep,
        category: Category,
        paths: &[PathBuf],
        output_dir: &Path,
        report: &mut StepReport,
    ) {
        let action = step.bridge_action();
        let outcome = match transfer_flat(paths, output_dir, action, self.config.overwrite) {
            Ok(outcome) => outcome,
            Err(e) => {
                report.record_error(
                    Some(category),
                    ErrorStage::Bridge,
                    ErrorKind::Transfer,
                    e.to_string(),
                );
                return;
            }
        };

        let count = outcome.transferred();
        info!(
            step = %step.name,
            %category,
            count,
            skipped = outcome.skipped.len(),
            %action,
            "Bridged category"
        );
        report.bridged.push(BridgedEntry {
            category,
            count,
            action,
            skipped: outcome.skipped.len(),
        });

        if outcome.is_complete() {
            return;
        }
        let left = outcome
            .skipped
            .iter()
            .map(|s| format!("{} ({})", s.source.display(), s.reason))
            .collect::<Vec<_>>()
            .join(", ");
        match action {
            // A move that leaves files behind loses them from the pipeline
            TransferAction::Move => report.record_error(
                Some(category),
                ErrorStage::Bridge,
                ErrorKind::Transfer,
                format!(
                    "{} {} file(s) not moved, left in the input: {}",
                    outcome.skipped.len(),
                    category,
                    left
                ),
            ),
            TransferAction::Copy => {
                warn!(step = %step.name, %category, files = %left, "Bridged copies skipped")
            }
        }
    }

    /// Resolve the step's module and run it on one staged category
    async fn dispatch(
        &self,
        step: &PipelineStep,
        category: Category,
        staging_dir: &Path,
        input_dir: &Path,
        output_dir: &Path,
    ) -> Result<Value, DispatchError> {
        let module = self.registry.resolve(&step.module)?;
        let params = bind_inputs(step, category, staging_dir, input_dir, output_dir)?;
        let request = ModuleRequest::new(params);

        let executor: &dyn ModuleExecutor = match module.kind {
            ModuleKind::Local => &self.local,
            ModuleKind::External => &self.external,
        };
        debug!(
            step = %step.name,
            %category,
            module = %module.name,
            executor = executor.name(),
            "Dispatching category"
        );

        executor
            .execute(module, &request, step.timeout(&self.config.limits))
            .await
    }
}

/// Staging destinations for a category's files.
///
/// Files keep their path relative to the step input, except that a
/// leading directory named after the category is dropped: a previous
/// step's output already sorts processed files into `<category>/`, and
/// staging them under `<category>/<category>/` would nest one level
/// deeper on every step.
pub fn staging_placements(
    paths: &[PathBuf],
    input_dir: &Path,
    staging_dir: &Path,
    category: Category,
) -> Result<Vec<(PathBuf, PathBuf)>, TransferError> {
    paths
        .iter()
        .map(|source| {
            let relative = source
                .strip_prefix(input_dir)
                .map_err(|_| TransferError::OutsideRoot {
                    path: source.clone(),
                    root: input_dir.to_path_buf(),
                })?;

            let mut components = relative.components();
            let relative = match components.next() {
                Some(Component::Normal(first))
                    if first == category.as_str() && components.clone().next().is_some() =>
                {
                    components.as_path()
                }
                _ => relative,
            };
            Ok((source.clone(), staging_dir.join(relative)))
        })
        .collect()
}

/// Build module parameters from a step's input bindings
pub fn bind_inputs(
    step: &PipelineStep,
    category: Category,
    staging_dir: &Path,
    input_dir: &Path,
    output_dir: &Path,
) -> Result<Map<String, Value>, DispatchError> {
    let path_value = |path: &Path| Value::String(path.to_string_lossy().into_owned());

    let mut params = Map::new();
    if step.input_bindings.is_empty() {
        params.insert(DEFAULT_INPUT_PARAM.to_string(), path_value(staging_dir));
        return Ok(params);
    }

    for (param, key) in &step.input_bindings {
        let value = match key.as_str() {
            "input_dir" => path_value(staging_dir),
            "category" => Value::String(category.as_str().to_string()),
            "step_input_dir" => path_value(input_dir),
            "step_output_dir" => path_value(output_dir),
            "step_name" => Value::String(step.name.clone()),
            other => {
                return Err(DispatchError::Binding(format!(
                    "parameter '{}' is bound to unknown key '{}' (expected one of {:?})",
                    param, other, BINDING_KEYS
                )))
            }
        };
        params.insert(param.clone(), value);
    }

    Ok(params)
}

async fn append(log: &Option<RunLog>, event: Event) -> Result<()> {
    if let Some(log) = log {
        log.append(&event).await?;
    }
    Ok(())
}

async fn finish(log: &Option<RunLog>, report: PipelineRunReport) -> Result<PipelineRunReport> {
    if let Some(log) = log {
        let path = log
            .write_report(&report)
            .await
            .context("Failed to store run report")?;
        debug!(path = %path.display(), "Run report written");
    }
    Ok(report)
}
