//! In-process module handlers.
//!
//! Handlers are registered by target name in a [`HandlerCatalog`] at
//! startup. Each one declares its parameter contract, is constructed from
//! the merged module config plus bound parameters, and exposes a single
//! `process` call.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{DispatchError, ModuleExecutor, ModuleRequest};
use crate::core::registry::{ModuleDescriptor, ParamSchema, ParamType, RegistryError};

/// Result key listing supplied parameters the handler does not declare
pub const IGNORED_PARAMS_KEY: &str = "ignored_params";

/// An in-process processing unit
pub trait Handler: Send {
    /// Process the bound input and return a structured result
    fn process(&mut self) -> Result<Value>;
}

type Constructor = dyn Fn(&Map<String, Value>) -> Result<Box<dyn Handler>> + Send + Sync;

/// Parameter contract plus constructor for one handler type
#[derive(Clone)]
pub struct HandlerFactory {
    schema: ParamSchema,
    construct: Arc<Constructor>,
}

impl HandlerFactory {
    pub fn new<F>(schema: ParamSchema, construct: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Box<dyn Handler>> + Send + Sync + 'static,
    {
        Self {
            schema,
            construct: Arc::new(construct),
        }
    }

    pub fn schema(&self) -> &ParamSchema {
        &self.schema
    }

    /// Build a handler from already-validated parameters
    pub fn construct(&self, params: &Map<String, Value>) -> Result<Box<dyn Handler>> {
        (self.construct)(params)
    }
}

impl fmt::Debug for HandlerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFactory")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Handler factories keyed by target name
#[derive(Debug, Clone, Default)]
pub struct HandlerCatalog {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the handlers shipped in this crate
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(Passthrough::TARGET, Passthrough::factory());
        catalog.register(SizeFilter::TARGET, SizeFilter::factory());
        catalog
    }

    pub fn register(
        &mut self,
        target: impl Into<String>,
        factory: HandlerFactory,
    ) -> Option<HandlerFactory> {
        self.factories.insert(target.into(), factory)
    }

    pub fn get(&self, target: &str) -> Option<&HandlerFactory> {
        self.factories.get(target)
    }

    pub fn contains(&self, target: &str) -> bool {
        self.factories.contains_key(target)
    }

    /// Registered targets, sorted
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<_> = self.factories.keys().map(String::as_str).collect();
        targets.sort_unstable();
        targets
    }
}

fn path_param(params: &Map<String, Value>, name: &str) -> Result<PathBuf> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .with_context(|| format!("parameter '{}' must be a string path", name))
}

fn list_files(root: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let walker = if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to scan {}", root.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn display_paths(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect()
}

/// Lists its input without changing anything
#[derive(Debug)]
pub struct Passthrough {
    input_path: PathBuf,
    recursive: bool,
}

impl Passthrough {
    pub const TARGET: &'static str = "passthrough";

    pub fn schema() -> ParamSchema {
        ParamSchema::new()
            .required("input_path", &[ParamType::String])
            .optional("recursive", &[ParamType::Bool], json!(true))
    }

    pub fn factory() -> HandlerFactory {
        HandlerFactory::new(Self::schema(), |params| {
            let handler: Box<dyn Handler> = Box::new(Self {
                input_path: path_param(params, "input_path")?,
                recursive: params
                    .get("recursive")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
            });
            Ok(handler)
        })
    }
}

impl Handler for Passthrough {
    fn process(&mut self) -> Result<Value> {
        let files = list_files(&self.input_path, self.recursive)?;
        Ok(json!({
            "file_count": files.len(),
            "files": display_paths(&files),
        }))
    }
}

/// Deletes files whose size falls outside `[min_bytes, max_bytes]`
#[derive(Debug)]
pub struct SizeFilter {
    input_path: PathBuf,
    min_bytes: u64,
    max_bytes: Option<u64>,
}

impl SizeFilter {
    pub const TARGET: &'static str = "size_filter";

    pub fn schema() -> ParamSchema {
        ParamSchema::new()
            .required("input_path", &[ParamType::String])
            .optional("min_bytes", &[ParamType::Integer], json!(0))
            .optional("max_bytes", &[ParamType::Integer, ParamType::Null], Value::Null)
    }

    pub fn factory() -> HandlerFactory {
        HandlerFactory::new(Self::schema(), |params| {
            let min_bytes = match params.get("min_bytes") {
                None => 0,
                Some(v) => v.as_u64().context("min_bytes must be a non-negative integer")?,
            };
            let max_bytes = match params.get("max_bytes") {
                None | Some(Value::Null) => None,
                Some(v) => Some(v.as_u64().context("max_bytes must be a non-negative integer")?),
            };
            if max_bytes.is_some_and(|max| max < min_bytes) {
                anyhow::bail!("max_bytes ({:?}) is below min_bytes ({})", max_bytes, min_bytes);
            }

            let handler: Box<dyn Handler> = Box::new(Self {
                input_path: path_param(params, "input_path")?,
                min_bytes,
                max_bytes,
            });
            Ok(handler)
        })
    }

    fn keeps(&self, size: u64) -> bool {
        size >= self.min_bytes && self.max_bytes.map_or(true, |max| size <= max)
    }
}

impl Handler for SizeFilter {
    fn process(&mut self) -> Result<Value> {
        let mut kept = 0usize;
        let mut removed = Vec::new();

        for file in list_files(&self.input_path, true)? {
            let size = fs::metadata(&file)
                .with_context(|| format!("Failed to stat {}", file.display()))?
                .len();

            if self.keeps(size) {
                kept += 1;
                continue;
            }

            fs::remove_file(&file)
                .with_context(|| format!("Failed to remove {}", file.display()))?;
            debug!(path = %file.display(), size, "Removed by size filter");
            removed.push(file);
        }

        Ok(json!({
            "kept": kept,
            "removed": removed.len(),
            "removed_files": display_paths(&removed),
        }))
    }
}

/// Runs local modules from a handler catalog
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    catalog: HandlerCatalog,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(HandlerCatalog::builtin())
    }
}

impl LocalExecutor {
    pub fn new(catalog: HandlerCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &HandlerCatalog {
        &self.catalog
    }
}

#[async_trait]
impl ModuleExecutor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    /// Local handlers run to completion; the timeout only applies to
    /// external programs.
    async fn execute(
        &self,
        module: &ModuleDescriptor,
        request: &ModuleRequest,
        _timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let factory =
            self.catalog
                .get(&module.target)
                .ok_or_else(|| RegistryError::UnknownHandler {
                    module: module.name.clone(),
                    target: module.target.clone(),
                })?;

        let init_params = request.init_params(module);
        let validation = factory.schema().validate(&module.name, &init_params)?;
        let prepared = factory.schema().prepare(&init_params);

        let handler_failed = |message: String| DispatchError::Handler {
            handler: module.target.clone(),
            message,
        };

        let mut handler = factory
            .construct(&prepared)
            .map_err(|e| handler_failed(format!("construction failed: {:#}", e)))?;

        info!(module = %module.name, handler = %module.target, "Running local handler");
        let mut result = tokio::task::spawn_blocking(move || handler.process())
            .await
            .map_err(|e| handler_failed(format!("handler task panicked: {}", e)))?
            .map_err(|e| handler_failed(format!("{:#}", e)))?;

        if !validation.extra_params.is_empty() {
            if let Value::Object(details) = &mut result {
                details.insert(IGNORED_PARAMS_KEY.to_string(), json!(validation.extra_params));
            }
        }
        Ok(result)
    }
}
