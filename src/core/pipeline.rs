//! Pipeline definitions and loading.
//!
//! A pipeline file (YAML, or JSON when the extension is `.json`) names the
//! modules available to a run and the ordered steps that use them.
//! Loading is lenient: a malformed module or step is reported as a
//! [`ConfigurationError`] and skipped; only an unreadable or unparseable
//! file fails the load.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::classifier::{normalize_extension, DEFAULT_IMAGE_EXTENSIONS, DEFAULT_VIDEO_EXTENSIONS};
use super::registry::{ModuleDescriptor, ModuleKind};
use crate::domain::{Category, TransferAction};

/// Load-time configuration problems. None of these abort loading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Module '{name}' is invalid: {reason}")]
    InvalidModule { name: String, reason: String },

    #[error("Step #{index} is invalid: {reason}")]
    InvalidStep { index: usize, reason: String },

    #[error("Step '{0}' is defined more than once; later definition ignored")]
    DuplicateStep(String),

    #[error("Step '{step}' references unregistered module '{module}'")]
    UnknownModule { step: String, module: String },
}

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_name")]
    pub pipeline_name: String,

    /// Halt the run at the first step that reports an error
    #[serde(default = "default_true")]
    pub stop_on_error: bool,

    /// Replace existing destination files when bridging
    #[serde(default)]
    pub overwrite: bool,

    /// Parent of per-step output directories (`<output_root>/<step name>`)
    #[serde(default)]
    pub output_root: Option<PathBuf>,

    #[serde(default = "default_image_extensions", alias = "supported_image_formats")]
    pub image_extensions: Vec<String>,

    #[serde(default = "default_video_extensions", alias = "supported_video_formats")]
    pub video_extensions: Vec<String>,

    /// Follow symbolic links while classifying
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Glob patterns (relative to the scanned root) excluded from classification
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    #[serde(default)]
    pub limits: ExecutionLimits,

    /// Retry policy for external modules that fail to start
    #[serde(default)]
    pub spawn_retry: RetryPolicy,

    /// Directory for bridge request/response files (system temp when unset)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Launcher for managed environments (`CONDA_EXE`, then `conda` on PATH, when unset)
    #[serde(default)]
    pub conda_binary: Option<PathBuf>,

    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDescriptor>,

    /// Ordered list of steps to execute
    #[serde(default, rename = "pipeline_steps", alias = "steps")]
    pub steps: Vec<PipelineStep>,
}

fn default_pipeline_name() -> String {
    "data process pipeline".to_string()
}
fn default_true() -> bool {
    true
}
fn default_image_extensions() -> Vec<String> {
    DEFAULT_IMAGE_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}
fn default_video_extensions() -> Vec<String> {
    DEFAULT_VIDEO_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_name: default_pipeline_name(),
            stop_on_error: true,
            overwrite: false,
            output_root: None,
            image_extensions: default_image_extensions(),
            video_extensions: default_video_extensions(),
            follow_symlinks: false,
            exclude_patterns: Vec::new(),
            limits: ExecutionLimits::default(),
            spawn_retry: RetryPolicy::default(),
            scratch_dir: None,
            conda_binary: None,
            modules: BTreeMap::new(),
            steps: Vec::new(),
        }
    }
}

/// Raw file shape: typed settings, untyped modules and steps.
///
/// Only modules and steps load leniently. A top-level setting of the
/// wrong type (`stop_on_error: "yes"`) fails the whole load.
#[derive(Debug, Deserialize)]
struct RawPipeline {
    #[serde(default)]
    modules: serde_json::Map<String, Value>,

    #[serde(default, rename = "pipeline_steps", alias = "steps")]
    steps: Vec<Value>,

    /// Everything else; modules and steps are consumed above
    #[serde(flatten)]
    settings: PipelineConfig,
}

/// A loaded pipeline plus every problem found while loading it
#[derive(Debug, Clone)]
pub struct LoadedPipeline {
    pub config: PipelineConfig,
    pub issues: Vec<ConfigurationError>,
}

impl PipelineConfig {
    /// Load a pipeline file. Relative paths resolve against its directory.
    pub fn from_file(path: &Path) -> Result<LoadedPipeline> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let loaded = if is_json {
            Self::from_json(&content, base_dir)
        } else {
            Self::from_yaml(&content, base_dir)
        };
        loaded.with_context(|| format!("Failed to load pipeline file: {}", path.display()))
    }

    /// Parse a pipeline from YAML content.
    ///
    /// Invalid modules and steps become [`LoadedPipeline::issues`]; a
    /// malformed top-level setting is an error.
    pub fn from_yaml(content: &str, base_dir: &Path) -> Result<LoadedPipeline> {
        let raw: RawPipeline =
            serde_yaml::from_str(content).context("Failed to parse pipeline YAML")?;
        Ok(Self::from_raw(raw, base_dir))
    }

    /// Parse a pipeline from JSON content
    pub fn from_json(content: &str, base_dir: &Path) -> Result<LoadedPipeline> {
        let raw: RawPipeline =
            serde_json::from_str(content).context("Failed to parse pipeline JSON")?;
        Ok(Self::from_raw(raw, base_dir))
    }

    fn from_raw(raw: RawPipeline, base_dir: &Path) -> LoadedPipeline {
        let settings = raw.settings;
        let mut issues = Vec::new();

        let mut modules = BTreeMap::new();
        for (name, value) in raw.modules {
            match serde_json::from_value::<ModuleDescriptor>(value) {
                Ok(mut descriptor) => {
                    descriptor.name = name.clone();
                    if descriptor.kind == ModuleKind::External {
                        descriptor.target = resolve(base_dir, Path::new(&descriptor.target))
                            .to_string_lossy()
                            .into_owned();
                    }
                    descriptor.environment =
                        descriptor.environment.map(|env| resolve(base_dir, &env));
                    modules.insert(name, descriptor);
                }
                Err(e) => issues.push(ConfigurationError::InvalidModule {
                    name,
                    reason: e.to_string(),
                }),
            }
        }

        let mut steps: Vec<PipelineStep> = Vec::new();
        let mut seen = HashSet::new();
        for (index, value) in raw.steps.into_iter().enumerate() {
            let mut step = match serde_json::from_value::<PipelineStep>(value) {
                Ok(step) => step,
                Err(e) => {
                    issues.push(ConfigurationError::InvalidStep {
                        index,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if step.name.is_empty() || step.module.is_empty() {
                issues.push(ConfigurationError::InvalidStep {
                    index,
                    reason: "step name and module must not be empty".to_string(),
                });
                continue;
            }
            if !seen.insert(step.name.clone()) {
                issues.push(ConfigurationError::DuplicateStep(step.name));
                continue;
            }
            if !modules.contains_key(&step.module) {
                // Dangling references stay; dispatch reports them per category
                issues.push(ConfigurationError::UnknownModule {
                    step: step.name.clone(),
                    module: step.module.clone(),
                });
            }

            step.output_dir = step.output_dir.map(|dir| resolve(base_dir, &dir));
            steps.push(step);
        }

        for issue in &issues {
            warn!(issue = %issue, "Pipeline configuration problem");
        }

        let config = PipelineConfig {
            output_root: settings.output_root.map(|dir| resolve(base_dir, &dir)),
            image_extensions: normalize_all(&settings.image_extensions),
            video_extensions: normalize_all(&settings.video_extensions),
            scratch_dir: settings.scratch_dir.map(|dir| resolve(base_dir, &dir)),
            // A bare program name is looked up on PATH
            conda_binary: settings.conda_binary.map(|binary| {
                if binary.components().count() > 1 {
                    resolve(base_dir, &binary)
                } else {
                    binary
                }
            }),
            modules,
            steps,
            ..settings
        };

        LoadedPipeline { config, issues }
    }

    /// Where a step writes its output, if anywhere
    pub fn output_dir_for(&self, step: &PipelineStep) -> Option<PathBuf> {
        step.output_dir
            .clone()
            .or_else(|| self.output_root.as_ref().map(|root| root.join(&step.name)))
    }

}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn normalize_all(extensions: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = extensions.iter().map(|e| normalize_extension(e)).collect();
    normalized.dedup();
    normalized
}

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Step name (unique within pipeline)
    #[serde(alias = "step_name")]
    pub name: String,

    /// Registered module that processes this step
    #[serde(alias = "module_name")]
    pub module: String,

    /// Module parameter name -> engine-provided key
    #[serde(default, alias = "input_params")]
    pub input_bindings: BTreeMap<String, String>,

    /// Categories passed through without running the module
    #[serde(default, alias = "bridge_policy")]
    pub bridge: Option<BridgePolicy>,

    /// Destination directory (defaults to `<output_root>/<name>`)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Override the pipeline's external module timeout
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl PipelineStep {
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            input_bindings: BTreeMap::new(),
            bridge: None,
            output_dir: None,
            timeout_seconds: None,
        }
    }

    pub fn with_binding(mut self, param: impl Into<String>, key: impl Into<String>) -> Self {
        self.input_bindings.insert(param.into(), key.into());
        self
    }

    pub fn with_bridge(mut self, policy: BridgePolicy) -> Self {
        self.bridge = Some(policy);
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Get the effective external timeout for this step
    pub fn timeout(&self, limits: &ExecutionLimits) -> Duration {
        let seconds = self.timeout_seconds.unwrap_or(limits.step_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Whether files of `category` bypass the module
    pub fn skips(&self, category: Category) -> bool {
        self.bridge
            .as_ref()
            .is_some_and(|b| b.skip_categories.contains(&category))
    }

    pub fn bridge_action(&self) -> TransferAction {
        self.bridge.as_ref().map(|b| b.action).unwrap_or_default()
    }
}

/// Which categories bypass a step, and how they are carried over
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgePolicy {
    #[serde(default, alias = "skip_types")]
    pub skip_categories: BTreeSet<Category>,

    #[serde(default)]
    pub action: TransferAction,
}

impl BridgePolicy {
    pub fn new(skip: impl IntoIterator<Item = Category>, action: TransferAction) -> Self {
        Self {
            skip_categories: skip.into_iter().collect(),
            action,
        }
    }
}

/// Execution limits for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Per-step external module timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,
}

fn default_step_timeout() -> u64 {
    300
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout(),
        }
    }
}

/// Retry policy for external modules that fail to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    10000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PIPELINE_YAML: &str = r#"
pipeline_name: test
stop_on_error: false
output_root: out
image_extensions: [".JPG", "png"]

modules:
  frames:
    kind: external
    target: scripts/frames.py
    environment: envs/video
  listing:
    kind: local
    target: passthrough

pipeline_steps:
  - name: extract
    module: frames
    bridge:
      skip_categories: [image]
      action: move
  - name: list
    module: listing
    timeout_seconds: 30
"#;

    #[test]
    fn test_pipeline_parsing() {
        let loaded = PipelineConfig::from_yaml(TEST_PIPELINE_YAML, Path::new("/srv/flow")).unwrap();
        let config = loaded.config;

        assert!(loaded.issues.is_empty());
        assert_eq!(config.pipeline_name, "test");
        assert!(!config.stop_on_error);
        assert_eq!(config.image_extensions, vec![".jpg", ".png"]);
        assert_eq!(config.video_extensions.len(), 4);
        assert_eq!(config.steps.len(), 2);

        let frames = &config.modules["frames"];
        assert_eq!(frames.name, "frames");
        assert_eq!(frames.target, "/srv/flow/scripts/frames.py");
        assert_eq!(frames.environment, Some(PathBuf::from("/srv/flow/envs/video")));
        assert_eq!(config.modules["listing"].target, "passthrough");

        let extract = &config.steps[0];
        assert!(extract.skips(Category::Image));
        assert!(!extract.skips(Category::Video));
        assert_eq!(extract.bridge_action(), TransferAction::Move);
        assert_eq!(
            config.output_dir_for(extract),
            Some(PathBuf::from("/srv/flow/out/extract"))
        );
    }

    #[test]
    fn test_defaults() {
        let loaded = PipelineConfig::from_yaml("{}", Path::new("")).unwrap();
        let config = loaded.config;

        assert_eq!(config.pipeline_name, "data process pipeline");
        assert!(config.stop_on_error);
        assert!(!config.overwrite);
        assert_eq!(config.limits.step_timeout_seconds, 300);
        assert_eq!(config.spawn_retry.max_attempts, 1);
        assert!(config.steps.is_empty());
    }

    #[test]
    fn test_legacy_json_keys() {
        let json = r#"{
            "pipeline_name": "legacy",
            "supported_video_formats": [".mp4"],
            "modules": {
                "dur": {"type": "external", "path": "/opt/dur.py", "venv_path": "/envs/v"}
            },
            "pipeline_steps": [
                {"step_name": "filter", "module_name": "dur", "input_params": {"video_dir": "input_dir"}}
            ]
        }"#;

        let loaded = PipelineConfig::from_json(json, Path::new("/cfg")).unwrap();
        let config = loaded.config;

        assert_eq!(config.video_extensions, vec![".mp4"]);
        assert_eq!(config.modules["dur"].target, "/opt/dur.py");
        assert_eq!(config.steps[0].name, "filter");
        assert_eq!(config.steps[0].input_bindings["video_dir"], "input_dir");
    }

    #[test]
    fn test_lenient_loading_collects_issues() {
        let yaml = r#"
modules:
  good:
    kind: local
    target: passthrough
  broken:
    kind: teleport
    target: x
pipeline_steps:
  - name: a
    module: good
  - module: good
  - name: a
    module: good
  - name: b
    module: ghost
"#;
        let loaded = PipelineConfig::from_yaml(yaml, Path::new("")).unwrap();

        assert_eq!(loaded.config.modules.len(), 1);
        let names: Vec<_> = loaded.config.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert_eq!(loaded.issues.len(), 4);
        assert!(loaded
            .issues
            .iter()
            .any(|i| matches!(i, ConfigurationError::InvalidModule { name, .. } if name == "broken")));
        assert!(loaded
            .issues
            .iter()
            .any(|i| matches!(i, ConfigurationError::InvalidStep { index: 1, .. })));
        assert!(loaded.issues.contains(&ConfigurationError::DuplicateStep("a".into())));
        assert!(loaded.issues.contains(&ConfigurationError::UnknownModule {
            step: "b".into(),
            module: "ghost".into(),
        }));
    }

    #[test]
    fn test_unparseable_file_fails() {
        assert!(PipelineConfig::from_yaml("pipeline_steps: [unclosed", Path::new("")).is_err());
    }

    #[test]
    fn test_step_timeout_override() {
        let limits = ExecutionLimits::default();
        let step = PipelineStep::new("s", "m");
        assert_eq!(step.timeout(&limits), Duration::from_secs(300));
        assert_eq!(
            step.with_timeout_seconds(5).timeout(&limits),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_no_output_location() {
        let config = PipelineConfig::default();
        let step = PipelineStep::new("s", "m");
        assert_eq!(config.output_dir_for(&step), None);
        assert_eq!(
            config.output_dir_for(&step.with_output_dir("/tmp/x")),
            Some(PathBuf::from("/tmp/x"))
        );
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_mistyped_setting_fails_load() {
        let yaml = r#"
stop_on_error: "yes"
pipeline_steps:
  - name: s1
    module: m
"#;
        assert!(PipelineConfig::from_yaml(yaml, Path::new("/p")).is_err());

        // The same mistake inside a step is only an issue
        let yaml = r#"
modules:
  m:
    kind: local
    target: passthrough
pipeline_steps:
  - name: s1
    module: m
    timeout_seconds: soon
"#;
        let loaded = PipelineConfig::from_yaml(yaml, Path::new("/p")).unwrap();
        assert_eq!(loaded.issues.len(), 1);
        assert!(loaded.config.steps.is_empty());
    }

    #[test]
    fn test_conda_binary_resolution() {
        let loaded =
            PipelineConfig::from_yaml("conda_binary: tools/conda\n", Path::new("/p")).unwrap();
        assert_eq!(
            loaded.config.conda_binary,
            Some(PathBuf::from("/p/tools/conda"))
        );

        let loaded =
            PipelineConfig::from_yaml("conda_binary: micromamba\n", Path::new("/p")).unwrap();
        assert_eq!(loaded.config.conda_binary, Some(PathBuf::from("micromamba")));

        let loaded = PipelineConfig::from_yaml("{}", Path::new("/p")).unwrap();
        assert_eq!(loaded.config.conda_binary, None);
    }
}
