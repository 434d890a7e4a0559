//! Application settings for mediaflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (MEDIAFLOW_HOME, MEDIAFLOW_LOG_DIR)
//! 2. Config file (.mediaflow/config.yaml)
//! 3. Defaults (~/.mediaflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .mediaflow/config.yaml
//! - `paths.home` is relative to the .mediaflow/ directory; other paths are
//!   relative to the project root (the parent of .mediaflow/)
//!
//! Pipeline definitions themselves live in separate pipeline files, see
//! [`crate::core::pipeline`].

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Pipeline file used when none is given on the command line
pub const DEFAULT_PIPELINE_FILE: &str = "configs/default_pipeline.yaml";

/// Input directory used when none is given on the command line
pub const DEFAULT_INPUT_DIR: &str = "data/input";

const HOME_ENV: &str = "MEDIAFLOW_HOME";
const LOG_DIR_ENV: &str = "MEDIAFLOW_LOG_DIR";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .mediaflow/)
    pub home: Option<String>,
    /// Run log directory (relative to project root)
    pub logs: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
    /// Pipeline file (relative to project root)
    pub pipeline: Option<String>,
    /// Input directory (relative to project root)
    pub input: Option<String>,
}

/// Resolved configuration with absolute paths where known
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// mediaflow home (engine state)
    pub home: PathBuf,
    /// Directory holding one subdirectory per run
    pub log_dir: PathBuf,
    /// Pipeline file used by `run` without arguments
    pub default_pipeline: PathBuf,
    /// Input directory used by `run` without arguments
    pub default_input: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Environment variable overrides
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var_os(HOME_ENV).map(PathBuf::from),
            log_dir: std::env::var_os(LOG_DIR_ENV).map(PathBuf::from),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".mediaflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine defaults, an optional config file and env overrides
fn resolve_config(
    default_home: PathBuf,
    config_file: Option<PathBuf>,
    env: EnvOverrides,
) -> Result<ResolvedConfig> {
    let (file, mediaflow_dir, base_dir) = match &config_file {
        Some(path) => {
            let file = load_config_file(path)?;
            let mediaflow_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let base_dir = mediaflow_dir
                .parent()
                .unwrap_or(Path::new("."))
                .to_path_buf();
            (file, Some(mediaflow_dir), Some(base_dir))
        }
        None => (ConfigFile::default(), None, None),
    };

    let relative = |value: &str| match &base_dir {
        Some(base) => resolve_path(base, value),
        None => PathBuf::from(value),
    };

    let home = match (env.home, &file.paths.home, &mediaflow_dir) {
        (Some(home), _, _) => home,
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        _ => default_home,
    };

    let log_dir = match (env.log_dir, &file.paths.logs) {
        (Some(dir), _) => dir,
        (None, Some(logs)) => relative(logs),
        (None, None) => home.join("logs"),
    };

    let default_pipeline = relative(
        file.defaults
            .pipeline
            .as_deref()
            .unwrap_or(DEFAULT_PIPELINE_FILE),
    );
    let default_input = relative(file.defaults.input.as_deref().unwrap_or(DEFAULT_INPUT_DIR));

    Ok(ResolvedConfig {
        home,
        log_dir,
        default_pipeline,
        default_input,
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".mediaflow");

    resolve_config(default_home, find_config_file(), EnvOverrides::from_env())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (bypasses the cache)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the run log directory ($MEDIAFLOW_HOME/logs unless overridden)
pub fn log_dir() -> Result<PathBuf> {
    Ok(config()?.log_dir.clone())
}
