//! Cross-environment bridge for external modules.
//!
//! An external module is a program invoked as
//! `<executable> <input_file> <output_file>`. The bridge writes the request
//! as JSON to `input_file`, runs the program (inside its execution
//! environment when one is named), waits for it under a timeout and reads
//! the JSON response back from `output_file`.
//!
//! Both temporary files are owned by RAII guards and are removed on every
//! exit path.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::{Builder, TempPath};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::environment::{kill_process_tree, CommandBuilder, CommandSpec, Environment};
use super::{DispatchError, ModuleExecutor, ModuleRequest};
use crate::core::pipeline::RetryPolicy;
use crate::core::registry::ModuleDescriptor;
use crate::domain::ErrorKind;

/// External dispatch failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Executable or environment missing, or the process could not be started
    #[error("Failed to launch external module: {reason} (command: {command})")]
    SpawnFailure { command: String, reason: String },

    #[error("External module exited with code {}: {stderr} (command: {command})", .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    ExternalExecution {
        exit_code: Option<i32>,
        stderr: String,
        command: String,
    },

    /// Output file missing, unreadable or not valid JSON
    #[error("Malformed response from external module: {reason} (command: {command})")]
    MalformedResponse { command: String, reason: String },

    #[error("External module timed out after {}s (command: {command})", .limit.as_secs_f64())]
    Timeout { command: String, limit: Duration },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            BridgeError::ExternalExecution { .. } => ErrorKind::ExternalExecution,
            BridgeError::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Command line that reproduces the failure
    pub fn command(&self) -> &str {
        match self {
            BridgeError::SpawnFailure { command, .. }
            | BridgeError::ExternalExecution { command, .. }
            | BridgeError::MalformedResponse { command, .. }
            | BridgeError::Timeout { command, .. } => command,
        }
    }
}

/// What to run for one external call
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    /// Execution environment directory
    pub environment: Option<&'a Path>,

    /// Script or program to run
    pub executable: &'a Path,

    /// Explicit interpreter (defaults by script extension)
    pub interpreter: Option<&'a str>,

    /// Maximum time to wait for the process
    pub timeout: Duration,
}

/// Runs external programs through request/response files
#[derive(Debug, Clone, Default)]
pub struct Bridge {
    /// Directory for request/response files (system temp when unset)
    scratch_dir: Option<PathBuf>,

    /// Retries applied to spawn failures only
    spawn_retry: RetryPolicy,

    /// Launcher for managed environments (`CONDA_EXE` or `conda` when unset)
    conda_binary: Option<OsString>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_spawn_retry(mut self, policy: RetryPolicy) -> Self {
        self.spawn_retry = policy;
        self
    }

    pub fn with_conda_binary(mut self, binary: impl Into<OsString>) -> Self {
        self.conda_binary = Some(binary.into());
        self
    }

    fn temp_file(&self, prefix: &str) -> std::io::Result<tempfile::NamedTempFile> {
        let mut builder = Builder::new();
        builder.prefix(prefix).suffix(".json");
        match &self.scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
    }

    /// Write the request to a temp file and reserve the response file
    fn prepare_files(
        &self,
        request: &Value,
        command: &str,
    ) -> Result<(TempPath, TempPath), BridgeError> {
        let spawn_failure = |reason: String| BridgeError::SpawnFailure {
            command: command.to_string(),
            reason,
        };

        let mut input = self
            .temp_file("mediaflow-request-")
            .map_err(|e| spawn_failure(format!("cannot create request file: {}", e)))?;
        serde_json::to_writer(input.as_file_mut(), request)
            .map_err(|e| spawn_failure(format!("cannot write request file: {}", e)))?;

        let output = self
            .temp_file("mediaflow-response-")
            .map_err(|e| spawn_failure(format!("cannot create response file: {}", e)))?;

        // Close both handles so the child can open them on any platform
        Ok((input.into_temp_path(), output.into_temp_path()))
    }

    /// Run an external module and return its parsed response
    pub async fn invoke(
        &self,
        invocation: &Invocation<'_>,
        request: &Value,
    ) -> Result<Value, BridgeError> {
        let executable = invocation.executable;
        let described = executable.display().to_string();

        if !executable.exists() {
            return Err(BridgeError::SpawnFailure {
                command: described,
                reason: format!("executable not found: {}", executable.display()),
            });
        }

        let environment = match invocation.environment {
            None => None,
            Some(path) => Some(Environment::detect(path).ok_or_else(|| {
                BridgeError::SpawnFailure {
                    command: described.clone(),
                    reason: format!("execution environment not found: {}", path.display()),
                }
            })?),
        };

        let (input_file, output_file) = self.prepare_files(request, &described)?;

        let mut builder = CommandBuilder::new(executable)
            .interpreter(invocation.interpreter)
            .environment(environment.as_ref());
        if let Some(conda) = &self.conda_binary {
            builder = builder.conda_binary(conda.clone());
        }
        let spec = builder
            .build(&input_file, &output_file)
            .map_err(|reason| BridgeError::SpawnFailure {
                command: described.clone(),
                reason,
            })?;

        self.run_with_retry(&spec, invocation.timeout).await?;
        read_response(&output_file, &spec.to_string()).await
        // input_file and output_file are removed here
    }

    async fn run_with_retry(&self, spec: &CommandSpec, limit: Duration) -> Result<(), BridgeError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match run_once(spec, limit).await {
                Err(e @ BridgeError::SpawnFailure { .. }) if self.spawn_retry.should_retry(attempt) => {
                    let delay = self.spawn_retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "External module failed to start, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

async fn run_once(spec: &CommandSpec, limit: Duration) -> Result<(), BridgeError> {
    let command = spec.to_string();
    debug!(%command, "Spawning external module");

    let child = spec
        .to_command()
        .spawn()
        .map_err(|e| BridgeError::SpawnFailure {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    let pid = child.id();
    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let finished = match timeout(limit, wait.as_mut()).await {
        Ok(finished) => finished,
        Err(_) => {
            // The whole tree goes while the child is still unreaped;
            // kill_on_drop alone would only stop the direct child
            if let Some(pid) = pid {
                if let Err(e) = kill_process_tree(pid) {
                    warn!(%command, pid, error = %e, "Failed to kill timed-out module");
                }
            }
            return Err(BridgeError::Timeout {
                command: command.clone(),
                limit,
            });
        }
    };

    let output = finished
        .map_err(|e| BridgeError::SpawnFailure {
            command: command.clone(),
            reason: format!("failed to wait for process: {}", e),
        })?;

    if !output.status.success() {
        return Err(BridgeError::ExternalExecution {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            command,
        });
    }

    Ok(())
}

async fn read_response(path: &Path, command: &str) -> Result<Value, BridgeError> {
    let malformed = |reason: String| BridgeError::MalformedResponse {
        command: command.to_string(),
        reason,
    };

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| malformed(format!("cannot read {}: {}", path.display(), e)))?;

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(malformed("response file is empty".to_string()));
    }

    serde_json::from_slice(&bytes).map_err(|e| malformed(format!("invalid JSON: {}", e)))
}

/// Runs external modules through a [`Bridge`]
#[derive(Debug, Clone, Default)]
pub struct ExternalExecutor {
    bridge: Bridge,
}

impl ExternalExecutor {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl ModuleExecutor for ExternalExecutor {
    fn name(&self) -> &str {
        "external"
    }

    async fn execute(
        &self,
        module: &ModuleDescriptor,
        request: &ModuleRequest,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let request = request.payload(module);

        let invocation = Invocation {
            environment: module.environment.as_deref(),
            executable: Path::new(&module.target),
            interpreter: module.interpreter.as_deref(),
            timeout,
        };

        info!(
            module = %module.name,
            target = %module.target,
            environment = ?module.environment,
            "Running external module"
        );
        Ok(self.bridge.invoke(&invocation, &request).await?)
    }
}
