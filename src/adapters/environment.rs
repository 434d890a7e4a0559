//! Execution environments and command construction.
//!
//! An environment is a directory holding an isolated interpreter
//! installation. Two layouts are recognized:
//! - managed (a `conda-meta` marker directory): run through
//!   `conda run -p <env>`
//! - plain virtual environment: run with `VIRTUAL_ENV` set and the
//!   environment's script directory first on `PATH`
//!
//! Commands are built as argument vectors, never as shell strings.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

/// Marker directory identifying a managed (conda) environment
pub const MANAGED_ENV_MARKER: &str = "conda-meta";

/// Launcher used for managed environments when `CONDA_EXE` is unset
pub const DEFAULT_CONDA_BINARY: &str = "conda";

/// Layout of an execution environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentKind {
    Managed,
    Virtual,
}

/// A detected execution environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    path: PathBuf,
    kind: EnvironmentKind,
}

impl Environment {
    /// Inspect an environment directory.
    ///
    /// Returns `None` when the directory does not exist.
    pub fn detect(path: &Path) -> Option<Self> {
        if !path.is_dir() {
            return None;
        }

        let kind = if path.join(MANAGED_ENV_MARKER).exists() {
            EnvironmentKind::Managed
        } else {
            EnvironmentKind::Virtual
        };

        Some(Self {
            path: path.to_path_buf(),
            kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> EnvironmentKind {
        self.kind
    }

    /// Directory holding the environment's executables
    pub fn bin_dir(&self) -> PathBuf {
        match (self.kind, cfg!(windows)) {
            (EnvironmentKind::Virtual, true) => self.path.join("Scripts"),
            (EnvironmentKind::Managed, true) => self.path.clone(),
            (_, false) => self.path.join("bin"),
        }
    }

    /// Interpreter path inside the environment, if it exists there
    pub fn resolve_program(&self, program: &str) -> Option<PathBuf> {
        let candidate = self.bin_dir().join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    }
}

/// A fully built command: program, arguments and environment changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub env_remove: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            env_remove: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<OsString>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Tokio command with piped output and kill-on-drop.
    ///
    /// On unix the child leads its own process group so that
    /// [`kill_process_tree`] also reaches whatever it spawned (a launcher
    /// such as `conda run` never runs the module itself).
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        for key in &self.env_remove {
            command.env_remove(key);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

/// Kill a spawned child together with every process it started
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg only sends a signal; the group was created by to_command
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    match io::Error::last_os_error() {
        e if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        e => Err(e),
    }
}

/// Kill a spawned child together with every process it started
#[cfg(windows)]
pub fn kill_process_tree(pid: u32) -> io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
}

#[cfg(not(any(unix, windows)))]
pub fn kill_process_tree(_pid: u32) -> io::Result<()> {
    Ok(())
}

fn quote(part: &OsStr) -> String {
    let text = part.to_string_lossy();
    if !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+,".contains(c))
    {
        text.into_owned()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

/// Shell-like rendering used in error messages to reproduce a run by hand
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            if key == "PATH" {
                continue;
            }
            write!(f, "{}={} ", key.to_string_lossy(), quote(value))?;
        }
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

/// Default interpreter for a script, by extension
pub fn default_interpreter(script: &Path) -> Option<&'static str> {
    match script.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("py") => Some("python"),
        _ => None,
    }
}

/// Builds the command line for an external module invocation
#[derive(Debug, Clone)]
pub struct CommandBuilder<'a> {
    executable: &'a Path,
    interpreter: Option<&'a str>,
    environment: Option<&'a Environment>,
    conda_binary: OsString,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(executable: &'a Path) -> Self {
        let conda_binary = std::env::var_os("CONDA_EXE")
            .unwrap_or_else(|| OsString::from(DEFAULT_CONDA_BINARY));

        Self {
            executable,
            interpreter: default_interpreter(executable),
            environment: None,
            conda_binary,
        }
    }

    /// Override the interpreter (`None` keeps the extension-based default)
    pub fn interpreter(mut self, interpreter: Option<&'a str>) -> Self {
        if interpreter.is_some() {
            self.interpreter = interpreter;
        }
        self
    }

    pub fn environment(mut self, environment: Option<&'a Environment>) -> Self {
        self.environment = environment;
        self
    }

    pub fn conda_binary(mut self, binary: impl Into<OsString>) -> Self {
        self.conda_binary = binary.into();
        self
    }

    /// Build `<interpreter?> <executable> <input> <output>` inside the environment
    pub fn build(&self, input: &Path, output: &Path) -> Result<CommandSpec, String> {
        let spec = match self.environment {
            None => self.direct(),
            Some(env) if env.kind() == EnvironmentKind::Managed => {
                let spec = CommandSpec::new(self.conda_binary.clone())
                    .arg("run")
                    .arg("--no-capture-output")
                    .arg("-p")
                    .arg(env.path());
                match self.interpreter {
                    Some(interpreter) => spec.arg(interpreter).arg(self.executable),
                    None => spec.arg(self.executable),
                }
            }
            Some(env) => self.virtual_env(env)?,
        };

        Ok(spec.arg(input).arg(output))
    }

    fn direct(&self) -> CommandSpec {
        match self.interpreter {
            Some(interpreter) => CommandSpec::new(interpreter).arg(self.executable),
            None => CommandSpec::new(self.executable),
        }
    }

    fn virtual_env(&self, env: &Environment) -> Result<CommandSpec, String> {
        let bin_dir = env.bin_dir();
        let mut paths = vec![bin_dir];
        if let Some(current) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&current));
        }
        let path = std::env::join_paths(paths)
            .map_err(|e| format!("cannot build PATH for {}: {}", env.path().display(), e))?;

        let spec = match self.interpreter {
            Some(interpreter) => {
                let program = env
                    .resolve_program(interpreter)
                    .map(PathBuf::into_os_string)
                    .unwrap_or_else(|| OsString::from(interpreter));
                CommandSpec::new(program).arg(self.executable)
            }
            None => CommandSpec::new(self.executable),
        };

        Ok(spec
            .env("VIRTUAL_ENV", env.path())
            .env("PATH", path)
            .env_remove("PYTHONHOME"))
    }
}
