//! Server configuration.
//!
//! `ServeArgs` is what the operator types; `Config` is the resolved,
//! immutable form every handler sees through `AppState`.

use crate::bridge::StreamMode;
use crate::error::ConfigError;
use crate::security::rate_limit::ATTEMPT_WINDOW;
use crate::security::session::SESSION_TTL;
use clap::Args;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

const PYTHON_CANDIDATES: &[&str] = &["python3", "python"];

/// Command-line arguments for `webterm serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, default_value = "8090", env = "WEBTERM_PORT")]
    pub port: u16,

    /// Directory scripts are resolved against and run in (defaults to cwd)
    #[arg(long, env = "WEBTERM_ROOT")]
    pub root: Option<PathBuf>,

    /// Script executed when an `execute` request names no file
    #[arg(long, env = "WEBTERM_FILE")]
    pub file: Option<String>,

    /// Interpreter for `.py` scripts (auto-detected when omitted)
    #[arg(long, env = "WEBTERM_INTERPRETER")]
    pub interpreter: Option<String>,

    /// Shell spawned by the shell session
    #[arg(long, env = "SHELL", default_value = "/bin/sh")]
    pub shell: String,

    /// Password required to log in; authentication is disabled when unset
    #[arg(long, env = "WEBTERM_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Derive client identity from X-Forwarded-For / X-Real-IP
    #[arg(long)]
    pub trust_proxy: bool,

    /// Use plain pipes even where a pseudo-terminal is available
    #[arg(long)]
    pub no_pty: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    pub verbose: bool,
}

/// Queue sizes, intervals and lifetimes.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub outbound_capacity: usize,
    pub input_capacity: usize,
    pub read_chunk: usize,
    pub ping_interval: Duration,
    pub read_deadline: Duration,
    pub drain_grace: Duration,
    pub session_ttl: Duration,
    pub session_sweep: Duration,
    pub limiter_window: Duration,
    pub limiter_sweep: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            outbound_capacity: 100,
            input_capacity: 10,
            read_chunk: 4096,
            ping_interval: Duration::from_secs(30),
            read_deadline: Duration::from_secs(60),
            drain_grace: Duration::from_millis(500),
            session_ttl: SESSION_TTL,
            session_sweep: Duration::from_secs(60 * 60),
            limiter_window: ATTEMPT_WINDOW,
            limiter_sweep: Duration::from_secs(5 * 60),
        }
    }
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Canonical working root.
    pub root: PathBuf,
    pub default_file: Option<String>,
    /// Python command, if one was configured or detected.
    pub interpreter: Option<String>,
    pub shell: String,
    pub password: Option<String>,
    pub trust_proxy: bool,
    pub stream_mode: StreamMode,
    pub tunables: Tunables,
}

impl Config {
    /// Minimal configuration rooted at `root`: no auth, no default script,
    /// pipe mode, Python auto-detection skipped.
    pub fn for_root(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self {
            root: canonical_root(root.as_ref())?,
            default_file: None,
            interpreter: None,
            shell: "/bin/sh".to_string(),
            password: None,
            trust_proxy: false,
            stream_mode: StreamMode::Pipes,
            tunables: Tunables::default(),
        })
    }

    /// Resolve CLI arguments into a configuration, probing the host for a
    /// Python interpreter and pseudo-terminal support.
    pub fn from_args(args: &ServeArgs) -> Result<Self, ConfigError> {
        let root = match &args.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().map_err(|source| ConfigError::Root {
                path: PathBuf::from("."),
                source,
            })?,
        };
        let root = canonical_root(&root)?;

        if let Some(file) = &args.file {
            if !root.join(file).is_file() {
                return Err(ConfigError::DefaultScript(file.clone()));
            }
        }

        let interpreter = match &args.interpreter {
            Some(cmd) => Some(cmd.clone()),
            None => match detect_python() {
                Ok(cmd) => Some(cmd),
                Err(e) => {
                    warn!("{}; .py scripts will fail to start", e);
                    None
                }
            },
        };

        let stream_mode = if args.no_pty {
            StreamMode::Pipes
        } else {
            StreamMode::probe()
        };
        info!(?stream_mode, interpreter = ?interpreter, root = %root.display(), "Configuration resolved");

        Ok(Self {
            root,
            default_file: args.file.clone(),
            interpreter,
            shell: args.shell.clone(),
            password: args.password.clone().filter(|p| !p.is_empty()),
            trust_proxy: args.trust_proxy,
            stream_mode,
            tunables: Tunables::default(),
        })
    }

    pub fn auth_enabled(&self) -> bool {
        self.password.is_some()
    }
}

fn canonical_root(path: &Path) -> Result<PathBuf, ConfigError> {
    path.canonicalize().map_err(|source| ConfigError::Root {
        path: path.to_path_buf(),
        source,
    })
}

/// Find a Python 3 interpreter on `PATH`.
pub fn detect_python() -> Result<String, ConfigError> {
    for candidate in PYTHON_CANDIDATES {
        if is_python3(candidate) {
            debug!(command = candidate, "Detected Python interpreter");
            return Ok(candidate.to_string());
        }
    }
    Err(ConfigError::NoPython(PYTHON_CANDIDATES.to_vec()))
}

fn is_python3(command: &str) -> bool {
    match Command::new(command).arg("--version").output() {
        // Python 2 printed its version on stderr
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            stdout.starts_with("Python 3") || stderr.starts_with("Python 3")
        }
        _ => false,
    }
}
