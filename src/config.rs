//! Configuration management for taskforge.
//!
//! Configuration is read from environment variables. Every value is optional:
//! - `TASKFORGE_DATA_DIR` - Directory holding the run database. Defaults to `$HOME/.taskforge`.
//! - `TASKFORGE_RESULTS_DIR` - Where result artifacts are written. Defaults to `<data>/results`.
//! - `TASKFORGE_DEFAULT_MODEL` - Model used when no worker or room supplies one. Defaults to `claude`.
//! - `TASKFORGE_MAX_CONCURRENT` - Global concurrency limit for roomless tasks. Defaults to `3`.
//! - `TASKFORGE_RATE_LIMIT_MIN_WAIT_SECS` / `_MAX_WAIT_SECS` / `_DEFAULT_WAIT_SECS` / `_MAX_RETRIES`
//! - `TASKFORGE_SESSION_ROTATION_RUNS` - Runs after which a CLI session is rotated. Defaults to `20`.
//! - `TASKFORGE_HISTORY_COMPACT_MESSAGES` - API session size that triggers compaction. Defaults to `40`.
//! - `TASKFORGE_CONSOLE_FLUSH_MS` - Console log flush interval. Defaults to `1000`.
//! - `TASKFORGE_KILL_GRACE_SECS` - Grace window between SIGTERM and SIGKILL. Defaults to `5`.
//! - `TASKFORGE_DEFAULT_TIMEOUT_SECS` - Timeout for tasks that set none. Defaults to `1800`.
//! - `CLAUDE_CLI_PATH` - Explicit path to the Claude CLI (skips probing).
//! - `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `ANTHROPIC_API_KEY`, `ANTHROPIC_BASE_URL`
//! - `OLLAMA_URL` - Local model daemon. Defaults to `http://127.0.0.1:11434`.
//! - `TASKFORGE_STATIONS` - Remote stations, `name=user@host[:port][;key=/path]`, comma separated.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::util::home_dir;

pub const DEFAULT_MAX_CONCURRENT: u32 = 3;
pub const MIN_CONCURRENT: u32 = 1;
pub const MAX_CONCURRENT: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Invalid station definition '{0}': {1}")]
    InvalidStation(String, String),
}

/// Rate limit backoff tuning.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Lower clamp for any computed wait
    pub min_wait: Duration,

    /// Upper clamp for any computed wait
    pub max_wait: Duration,

    /// Wait used when the failure carries no parseable reset signal
    pub default_wait: Duration,

    /// Retries after the first attempt (3 means up to 4 attempts)
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_wait: Duration::from_secs(30),
            max_wait: Duration::from_secs(60 * 60),
            default_wait: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// A remote machine that can run the CLI agent over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationConfig {
    pub name: String,
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    /// CLI executable on the remote side
    pub remote_binary: String,
}

impl StationConfig {
    /// Parse `name=user@host[:port][;key=/path][;bin=/remote/claude]`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |msg: &str| ConfigError::InvalidStation(spec.to_string(), msg.to_string());

        let (name, rest) = spec.split_once('=').ok_or_else(|| invalid("missing '='"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty station name"));
        }

        let mut parts = rest.split(';');
        let target = parts.next().unwrap_or("").trim();
        let (user, host_port) = target
            .split_once('@')
            .ok_or_else(|| invalid("expected user@host"))?;
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| invalid("bad port"))?,
            ),
            None => (host_port, 22),
        };
        if user.is_empty() || host.is_empty() {
            return Err(invalid("expected user@host"));
        }

        let mut key_path = None;
        let mut remote_binary = "claude".to_string();
        for option in parts {
            match option.trim().split_once('=') {
                Some(("key", value)) => key_path = Some(PathBuf::from(value)),
                Some(("bin", value)) => remote_binary = value.to_string(),
                _ => return Err(invalid("unknown station option")),
            }
        }

        Ok(Self {
            name: name.to_string(),
            user: user.to_string(),
            host: host.to_string(),
            port,
            key_path,
            remote_binary,
        })
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the SQLite run database
    pub data_dir: PathBuf,

    /// Directory for human-readable result artifacts
    pub results_dir: PathBuf,

    /// Model identifier used when neither worker nor room supplies one
    pub default_model: String,

    /// Concurrency limit for tasks without a room
    pub max_concurrent: u32,

    pub rate_limit: RateLimitConfig,

    /// Runs sharing one CLI session before it is rotated
    pub session_rotation_runs: u64,

    /// API session history length that triggers compaction
    pub history_compact_messages: usize,

    pub console_flush_interval: Duration,

    /// Time between SIGTERM and SIGKILL on timeout
    pub kill_grace: Duration,

    /// Timeout applied when the task sets none
    pub default_timeout: Duration,

    pub claude_cli_path: Option<String>,

    pub openai_api_key: Option<String>,
    pub openai_base_url: String,

    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,

    pub ollama_url: String,

    pub stations: Vec<StationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from(home_dir()).join(".taskforge");
        Self {
            results_dir: data_dir.join("results"),
            data_dir,
            default_model: "claude".to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            rate_limit: RateLimitConfig::default(),
            session_rotation_runs: 20,
            history_compact_messages: 40,
            console_flush_interval: Duration::from_millis(1000),
            kill_grace: Duration::from_secs(5),
            default_timeout: Duration::from_secs(30 * 60),
            claude_cli_path: None,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            anthropic_api_key: None,
            anthropic_base_url: "https://api.anthropic.com/v1".to_string(),
            ollama_url: "http://127.0.0.1:11434".to_string(),
            stations: Vec::new(),
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        _ => Ok(default),
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Clamp a configured concurrency limit into the supported band.
pub fn clamp_concurrency(value: u32) -> u32 {
    value.clamp(MIN_CONCURRENT, MAX_CONCURRENT)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let data_dir = env_string("TASKFORGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let results_dir = env_string("TASKFORGE_RESULTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("results"));

        let rate_limit = RateLimitConfig {
            min_wait: Duration::from_secs(env_parse(
                "TASKFORGE_RATE_LIMIT_MIN_WAIT_SECS",
                defaults.rate_limit.min_wait.as_secs(),
            )?),
            max_wait: Duration::from_secs(env_parse(
                "TASKFORGE_RATE_LIMIT_MAX_WAIT_SECS",
                defaults.rate_limit.max_wait.as_secs(),
            )?),
            default_wait: Duration::from_secs(env_parse(
                "TASKFORGE_RATE_LIMIT_DEFAULT_WAIT_SECS",
                defaults.rate_limit.default_wait.as_secs(),
            )?),
            max_retries: env_parse(
                "TASKFORGE_RATE_LIMIT_MAX_RETRIES",
                defaults.rate_limit.max_retries,
            )?,
        };
        if rate_limit.min_wait > rate_limit.max_wait {
            return Err(ConfigError::InvalidValue(
                "TASKFORGE_RATE_LIMIT_MIN_WAIT_SECS".to_string(),
                "minimum wait exceeds maximum wait".to_string(),
            ));
        }

        let stations = match env_string("TASKFORGE_STATIONS") {
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| StationConfig::parse(s.trim()))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            data_dir,
            results_dir,
            default_model: env_string("TASKFORGE_DEFAULT_MODEL").unwrap_or(defaults.default_model),
            max_concurrent: clamp_concurrency(env_parse(
                "TASKFORGE_MAX_CONCURRENT",
                defaults.max_concurrent,
            )?),
            rate_limit,
            session_rotation_runs: env_parse(
                "TASKFORGE_SESSION_ROTATION_RUNS",
                defaults.session_rotation_runs,
            )?,
            history_compact_messages: env_parse(
                "TASKFORGE_HISTORY_COMPACT_MESSAGES",
                defaults.history_compact_messages,
            )?,
            console_flush_interval: Duration::from_millis(env_parse(
                "TASKFORGE_CONSOLE_FLUSH_MS",
                1000u64,
            )?),
            kill_grace: Duration::from_secs(env_parse(
                "TASKFORGE_KILL_GRACE_SECS",
                defaults.kill_grace.as_secs(),
            )?),
            default_timeout: Duration::from_secs(env_parse(
                "TASKFORGE_DEFAULT_TIMEOUT_SECS",
                defaults.default_timeout.as_secs(),
            )?),
            claude_cli_path: env_string("CLAUDE_CLI_PATH"),
            openai_api_key: env_string("OPENAI_API_KEY"),
            openai_base_url: env_string("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            anthropic_api_key: env_string("ANTHROPIC_API_KEY"),
            anthropic_base_url: env_string("ANTHROPIC_BASE_URL")
                .unwrap_or(defaults.anthropic_base_url),
            ollama_url: env_string("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            stations,
        })
    }

    /// Path of the SQLite run database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("taskforge.db")
    }
}
