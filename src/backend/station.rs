//! Runs the Claude CLI on a remote compute station over SSH.
//!
//! The remote side speaks the same stream-json protocol, so the local
//! process runner handles the `ssh` child exactly like a local CLI.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::claudecode::{cli_args, ClaudeCodeClient};
use super::events::ExecutionObserver;
use super::{BackendError, BackendKind, ExecutionRequest, ExecutionResult, Executor};
use crate::config::StationConfig;

fn ssh_base_args(station: &StationConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(key) = &station.key_path {
        args.push("-i".to_string());
        args.push(key.to_string_lossy().to_string());
    }
    args.extend([
        "-p".to_string(),
        station.port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!(
            "UserKnownHostsFile={}",
            std::env::temp_dir()
                .join("taskforge_known_hosts")
                .to_string_lossy()
        ),
    ]);
    args
}

/// Single-quote `value` for the remote shell.
fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./,:=@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

/// Full `ssh` argument list for running the CLI with `cli` arguments.
pub fn ssh_args(station: &StationConfig, cli: &[String]) -> Vec<String> {
    let mut args = ssh_base_args(station);
    args.push(format!("{}@{}", station.user, station.host));
    args.push("--".to_string());
    let remote: Vec<String> = std::iter::once(station.remote_binary.as_str())
        .chain(cli.iter().map(|s| s.as_str()))
        .map(shell_quote)
        .collect();
    args.push(remote.join(" "));
    args
}

pub struct StationExecutor {
    stations: HashMap<String, StationConfig>,
    client: ClaudeCodeClient,
}

impl StationExecutor {
    pub fn new(stations: Vec<StationConfig>, kill_grace: Duration) -> Self {
        Self {
            stations: stations.into_iter().map(|s| (s.name.clone(), s)).collect(),
            client: ClaudeCodeClient::new(kill_grace),
        }
    }
}

#[async_trait]
impl Executor for StationExecutor {
    fn id(&self) -> &str {
        "station"
    }

    async fn execute(
        &self,
        target: &BackendKind,
        request: ExecutionRequest,
        observer: Arc<dyn ExecutionObserver>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let BackendKind::Station { station, model } = target else {
            return ExecutionResult::failure(
                BackendError::UnknownModel(target.to_string()).to_string(),
                started.elapsed(),
            );
        };
        let Some(config) = self.stations.get(station) else {
            return ExecutionResult::failure(
                BackendError::UnknownStation(station.clone()).to_string(),
                started.elapsed(),
            );
        };

        let mut cmd = Command::new("ssh");
        cmd.args(ssh_args(config, &cli_args(&request, model.as_deref())));

        info!(
            "Running Claude CLI on station {} ({}@{}:{})",
            config.name, config.user, config.host, config.port
        );

        let label = format!("ssh (station {})", config.name);
        self.client
            .run(&label, cmd, request.timeout, observer, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullObserver;
    use std::path::PathBuf;

    fn station() -> StationConfig {
        StationConfig {
            name: "gpu1".into(),
            user: "ops".into(),
            host: "10.0.0.5".into(),
            port: 2222,
            key_path: Some(PathBuf::from("/keys/gpu1")),
            remote_binary: "claude".into(),
        }
    }

    #[test]
    fn quoting_protects_prompts() {
        assert_eq!(shell_quote("stream-json"), "stream-json");
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn ssh_args_target_station_and_quote_remote_command() {
        let args = ssh_args(&station(), &["-p".to_string(), "fix the bug".to_string()]);
        assert_eq!(&args[..4], &["-i", "/keys/gpu1", "-p", "2222"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        let n = args.len();
        assert_eq!(args[n - 3], "ops@10.0.0.5");
        assert_eq!(args[n - 2], "--");
        assert_eq!(args[n - 1], "claude -p 'fix the bug'");
    }

    #[tokio::test]
    async fn unknown_station_fails_without_spawning() {
        let executor = StationExecutor::new(vec![station()], Duration::from_secs(1));
        let result = executor
            .execute(
                &BackendKind::Station {
                    station: "nope".into(),
                    model: None,
                },
                ExecutionRequest::new("x", "station:nope", Duration::from_secs(5)),
                Arc::new(NullObserver),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("Unknown station 'nope'"));
    }
}
