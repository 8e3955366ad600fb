use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::events::ExecutionObserver;
use crate::backend::shared::StreamState;
use crate::backend::{BackendError, ExecutionRequest, ExecutionResult};
use crate::util::sanitize_tool_list;

/// How long to wait for stderr after the process is gone.
const STDERR_DRAIN: Duration = Duration::from_secs(2);

/// Build the CLI argument list for one request.
pub fn cli_args(request: &ExecutionRequest, model: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        request.prompt.clone(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if let Some(sid) = &request.resume_session_id {
        args.push("--resume".to_string());
        args.push(sid.clone());
    }
    if let Some(system) = request.system_prompt.as_ref().filter(|s| !s.is_empty()) {
        args.push("--system-prompt".to_string());
        args.push(system.clone());
    }
    if let Some(m) = model {
        args.push("--model".to_string());
        args.push(m.to_string());
    }
    if let Some(turns) = request.max_turns {
        args.push("--max-turns".to_string());
        args.push(turns.to_string());
    }

    let allowed = sanitize_tool_list(&request.allowed_tools);
    if !allowed.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed.join(","));
    }
    let disallowed = sanitize_tool_list(&request.disallowed_tools);
    if !disallowed.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(disallowed.join(","));
    }

    args
}

/// Runs a CLI process that speaks stream-json and normalizes its outcome.
pub struct ClaudeCodeClient {
    kill_grace: Duration,
}

impl ClaudeCodeClient {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Spawn `cmd`, stream its events to `observer`, and wait for it to
    /// finish, time out, or be cancelled. `label` names the program in errors.
    pub async fn run(
        &self,
        label: &str,
        mut cmd: Command,
        timeout: Duration,
        observer: Arc<dyn ExecutionObserver>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("Failed to spawn {}: {}", label, e);
                return ExecutionResult::failure(
                    BackendError::NotInstalled(label.to_string()).to_string(),
                    started.elapsed(),
                );
            }
            Err(e) => {
                error!("Failed to spawn {}: {}", label, e);
                return ExecutionResult::failure(
                    format!("Failed to spawn {}: {}", label, e),
                    started.elapsed(),
                );
            }
        };

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                warn!("Could not capture output streams of {}", label);
                let _ = child.kill().await;
                return ExecutionResult::failure(
                    format!("Failed to capture output streams of {}", label),
                    started.elapsed(),
                );
            }
        };

        info!(
            "Spawned {}: pid={:?}, timeout={}s",
            label,
            child.id(),
            timeout.as_secs()
        );

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut state = StreamState::default();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut timed_out = false;
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        for event in state.apply_line(&line) {
                            observer.on_event(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error reading {} stdout: {}", label, e);
                        break;
                    }
                },
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }

        let status = if timed_out || cancelled {
            self.terminate(&mut child).await
        } else {
            tokio::select! {
                status = child.wait() => status.ok(),
                _ = &mut deadline => {
                    timed_out = true;
                    self.terminate(&mut child).await
                }
                _ = cancel.cancelled() => {
                    cancelled = true;
                    self.terminate(&mut child).await
                }
            }
        };

        let mut stderr_text = match tokio::time::timeout(STDERR_DRAIN, stderr_task).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        };

        let mut exit_code = status.and_then(|s| s.code()).unwrap_or(1);
        if exit_code == 0 && state.error.is_some() {
            exit_code = 1;
        }
        if cancelled {
            exit_code = if exit_code == 0 { 1 } else { exit_code };
            if !stderr_text.is_empty() {
                stderr_text.push('\n');
            }
            stderr_text.push_str("Cancelled");
        }

        debug!(
            "{} finished: exit_code={}, timed_out={}, tool_calls={}",
            label,
            exit_code,
            timed_out,
            state.tool_calls()
        );

        ExecutionResult {
            output: state.output(),
            stderr: stderr_text,
            exit_code,
            duration: started.elapsed(),
            timed_out,
            session_id: state.session_id.clone(),
            usage: state.usage,
            retry_after: None,
            history: None,
        }
    }

    /// SIGTERM, then SIGKILL once the grace window passes.
    async fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                warn!("Process ignored SIGTERM, sending SIGKILL");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill CLI process: {}", e);
                }
                child.wait().await.ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::events::{ChannelObserver, ExecutionEvent};
    use crate::backend::NullObserver;

    fn script_command(body: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(body);
        cmd
    }

    #[test]
    fn args_include_optional_flags_in_order() {
        let mut request = ExecutionRequest::new("do it", "claude", Duration::from_secs(10));
        request.resume_session_id = Some("sess-1".into());
        request.system_prompt = Some("be brief".into());
        request.max_turns = Some(7);
        request.allowed_tools = vec!["Bash".into(), " Read ".into(), "".into()];
        request.disallowed_tools = vec!["WebFetch".into()];

        let args = cli_args(&request, Some("opus"));
        assert_eq!(
            args,
            vec![
                "-p",
                "do it",
                "--output-format",
                "stream-json",
                "--verbose",
                "--resume",
                "sess-1",
                "--system-prompt",
                "be brief",
                "--model",
                "opus",
                "--max-turns",
                "7",
                "--allowedTools",
                "Bash,Read",
                "--disallowedTools",
                "WebFetch",
            ]
        );
    }

    #[test]
    fn args_omit_absent_flags() {
        let request = ExecutionRequest::new("x", "claude", Duration::from_secs(10));
        let args = cli_args(&request, None);
        assert_eq!(args.len(), 5);
    }

    #[tokio::test]
    async fn streams_events_and_captures_result() {
        let script = r#"
echo '{"type":"system","subtype":"init","session_id":"s-1"}'
echo 'garbage line'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{}}]}}'
echo '{"type":"result","subtype":"success","result":"finished","session_id":"s-2"}'
"#;
        let (observer, mut rx) = ChannelObserver::new();
        let client = ClaudeCodeClient::new(Duration::from_secs(1));
        let result = client
            .run(
                "test cli",
                script_command(script),
                Duration::from_secs(10),
                Arc::new(observer),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "finished");
        assert_eq!(result.session_id.as_deref(), Some("s-2"));
        assert!(!result.timed_out);

        let mut saw_step = false;
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::Progress { message, .. } = event {
                saw_step |= message == "Step 1: Using Bash...";
            }
        }
        assert!(saw_step);
    }

    #[tokio::test]
    async fn nonzero_exit_and_stderr_are_reported() {
        let client = ClaudeCodeClient::new(Duration::from_secs(1));
        let result = client
            .run(
                "test cli",
                script_command("echo 'Rate limited. try again in 5 seconds' >&2; exit 3"),
                Duration::from_secs(10),
                Arc::new(NullObserver),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("try again in 5 seconds"));
    }

    #[tokio::test]
    async fn missing_executable_is_not_installed() {
        let client = ClaudeCodeClient::new(Duration::from_secs(1));
        let result = client
            .run(
                "Claude CLI",
                Command::new("/definitely/not/here/claude"),
                Duration::from_secs(5),
                Arc::new(NullObserver),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("ENOENT"));
        assert!(result.output.contains("not installed"));
    }

    #[tokio::test]
    async fn timeout_terminates_the_process() {
        let client = ClaudeCodeClient::new(Duration::from_millis(200));
        let result = client
            .run(
                "sleeper",
                script_command("sleep 30"),
                Duration::from_millis(200),
                Arc::new(NullObserver),
                CancellationToken::new(),
            )
            .await;
        assert!(result.timed_out);
        assert_ne!(result.exit_code, 0);
        assert!(result.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let client = ClaudeCodeClient::new(Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = client
            .run(
                "sleeper",
                script_command("sleep 30"),
                Duration::from_secs(60),
                Arc::new(NullObserver),
                cancel,
            )
            .await;
        assert!(!result.timed_out);
        assert_ne!(result.exit_code, 0);
        assert!(result.stderr.contains("Cancelled"));
    }
}
