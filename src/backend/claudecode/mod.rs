pub mod client;
pub mod resolve;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::events::ExecutionObserver;
use crate::backend::{
    BackendError, BackendKind, ExecutionRequest, ExecutionResult, Executor,
};

pub use client::{cli_args, ClaudeCodeClient};
pub use resolve::ExecutableResolver;

const LABEL: &str = "Claude CLI";

/// Runs tasks through a locally installed Claude CLI.
pub struct ClaudeCodeExecutor {
    resolver: Arc<ExecutableResolver>,
    client: ClaudeCodeClient,
}

impl ClaudeCodeExecutor {
    pub fn new(resolver: Arc<ExecutableResolver>, kill_grace: Duration) -> Self {
        Self {
            resolver,
            client: ClaudeCodeClient::new(kill_grace),
        }
    }

    pub fn resolver(&self) -> &Arc<ExecutableResolver> {
        &self.resolver
    }
}

#[async_trait]
impl Executor for ClaudeCodeExecutor {
    fn id(&self) -> &str {
        "claudecode"
    }

    async fn execute(
        &self,
        target: &BackendKind,
        request: ExecutionRequest,
        observer: Arc<dyn ExecutionObserver>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let Some(binary) = self.resolver.resolve().await else {
            return ExecutionResult::failure(
                BackendError::NotInstalled(LABEL.to_string()).to_string(),
                started.elapsed(),
            );
        };

        let mut cmd = Command::new(&binary);
        cmd.args(cli_args(&request, target.model()));
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        info!(
            "Running Claude CLI: binary={}, model={:?}, resume={:?}",
            binary.display(),
            target.model(),
            request.resume_session_id
        );

        self.client
            .run(LABEL, cmd, request.timeout, observer, cancel)
            .await
    }
}
