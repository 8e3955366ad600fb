//! Backend executors and the dispatch layer.
//!
//! Every execution shape (a spawned CLI agent, a CLI agent on a remote
//! station, an HTTP chat API, a local model daemon) collapses into one
//! [`ExecutionResult`]. Executors never return errors; failures are reported
//! through a non-zero `exit_code` and a readable `output`.

pub mod api;
pub mod claudecode;
pub mod events;
pub mod kind;
pub mod registry;
pub mod shared;
pub mod station;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatMessage, TokenUsage, ToolDefinition};

pub use events::{ChannelObserver, ExecutionEvent, ExecutionObserver, NullObserver};
pub use kind::{BackendFamily, BackendKind};
pub use registry::Dispatcher;

/// Errors raised while choosing or preparing a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Unknown model identifier: {0}")]
    UnknownModel(String),

    #[error("Unknown station '{0}': not configured")]
    UnknownStation(String),

    #[error("Missing API key: {0} is not configured")]
    MissingCredential(&'static str),

    #[error("{0} is not installed: executable not found (ENOENT)")]
    NotInstalled(String),
}

/// Invokes tools requested by an HTTP model during a multi-turn loop.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Run one tool. `Err` is fed back to the model as an error result.
    async fn invoke(&self, name: &str, arguments: Value) -> Result<String, String>;
}

/// Receives the conversation after every tool exchange.
#[async_trait]
pub trait HistoryHook: Send + Sync {
    async fn update(&self, history: &[ChatMessage]);
}

/// Tool definitions plus the callback that runs them.
#[derive(Clone)]
pub struct ToolSet {
    pub definitions: Vec<ToolDefinition>,
    pub invoker: Arc<dyn ToolInvoker>,
}

/// One call to a backend.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub prompt: String,
    /// Model identifier, parsed by [`BackendKind::parse`].
    pub model: String,
    pub system_prompt: Option<String>,
    /// Opaque CLI session handle to continue.
    pub resume_session_id: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout: Duration,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub tools: Option<ToolSet>,
    /// Prior turns for HTTP backends (their notion of a session).
    pub history: Vec<ChatMessage>,
    pub history_hook: Option<Arc<dyn HistoryHook>>,
    pub working_dir: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            system_prompt: None,
            resume_session_id: None,
            max_turns: None,
            timeout,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            tools: None,
            history: Vec::new(),
            history_hook: None,
            working_dir: None,
        }
    }

    /// Tool-calling is requested only with definitions and an invoker.
    pub fn tool_set(&self) -> Option<&ToolSet> {
        self.tools.as_ref().filter(|t| !t.definitions.is_empty())
    }
}

/// Normalized outcome of any backend call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub output: String,
    pub stderr: String,
    /// 0 on success.
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
    pub session_id: Option<String>,
    pub usage: Option<TokenUsage>,
    /// Provider-supplied delay before retrying.
    pub retry_after: Option<Duration>,
    /// Conversation after the call, for HTTP sessions.
    pub history: Option<Vec<ChatMessage>>,
}

impl ExecutionResult {
    pub fn failure(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            output: message.into(),
            exit_code: 1,
            duration,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Output and stderr together, for signature matching.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.output.clone()
        } else {
            format!("{}\n{}", self.output, self.stderr)
        }
    }
}

/// A backend that turns a request into an [`ExecutionResult`].
#[async_trait]
pub trait Executor: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(
        &self,
        target: &BackendKind,
        request: ExecutionRequest,
        observer: Arc<dyn ExecutionObserver>,
        cancel: CancellationToken,
    ) -> ExecutionResult;
}
