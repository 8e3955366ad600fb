//! HTTP executors: chat-completions, messages API and the local daemon.
//!
//! Without tools a request is a single completion (streamed for the local
//! daemon). With tools it is a multi-turn loop bounded by `max_turns`: tool
//! calls are run through the request's [`ToolInvoker`] and fed back until a
//! turn produces none.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ExecutionEvent, ExecutionObserver};
use super::{BackendError, BackendKind, ExecutionRequest, ExecutionResult, Executor, ToolSet};
use crate::llm::{
    ChatMessage, ChatResponse, LlmClient, LlmError, LlmErrorKind, OllamaClient, Role, TokenUsage,
};

/// Turn cap when the task does not set one.
pub const DEFAULT_MAX_TURNS: u32 = 25;

enum CallError {
    Llm(LlmError),
    TimedOut,
    Cancelled,
}

pub struct ApiExecutor {
    id: &'static str,
    client: Option<Arc<dyn LlmClient>>,
    /// Environment variable that must be set for `client` to exist.
    credential: &'static str,
    local: Option<Arc<OllamaClient>>,
}

impl ApiExecutor {
    pub fn new(id: &'static str, client: Arc<dyn LlmClient>) -> Self {
        Self {
            id,
            client: Some(client),
            credential: "",
            local: None,
        }
    }

    /// Executor whose credential is missing; every call fails terminally.
    pub fn unconfigured(id: &'static str, credential: &'static str) -> Self {
        Self {
            id,
            client: None,
            credential,
            local: None,
        }
    }

    /// Executor for the local daemon (availability check + streaming).
    pub fn local(client: Arc<OllamaClient>) -> Self {
        Self {
            id: "ollama",
            client: Some(client.clone() as Arc<dyn LlmClient>),
            credential: "",
            local: Some(client),
        }
    }

    async fn call(
        client: &dyn LlmClient,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&ToolSet>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, CallError> {
        let fut = client.chat_completion(model, messages, tools.map(|t| t.definitions.as_slice()));
        bounded(fut, deadline, cancel).await?.map_err(CallError::Llm)
    }

    async fn single_turn(
        &self,
        client: &dyn LlmClient,
        model: &str,
        messages: &[ChatMessage],
        deadline: Instant,
        observer: &dyn ExecutionObserver,
        cancel: &CancellationToken,
    ) -> Result<(String, Option<TokenUsage>), (CallError, Option<TokenUsage>)> {
        if let Some(local) = &self.local {
            let mut stream = match bounded(local.chat_stream(model, messages), deadline, cancel).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err((CallError::Llm(e), None)),
                Err(e) => return Err((e, None)),
            };
            let mut text = String::new();
            loop {
                match bounded(stream.next(), deadline, cancel).await {
                    Ok(Some(Ok(fragment))) => {
                        if !fragment.is_empty() {
                            observer.on_event(ExecutionEvent::AssistantText {
                                text: fragment.clone(),
                            });
                            text.push_str(&fragment);
                        }
                    }
                    Ok(Some(Err(e))) => return Err((CallError::Llm(e), None)),
                    Ok(None) => break,
                    Err(e) => return Err((e, None)),
                }
            }
            return Ok((text, None));
        }

        let response = Self::call(client, model, messages, None, deadline, cancel)
            .await
            .map_err(|e| (e, None))?;
        let text = response.content.unwrap_or_default();
        if !text.is_empty() {
            observer.on_event(ExecutionEvent::AssistantText { text: text.clone() });
        }
        Ok((text, response.usage))
    }

    #[allow(clippy::too_many_arguments)]
    async fn tool_loop(
        &self,
        client: &dyn LlmClient,
        model: &str,
        messages: &mut Vec<ChatMessage>,
        tools: &ToolSet,
        request: &ExecutionRequest,
        deadline: Instant,
        observer: &dyn ExecutionObserver,
        cancel: &CancellationToken,
    ) -> Result<(String, TokenUsage), (CallError, TokenUsage)> {
        let max_turns = request.max_turns.unwrap_or(DEFAULT_MAX_TURNS).max(1);
        let mut usage = TokenUsage::default();
        let mut steps = 0u32;
        let mut last_text = String::new();

        for turn in 1..=max_turns {
            let response = match Self::call(client, model, messages, Some(tools), deadline, cancel).await {
                Ok(response) => response,
                Err(e) => return Err((e, usage)),
            };
            if let Some(u) = &response.usage {
                usage.add(u);
            }

            let text = response.content.clone().unwrap_or_default();
            if !text.is_empty() {
                observer.on_event(ExecutionEvent::AssistantText { text: text.clone() });
                last_text = text.clone();
            }

            let calls = response.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() {
                messages.push(ChatMessage::new(Role::Assistant, text));
                return Ok((last_text, usage));
            }

            messages.push(ChatMessage::assistant_tool_calls(response.content, calls.clone()));
            for call in calls {
                steps += 1;
                let input = call.arguments_value();
                observer.on_event(ExecutionEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    input: input.clone(),
                });
                observer.on_event(ExecutionEvent::Progress {
                    fraction: None,
                    message: format!("Step {}: Using {}...", steps, call.function.name),
                });

                let (content, is_error) =
                    match bounded(tools.invoker.invoke(&call.function.name, input), deadline, cancel)
                        .await
                    {
                        Ok(Ok(out)) => (out, false),
                        Ok(Err(e)) => (format!("Error: {}", e), true),
                        Err(e) => return Err((e, usage)),
                    };
                observer.on_event(ExecutionEvent::ToolResult {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    content: content.clone(),
                    is_error,
                });
                messages.push(ChatMessage::tool_result(call.id, content));
            }

            if let Some(hook) = &request.history_hook {
                hook.update(&conversation(messages)).await;
            }
            debug!("Tool turn {}/{} complete", turn, max_turns);
        }

        warn!("Tool loop reached the {} turn cap", max_turns);
        if last_text.is_empty() {
            last_text = format!("Stopped after reaching the {} turn limit", max_turns);
        }
        Ok((last_text, usage))
    }
}

/// Messages worth persisting: everything except the system prompt.
fn conversation(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect()
}

/// Race `fut` against the deadline and the cancellation token.
async fn bounded<F: Future>(
    fut: F,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<F::Output, CallError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    tokio::select! {
        out = tokio::time::timeout(remaining, fut) => out.map_err(|_| CallError::TimedOut),
        _ = cancel.cancelled() => Err(CallError::Cancelled),
    }
}

fn error_result(
    error: CallError,
    provider: &str,
    started: Instant,
    usage: Option<TokenUsage>,
) -> ExecutionResult {
    let mut result = ExecutionResult::failure(String::new(), started.elapsed());
    result.usage = usage;
    match error {
        CallError::TimedOut => {
            result.timed_out = true;
            result.output = format!("{} request timed out", provider);
        }
        CallError::Cancelled => {
            result.output = format!("{} request cancelled", provider);
            result.stderr = "Cancelled".to_string();
        }
        CallError::Llm(e) if e.kind == LlmErrorKind::ParseError => {
            result.output = format!("Invalid response from {}: {}", provider, e.message);
        }
        CallError::Llm(e) => match e.status_code {
            Some(status) => {
                result.output = format!("HTTP {}: {}", status, e.message);
                result.retry_after = e.retry_after;
            }
            None => {
                result.output = format!("Request failed before response: {}", e.message);
            }
        },
    }
    result
}

#[async_trait]
impl Executor for ApiExecutor {
    fn id(&self) -> &str {
        self.id
    }

    async fn execute(
        &self,
        target: &BackendKind,
        request: ExecutionRequest,
        observer: Arc<dyn ExecutionObserver>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let Some(client) = self.client.as_deref() else {
            return ExecutionResult::failure(
                BackendError::MissingCredential(self.credential).to_string(),
                started.elapsed(),
            );
        };
        let Some(model) = target.model() else {
            return ExecutionResult::failure(
                BackendError::UnknownModel(target.to_string()).to_string(),
                started.elapsed(),
            );
        };

        if let Some(local) = &self.local {
            if !local.is_available().await {
                return ExecutionResult::failure(
                    format!(
                        "Request failed before response: Ollama is not reachable at {}",
                        local.base_url()
                    ),
                    started.elapsed(),
                );
            }
        }

        let deadline = started + request.timeout.max(Duration::from_millis(1));
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if let Some(system) = request.system_prompt.as_ref().filter(|s| !s.is_empty()) {
            messages.push(ChatMessage::new(Role::System, system.clone()));
        }
        messages.extend(request.history.iter().cloned());
        messages.push(ChatMessage::new(Role::User, request.prompt.clone()));

        info!(
            "Calling {} model {} (history={} messages, tools={})",
            client.provider(),
            model,
            request.history.len(),
            request.tool_set().map(|t| t.definitions.len()).unwrap_or(0)
        );

        let outcome = match request.tool_set() {
            Some(tools) => self
                .tool_loop(
                    client,
                    model,
                    &mut messages,
                    tools,
                    &request,
                    deadline,
                    observer.as_ref(),
                    &cancel,
                )
                .await
                .map(|(text, usage)| (text, Some(usage)))
                .map_err(|(e, usage)| (e, Some(usage))),
            None => self
                .single_turn(client, model, &messages, deadline, observer.as_ref(), &cancel)
                .await
                .map(|(text, usage)| {
                    messages.push(ChatMessage::new(Role::Assistant, text.clone()));
                    (text, usage)
                }),
        };

        match outcome {
            Ok((text, usage)) => {
                observer.on_event(ExecutionEvent::Result {
                    text: text.clone(),
                    session_id: None,
                });
                observer.on_event(ExecutionEvent::Progress {
                    fraction: Some(1.0),
                    message: "Complete".to_string(),
                });
                ExecutionResult {
                    output: text,
                    exit_code: 0,
                    duration: started.elapsed(),
                    usage,
                    history: Some(conversation(&messages)),
                    ..Default::default()
                }
            }
            Err((error, usage)) => error_result(error, client.provider(), started, usage),
        }
    }
}
