//! Client for a locally hosted Ollama daemon (`POST /api/chat`).

use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{parse_retry_after, LlmError};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, Role, TokenUsage, ToolCall, ToolDefinition};

const AVAILABILITY_TTL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

pub struct OllamaClient {
    client: Client,
    base_url: String,
    /// Last availability probe and its answer.
    availability: Mutex<Option<(Instant, bool)>>,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            availability: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the daemon answers on `/api/tags`. Cached for 30 seconds.
    pub async fn is_available(&self) -> bool {
        if let Ok(guard) = self.availability.lock() {
            if let Some((checked_at, available)) = *guard {
                if checked_at.elapsed() < AVAILABILITY_TTL {
                    return available;
                }
            }
        }

        let available = match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("Ollama probe at {} failed: {}", self.base_url, e);
                false
            }
        };

        if let Ok(mut guard) = self.availability.lock() {
            *guard = Some((Instant::now(), available));
        }
        available
    }

    /// Forget the cached availability answer.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.availability.lock() {
            *guard = None;
        }
    }

    fn request(model: &str, messages: &[ChatMessage], stream: bool) -> OllamaRequest {
        OllamaRequest {
            model: model.to_string(),
            messages: messages.iter().map(OllamaMessage::from).collect(),
            stream,
            tools: None,
        }
    }

    /// Stream content fragments until the daemon reports `done`.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<TextStream, LlmError> {
        let request = Self::request(model, messages, true);
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::from_reqwest(self.provider(), &e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), &body, retry_after));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = BytesMut::new();
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(LlmError::network_error(format!("ollama stream interrupted: {}", e)));
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line = buffer.split_to(pos + 1);
                    match parse_stream_line(&line) {
                        Some(StreamLine::Fragment(text)) => yield Ok(text),
                        Some(StreamLine::Done(text)) => {
                            if !text.is_empty() {
                                yield Ok(text);
                            }
                            break 'outer;
                        }
                        None => {}
                    }
                }
            }
            if !buffer.is_empty() {
                if let Some(StreamLine::Fragment(text) | StreamLine::Done(text)) = parse_stream_line(&buffer) {
                    if !text.is_empty() {
                        yield Ok(text);
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

enum StreamLine {
    Fragment(String),
    Done(String),
}

fn parse_stream_line(raw: &[u8]) -> Option<StreamLine> {
    let line = std::str::from_utf8(raw).ok()?.trim();
    if line.is_empty() {
        return None;
    }
    let chunk: OllamaResponse = serde_json::from_str(line).ok()?;
    let text = chunk.message.map(|m| m.content).unwrap_or_default();
    if chunk.done {
        Some(StreamLine::Done(text))
    } else {
        Some(StreamLine::Fragment(text))
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn provider(&self) -> &str {
        "ollama"
    }

    async fn chat_completion_with_options(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        _options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let mut request = Self::request(model, messages, false);
        request.tools = tools.filter(|t| !t.is_empty()).map(|t| t.to_vec());

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::from_reqwest(self.provider(), &e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &body, retry_after));
        }

        parse_body(&body, model)
    }
}

fn parse_body(body: &str, requested_model: &str) -> Result<ChatResponse, LlmError> {
    let parsed: OllamaResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::parse_error(format!("Failed to parse ollama response: {}", e)))?;
    let message = parsed.message.unwrap_or_default();

    let tool_calls: Vec<ToolCall> = message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(i, call)| {
            ToolCall::function(
                format!("call_{}", i),
                call.function.name,
                call.function.arguments.to_string(),
            )
        })
        .collect();

    let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
        (None, None) => None,
        (p, c) => Some(TokenUsage::new(p.unwrap_or(0), c.unwrap_or(0))),
    };

    Ok(ChatResponse {
        content: Some(message.content).filter(|c| !c.is_empty()),
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        finish_reason: parsed.done_reason,
        usage,
        model: parsed.model.or_else(|| Some(requested_model.to_string())),
    })
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

impl From<&ChatMessage> for OllamaMessage {
    fn from(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        Self {
            role: role.to_string(),
            content: msg.content.clone().unwrap_or_default(),
            tool_calls: msg
                .tool_calls
                .iter()
                .flatten()
                .map(|call| OllamaToolCall {
                    function: OllamaFunction {
                        name: call.function.name.clone(),
                        arguments: call.arguments_value(),
                    },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}
