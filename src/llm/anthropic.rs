//! Anthropic messages API client (header API-key auth).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{parse_retry_after, LlmError};
use super::{
    ChatMessage, ChatOptions, ChatResponse, LlmClient, Role, TokenUsage, ToolCall, ToolDefinition,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 8192;

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn parse_body(body: &str, requested_model: &str) -> Result<ChatResponse, LlmError> {
        let parsed: MessagesResponse = serde_json::from_str(body).map_err(|e| {
            LlmError::parse_error(format!(
                "Failed to parse response: {}, body: {}",
                e,
                crate::util::truncate_chars(body, 500)
            ))
        })?;

        let mut text = Vec::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ResponseBlock::Text { text: t } => text.push(t),
                ResponseBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall::function(id, name, input.to_string()))
                }
                ResponseBlock::Other => {}
            }
        }

        Ok(ChatResponse {
            content: if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            },
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            finish_reason: parsed.stop_reason,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            model: parsed.model.or_else(|| Some(requested_model.to_string())),
        })
    }
}

/// Split OpenAI-shaped history into the `system` string and content-block messages.
///
/// Consecutive tool results are merged into one user turn, which is what the
/// messages API expects after an assistant `tool_use` turn.
fn to_anthropic_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<RequestMessage>) {
    let mut system_parts = Vec::new();
    let mut out: Vec<RequestMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                if let Some(text) = msg.text_content() {
                    system_parts.push(text.to_string());
                }
            }
            Role::User => out.push(RequestMessage {
                role: "user",
                content: vec![RequestBlock::Text {
                    text: msg.content.clone().unwrap_or_default(),
                }],
            }),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if let Some(text) = msg.text_content().filter(|t| !t.is_empty()) {
                    blocks.push(RequestBlock::Text {
                        text: text.to_string(),
                    });
                }
                for call in msg.tool_calls.iter().flatten() {
                    blocks.push(RequestBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: call.arguments_value(),
                    });
                }
                out.push(RequestMessage {
                    role: "assistant",
                    content: blocks,
                });
            }
            Role::Tool => {
                let block = RequestBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone().unwrap_or_default(),
                };
                match out.last_mut() {
                    Some(last)
                        if last.role == "user"
                            && last
                                .content
                                .iter()
                                .all(|b| matches!(b, RequestBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block)
                    }
                    _ => out.push(RequestMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, out)
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    async fn chat_completion_with_options(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let (system, messages) = to_anthropic_messages(messages);
        let request = MessagesRequest {
            model: model.to_string(),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            tools: tools.filter(|t| !t.is_empty()).map(|defs| {
                defs.iter()
                    .map(|d| RequestTool {
                        name: d.function.name.clone(),
                        description: d.function.description.clone(),
                        input_schema: d.function.parameters.clone(),
                    })
                    .collect()
            }),
            messages,
            temperature: options.temperature,
        };

        tracing::debug!("Sending request to Anthropic: model={}", model);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
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

        Self::parse_body(&body, model)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<RequestTool>>,
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct RequestTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: Vec<RequestBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}
