//! NDJSON event types emitted by the Claude CLI in `stream-json` mode, and
//! the state machine that turns them into [`ExecutionEvent`]s.
//!
//! The same protocol is spoken locally and on remote stations.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::events::ExecutionEvent;
use crate::llm::TokenUsage;

// ── NDJSON event types ────────────────────────────────────────────

/// Events emitted by the CLI in stream-json mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CliEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "assistant")]
    Assistant(AssistantEvent),
    #[serde(rename = "user")]
    User(UserEvent),
    #[serde(rename = "result")]
    Result(ResultEvent),
    /// Stream deltas, rate-limit notices and future event types.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: MessageBody,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEvent {
    pub message: MessageBody,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        /// Content can be a string (text result) or an array (e.g., image results).
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Tool result content: a simple string or structured blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Structured(Vec<Value>),
}

impl ToolResultContent {
    /// Convert to a string for the console log. Images become a placeholder.
    pub fn to_string_lossy(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Structured(items) => {
                let mut parts = Vec::new();
                for item in items {
                    if let Some(obj) = item.as_object() {
                        if obj.get("type").and_then(|v| v.as_str()) == Some("image") {
                            parts.push("[image]".to_string());
                        } else if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                            parts.push(text.to_string());
                        }
                    }
                }
                if parts.is_empty() {
                    serde_json::to_string(items)
                        .unwrap_or_else(|_| "[structured content]".to_string())
                } else {
                    parts.join("\n")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub usage: Option<ResultUsage>,
    /// Session errors land here on some CLI versions.
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl ResultEvent {
    pub fn is_failure(&self) -> bool {
        self.is_error || self.subtype.starts_with("error")
    }

    /// Best available error text. Embedded API error JSON
    /// (`429 {"type":"error","error":{...}}`) is kept verbatim so rate-limit
    /// phrasing stays visible to the detector.
    pub fn error_message(&self) -> String {
        self.result
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.errors.first().map(|s| s.as_str()).filter(|s| !s.is_empty()))
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("CLI reported {}", self.subtype))
    }
}

// ── Event conversion ──────────────────────────────────────────────

/// Accumulates the outcome of one CLI run while converting its events.
#[derive(Debug, Default)]
pub struct StreamState {
    pending_tools: HashMap<String, String>,
    tool_calls: u32,
    assistant_text: Vec<String>,
    /// Text of the final `result` event.
    pub result_text: Option<String>,
    pub session_id: Option<String>,
    pub usage: Option<TokenUsage>,
    /// Set when the result event reports an error.
    pub error: Option<String>,
}

impl StreamState {
    /// Parse one stdout line. Unparseable lines produce no events.
    pub fn apply_line(&mut self, line: &str) -> Vec<ExecutionEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<CliEvent>(line) {
            Ok(event) => self.apply(event),
            Err(e) => {
                debug!(
                    "Skipping unparseable CLI line: {} - {}",
                    e,
                    crate::util::truncate_chars(line, 200)
                );
                Vec::new()
            }
        }
    }

    pub fn apply(&mut self, event: CliEvent) -> Vec<ExecutionEvent> {
        let mut results = vec![];

        match event {
            CliEvent::System(sys) => {
                debug!(
                    "CLI session initialized: subtype={}, session_id={:?}, model={:?}",
                    sys.subtype, sys.session_id, sys.model
                );
                if self.session_id.is_none() {
                    self.session_id = sys.session_id;
                }
            }

            CliEvent::Assistant(evt) => {
                for block in evt.message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                self.assistant_text.push(text.clone());
                                results.push(ExecutionEvent::AssistantText { text });
                            }
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            self.tool_calls += 1;
                            self.pending_tools.insert(id.clone(), name.clone());
                            let message = format!("Step {}: Using {}...", self.tool_calls, name);
                            results.push(ExecutionEvent::ToolCall { id, name, input });
                            results.push(ExecutionEvent::Progress {
                                fraction: None,
                                message,
                            });
                        }
                        ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
                    }
                }
            }

            CliEvent::User(evt) => {
                for block in evt.message.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        let name = self
                            .pending_tools
                            .get(&tool_use_id)
                            .cloned()
                            .unwrap_or_else(|| "unknown".to_string());
                        results.push(ExecutionEvent::ToolResult {
                            id: tool_use_id,
                            name,
                            content: content.map(|c| c.to_string_lossy()).unwrap_or_default(),
                            is_error,
                        });
                    }
                }
            }

            CliEvent::Result(res) => {
                debug!(
                    "CLI result: subtype={}, duration={:?}ms, turns={:?}",
                    res.subtype, res.duration_ms, res.num_turns
                );
                if res.session_id.is_some() {
                    self.session_id = res.session_id.clone();
                }
                self.usage = res
                    .usage
                    .as_ref()
                    .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens));

                if res.is_failure() {
                    self.error = Some(res.error_message());
                    results.push(ExecutionEvent::Progress {
                        fraction: Some(1.0),
                        message: "Failed".to_string(),
                    });
                } else {
                    let text = res.result.clone().unwrap_or_default();
                    self.result_text = Some(text.clone());
                    results.push(ExecutionEvent::Result {
                        text,
                        session_id: self.session_id.clone(),
                    });
                    results.push(ExecutionEvent::Progress {
                        fraction: Some(1.0),
                        message: "Complete".to_string(),
                    });
                }
            }

            CliEvent::Other => {}
        }

        results
    }

    /// Final textual output: the result event, else an error, else assistant text.
    pub fn output(&self) -> String {
        if let Some(text) = &self.result_text {
            return text.clone();
        }
        if let Some(err) = &self.error {
            return err.clone();
        }
        self.assistant_text.join("\n")
    }

    pub fn tool_calls(&self) -> u32 {
        self.tool_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_content_structured_text_items_joined() {
        let content = ToolResultContent::Structured(vec![
            json!({"type": "text", "text": "line1"}),
            json!({"type": "image", "source": {}}),
        ]);
        assert_eq!(content.to_string_lossy(), "line1\n[image]");
    }

    #[test]
    fn tool_use_increments_step_counter() {
        let mut state = StreamState::default();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}},{"type":"tool_use","id":"t2","name":"Read","input":{}}]},"session_id":"s"}"#;
        let events = state.apply_line(line);
        assert_eq!(state.tool_calls(), 2);
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::Progress { message, .. } => Some(message.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec!["Step 1: Using Bash...", "Step 2: Using Read..."]);
    }

    #[test]
    fn user_tool_result_looks_up_tool_name() {
        let mut state = StreamState::default();
        state.apply_line(r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Grep","input":{}}]}}"#);
        let events = state.apply_line(r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"3 matches","is_error":false}]}}"#);
        assert_eq!(
            events,
            vec![ExecutionEvent::ToolResult {
                id: "t1".into(),
                name: "Grep".into(),
                content: "3 matches".into(),
                is_error: false,
            }]
        );
    }

    #[test]
    fn result_event_captures_text_session_and_usage() {
        let mut state = StreamState::default();
        let events = state.apply_line(r#"{"type":"result","subtype":"success","result":"All done","session_id":"sess-9","is_error":false,"usage":{"input_tokens":100,"output_tokens":20}}"#);
        assert_eq!(state.output(), "All done");
        assert_eq!(state.session_id.as_deref(), Some("sess-9"));
        assert_eq!(state.usage, Some(TokenUsage::new(100, 20)));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::Progress { fraction: Some(f), .. }) if *f == 1.0
        ));
    }

    #[test]
    fn error_result_is_recorded_not_reported_as_result() {
        let mut state = StreamState::default();
        let events = state.apply_line(r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"API Error: 429 {\"type\":\"error\",\"error\":{\"type\":\"rate_limit_error\"}}"}"#);
        assert!(!events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::Result { .. })));
        assert!(matches!(
            events.as_slice(),
            [ExecutionEvent::Progress { fraction: Some(f), message }] if *f == 1.0 && message == "Failed"
        ));
        assert!(state.error.as_deref().unwrap().contains("rate_limit_error"));
        assert!(state.output().contains("429"));
    }

    #[test]
    fn garbage_and_unknown_events_are_skipped() {
        let mut state = StreamState::default();
        assert!(state.apply_line("not json at all").is_empty());
        assert!(state.apply_line(r#"{"type":"stream_event","event":{}}"#).is_empty());
        assert!(state.apply_line("").is_empty());
        assert_eq!(state.output(), "");
    }

    #[test]
    fn system_init_supplies_session_fallback() {
        let mut state = StreamState::default();
        state.apply_line(r#"{"type":"system","subtype":"init","session_id":"init-1","model":"opus"}"#);
        assert_eq!(state.session_id.as_deref(), Some("init-1"));
    }
}
