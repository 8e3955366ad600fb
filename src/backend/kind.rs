//! Model identifier parsing.
//!
//! Accepted forms:
//! - `claude`, `claude-code`, empty: Claude CLI with its default model
//! - `opus`, `sonnet`, `haiku`, `claude-*`, `claude:<model>`: Claude CLI with a model
//! - `station:<name>[:<model>]`: Claude CLI on a remote station
//! - `openai:<model>`, `gpt-*`, `o1*`, `o3*`, `o4*`: chat-completions API
//! - `anthropic:<model>`: messages API
//! - `ollama:<model>`: local daemon

use std::fmt;

use super::BackendError;

/// Where a model identifier routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    ClaudeCode { model: Option<String> },
    Station { station: String, model: Option<String> },
    OpenAi { model: String },
    Anthropic { model: String },
    Ollama { model: String },
}

/// Executor slot in the [`Dispatcher`](super::Dispatcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendFamily {
    ClaudeCode,
    Station,
    OpenAi,
    Anthropic,
    Ollama,
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendFamily::ClaudeCode => "claudecode",
            BackendFamily::Station => "station",
            BackendFamily::OpenAi => "openai",
            BackendFamily::Anthropic => "anthropic",
            BackendFamily::Ollama => "ollama",
        };
        f.write_str(name)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl BackendKind {
    pub fn parse(identifier: &str) -> Result<Self, BackendError> {
        let raw = identifier.trim();
        let lower = raw.to_ascii_lowercase();
        let unknown = || BackendError::UnknownModel(raw.to_string());

        if let Some((prefix, rest)) = raw.split_once(':') {
            return match prefix.to_ascii_lowercase().as_str() {
                "claude" | "claude-code" => Ok(BackendKind::ClaudeCode {
                    model: non_empty(rest),
                }),
                "station" => {
                    let (station, model) = match rest.split_once(':') {
                        Some((station, model)) => (station, non_empty(model)),
                        None => (rest, None),
                    };
                    let station = non_empty(station).ok_or_else(unknown)?;
                    Ok(BackendKind::Station { station, model })
                }
                "openai" => non_empty(rest)
                    .map(|model| BackendKind::OpenAi { model })
                    .ok_or_else(unknown),
                "anthropic" => non_empty(rest)
                    .map(|model| BackendKind::Anthropic { model })
                    .ok_or_else(unknown),
                "ollama" => non_empty(rest)
                    .map(|model| BackendKind::Ollama { model })
                    .ok_or_else(unknown),
                _ => Err(unknown()),
            };
        }

        match lower.as_str() {
            "" | "claude" | "claude-code" | "claude_code" => {
                Ok(BackendKind::ClaudeCode { model: None })
            }
            "opus" | "sonnet" | "haiku" => Ok(BackendKind::ClaudeCode {
                model: Some(lower),
            }),
            _ if lower.starts_with("claude-") => Ok(BackendKind::ClaudeCode {
                model: Some(raw.to_string()),
            }),
            _ if lower.starts_with("gpt-")
                || lower.starts_with("o1")
                || lower.starts_with("o3")
                || lower.starts_with("o4") =>
            {
                Ok(BackendKind::OpenAi {
                    model: raw.to_string(),
                })
            }
            _ => Err(unknown()),
        }
    }

    pub fn family(&self) -> BackendFamily {
        match self {
            BackendKind::ClaudeCode { .. } => BackendFamily::ClaudeCode,
            BackendKind::Station { .. } => BackendFamily::Station,
            BackendKind::OpenAi { .. } => BackendFamily::OpenAi,
            BackendKind::Anthropic { .. } => BackendFamily::Anthropic,
            BackendKind::Ollama { .. } => BackendFamily::Ollama,
        }
    }

    /// CLI backends keep an opaque session handle; HTTP backends keep turn history.
    pub fn is_cli(&self) -> bool {
        matches!(
            self,
            BackendKind::ClaudeCode { .. } | BackendKind::Station { .. }
        )
    }

    /// Model name passed to the backend itself.
    pub fn model(&self) -> Option<&str> {
        match self {
            BackendKind::ClaudeCode { model } | BackendKind::Station { model, .. } => {
                model.as_deref()
            }
            BackendKind::OpenAi { model }
            | BackendKind::Anthropic { model }
            | BackendKind::Ollama { model } => Some(model),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::ClaudeCode { model: None } => write!(f, "claude"),
            BackendKind::ClaudeCode { model: Some(m) } => write!(f, "claude:{}", m),
            BackendKind::Station {
                station,
                model: None,
            } => write!(f, "station:{}", station),
            BackendKind::Station {
                station,
                model: Some(m),
            } => write!(f, "station:{}:{}", station, m),
            BackendKind::OpenAi { model } => write!(f, "openai:{}", model),
            BackendKind::Anthropic { model } => write!(f, "anthropic:{}", model),
            BackendKind::Ollama { model } => write!(f, "ollama:{}", model),
        }
    }
}
