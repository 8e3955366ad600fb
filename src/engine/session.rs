//! Session continuity: when to resume, rotate, or start fresh, and
//! compaction of long HTTP conversation histories.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Dispatcher, ExecutionRequest, NullObserver};
use crate::llm::{ChatMessage, Role};
use crate::store::{Task, TaskStore};
use crate::util::truncate_chars;

/// What the next run does with the stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPlan {
    /// No continuity, or nothing stored yet
    Fresh,
    /// Continue this CLI session
    Resume(String),
    /// The session reached the rotation ceiling after this many runs
    Rotate { previous: String, runs: u64 },
}

impl SessionPlan {
    pub fn resume_id(&self) -> Option<&str> {
        match self {
            SessionPlan::Resume(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, SessionPlan::Resume(_))
    }
}

/// Decide from the number of runs that already used the stored session.
pub fn plan_for(task: &Task, runs_with_session: u64, rotation_runs: u64) -> SessionPlan {
    let Some(session_id) = task.session_id.as_ref().filter(|_| task.session_continuity) else {
        return SessionPlan::Fresh;
    };
    if runs_with_session >= rotation_runs {
        SessionPlan::Rotate {
            previous: session_id.clone(),
            runs: runs_with_session,
        }
    } else {
        SessionPlan::Resume(session_id.clone())
    }
}

/// Look up the session's run count and plan the next run.
pub async fn plan(
    store: &dyn TaskStore,
    task: &Task,
    rotation_runs: u64,
) -> Result<SessionPlan, String> {
    let Some(session_id) = task.session_id.as_deref().filter(|_| task.session_continuity) else {
        return Ok(SessionPlan::Fresh);
    };
    let runs = store.count_runs_with_session(task.id, session_id).await?;
    let plan = plan_for(task, runs, rotation_runs);
    if let SessionPlan::Rotate { previous, runs } = &plan {
        info!(task_id = %task.id, session_id = %previous, runs, "Rotating session");
    }
    Ok(plan)
}

/// Prior turns an HTTP backend should see, when continuity is on.
pub fn resumable_history(task: &Task) -> Option<&[ChatMessage]> {
    if !task.session_continuity {
        return None;
    }
    task.session_history
        .as_deref()
        .filter(|history| !history.is_empty())
}

pub fn needs_compaction(history: &[ChatMessage], threshold: usize) -> bool {
    threshold > 0 && history.len() >= threshold
}

const COMPACTION_INSTRUCTIONS: &str = "Summarize the conversation below so work can continue \
from the summary alone. Use these headings: Goals set, Workers created, Decisions made, \
Next intention. Be concise and keep concrete identifiers, paths and numbers.";

const TRANSCRIPT_MESSAGE_CHARS: usize = 2000;

fn transcript(history: &[ChatMessage]) -> String {
    history
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut line = format!(
                "[{}] {}",
                role,
                truncate_chars(message.text_content().unwrap_or(""), TRANSCRIPT_MESSAGE_CHARS)
            );
            for call in message.tool_calls.iter().flatten() {
                line.push_str(&format!(
                    "\n  -> {}({})",
                    call.function.name,
                    truncate_chars(&call.function.arguments, 200)
                ));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Request that asks `model` for a structured summary of `history`.
pub fn compaction_request(history: &[ChatMessage], model: &str, timeout: Duration) -> ExecutionRequest {
    let prompt = format!(
        "{}\n\n<conversation>\n{}\n</conversation>",
        COMPACTION_INSTRUCTIONS,
        transcript(history)
    );
    ExecutionRequest::new(prompt, model, timeout)
}

/// Replacement history seeded with `summary`.
pub fn compacted_history(summary: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::new(
            Role::User,
            format!("Summary of the earlier conversation:\n\n{}", summary.trim()),
        ),
        ChatMessage::new(Role::Assistant, "Understood. Continuing from this summary."),
    ]
}

/// Best effort: returns `None` and leaves the history alone on any failure.
pub async fn compact_history(
    dispatcher: &Dispatcher,
    model: &str,
    history: &[ChatMessage],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<Vec<ChatMessage>> {
    debug!("Compacting {} history messages with {}", history.len(), model);
    let request = compaction_request(history, model, timeout);
    let result = dispatcher
        .dispatch(request, Arc::new(NullObserver), cancel.child_token())
        .await;

    if !result.is_success() || result.output.trim().is_empty() {
        warn!(
            "History compaction failed, keeping {} messages: {}",
            history.len(),
            truncate_chars(&result.combined_output(), 200)
        );
        return None;
    }
    Some(compacted_history(&result.output))
}
