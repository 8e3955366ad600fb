//! Task and run storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for tests and one-off runs)
//! - `sqlite`: SQLite database shared between processes
//!
//! The persisted `running` run is the only cross-process lock: creating a
//! run is a conditional insert that fails while another one is running.

mod memory;
mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::ChatMessage;
pub use crate::util::now_string;

/// Error written to runs left `running` by a process that died.
pub const STALE_RUN_ERROR: &str = "Interrupted: process exited before the run finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "paused" => TaskStatus::Paused,
            "completed" => TaskStatus::Completed,
            _ => TaskStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Scheduled,
    OneShot,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::OneShot => "one_shot",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "scheduled" => TriggerKind::Scheduled,
            "one_shot" => TriggerKind::OneShot,
            _ => TriggerKind::Manual,
        }
    }
}

/// A recurring or one-shot unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub prompt: String,
    pub worker_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub trigger: TriggerKind,
    pub status: TaskStatus,
    pub session_continuity: bool,
    /// Opaque CLI session handle
    pub session_id: Option<String>,
    /// Prior turns for HTTP backends
    #[serde(default)]
    pub session_history: Option<Vec<ChatMessage>>,
    /// Distilled methodology from earlier successful runs
    pub learned_context: Option<String>,
    pub run_count: u64,
    /// Reaching this many runs completes the task
    pub max_runs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = now_string();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            prompt: prompt.into(),
            worker_id: None,
            room_id: None,
            trigger: TriggerKind::Manual,
            status: TaskStatus::Active,
            session_continuity: false,
            session_id: None,
            session_history: None,
            learned_context: None,
            run_count: 0,
            max_runs: None,
            timeout_secs: None,
            max_turns: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// A reusable persona attachable to tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    /// Used for tasks that name no worker
    pub is_default: bool,
}

/// A tenant grouping tasks, with its own concurrency limit and fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub max_concurrent: Option<u32>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            _ => RunStatus::Failed,
        }
    }
}

/// One execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub progress: Option<f64>,
    pub progress_message: Option<String>,
    pub session_id: Option<String>,
    pub timed_out: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TaskRun {
    fn started(task_id: Uuid, session_id: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            started_at: now_string(),
            finished_at: None,
            status: RunStatus::Running,
            result: None,
            error_message: None,
            duration_ms: None,
            progress: None,
            progress_message: None,
            session_id: session_id.map(|s| s.to_string()),
            timed_out: false,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Final state written to a run exactly once.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    pub timed_out: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleKind {
    ToolCall,
    AssistantText,
    ToolResult,
    Result,
    Error,
}

impl ConsoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleKind::ToolCall => "tool_call",
            ConsoleKind::AssistantText => "assistant_text",
            ConsoleKind::ToolResult => "tool_result",
            ConsoleKind::Result => "result",
            ConsoleKind::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "tool_call" => ConsoleKind::ToolCall,
            "assistant_text" => ConsoleKind::AssistantText,
            "tool_result" => ConsoleKind::ToolResult,
            "result" => ConsoleKind::Result,
            _ => ConsoleKind::Error,
        }
    }
}

/// One line of a run's console log. `seq` strictly increases per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLogEntry {
    pub run_id: Uuid,
    pub seq: u64,
    pub kind: ConsoleKind,
    pub content: String,
    pub created_at: String,
}

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    // === Tasks, workers, rooms, settings ===

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, String>;

    /// Insert or replace a task.
    async fn save_task(&self, task: &Task) -> Result<(), String>;

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), String>;

    async fn set_task_session_id(&self, id: Uuid, session_id: Option<&str>) -> Result<(), String>;

    async fn set_session_history(
        &self,
        id: Uuid,
        history: Option<&[ChatMessage]>,
    ) -> Result<(), String>;

    async fn set_learned_context(&self, id: Uuid, context: &str) -> Result<(), String>;

    /// Increment `run_count` and return the new value.
    async fn increment_run_count(&self, id: Uuid) -> Result<u64, String>;

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, String>;

    async fn default_worker(&self) -> Result<Option<Worker>, String>;

    async fn save_worker(&self, worker: &Worker) -> Result<(), String>;

    async fn get_room(&self, id: Uuid) -> Result<Option<Room>, String>;

    async fn save_room(&self, room: &Room) -> Result<(), String>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, String>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), String>;

    // === Runs ===

    async fn running_run_for_task(&self, task_id: Uuid) -> Result<Option<TaskRun>, String>;

    /// Create a `running` run unless one already exists for the task.
    /// Returns `None` when another run holds the task.
    async fn create_run(
        &self,
        task_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<Option<TaskRun>, String>;

    async fn update_run_progress(
        &self,
        run_id: Uuid,
        fraction: Option<f64>,
        message: &str,
    ) -> Result<(), String>;

    async fn finish_run(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<(), String>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<TaskRun>, String>;

    /// Most recent runs first.
    async fn list_runs(&self, task_id: Uuid, limit: usize) -> Result<Vec<TaskRun>, String>;

    /// Number of runs of `task_id` that used `session_id`.
    async fn count_runs_with_session(&self, task_id: Uuid, session_id: &str)
        -> Result<u64, String>;

    /// Mark `running` runs started before `older_than` as failed.
    async fn fail_stale_runs(&self, older_than: DateTime<Utc>) -> Result<usize, String>;

    // === Console log ===

    async fn append_console_logs(&self, entries: &[ConsoleLogEntry]) -> Result<(), String>;

    async fn list_console_logs(&self, run_id: Uuid) -> Result<Vec<ConsoleLogEntry>, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_parse_back() {
        for status in [TaskStatus::Active, TaskStatus::Paused, TaskStatus::Completed] {
            assert_eq!(TaskStatus::parse(status.as_str()), status);
        }
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(status.as_str()), status);
        }
        for kind in [
            ConsoleKind::ToolCall,
            ConsoleKind::AssistantText,
            ConsoleKind::ToolResult,
            ConsoleKind::Result,
            ConsoleKind::Error,
        ] {
            assert_eq!(ConsoleKind::parse(kind.as_str()), kind);
        }
        assert_eq!(TriggerKind::parse("one_shot"), TriggerKind::OneShot);
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new("digest", "summarize inbox");
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.run_count, 0);
        assert!(!task.session_continuity);
        assert_eq!(task.trigger, TriggerKind::Manual);
    }
}
