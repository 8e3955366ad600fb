//! In-memory task store (non-persistent).

use super::{
    now_string, ConsoleLogEntry, Room, RunOutcome, RunStatus, Task, TaskRun, TaskStatus,
    TaskStore, Worker, STALE_RUN_ERROR,
};
use crate::llm::ChatMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, Task>,
    workers: HashMap<Uuid, Worker>,
    rooms: HashMap<Uuid, Room>,
    settings: HashMap<String, String>,
    runs: HashMap<Uuid, TaskRun>,
    console: HashMap<Uuid, Vec<ConsoleLogEntry>>,
}

/// All state sits behind one lock so run creation is atomic.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn with_task<T>(
    state: &mut State,
    id: Uuid,
    f: impl FnOnce(&mut Task) -> T,
) -> Result<T, String> {
    let task = state
        .tasks
        .get_mut(&id)
        .ok_or_else(|| format!("Task {} not found", id))?;
    let out = f(task);
    task.updated_at = now_string();
    Ok(out)
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, String> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<(), String> {
        self.state.write().await.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), String> {
        with_task(&mut *self.state.write().await, id, |t| t.status = status)
    }

    async fn set_task_session_id(&self, id: Uuid, session_id: Option<&str>) -> Result<(), String> {
        with_task(&mut *self.state.write().await, id, |t| {
            t.session_id = session_id.map(|s| s.to_string())
        })
    }

    async fn set_session_history(
        &self,
        id: Uuid,
        history: Option<&[ChatMessage]>,
    ) -> Result<(), String> {
        with_task(&mut *self.state.write().await, id, |t| {
            t.session_history = history.map(|h| h.to_vec())
        })
    }

    async fn set_learned_context(&self, id: Uuid, context: &str) -> Result<(), String> {
        with_task(&mut *self.state.write().await, id, |t| {
            t.learned_context = Some(context.to_string())
        })
    }

    async fn increment_run_count(&self, id: Uuid) -> Result<u64, String> {
        with_task(&mut *self.state.write().await, id, |t| {
            t.run_count += 1;
            t.run_count
        })
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, String> {
        Ok(self.state.read().await.workers.get(&id).cloned())
    }

    async fn default_worker(&self) -> Result<Option<Worker>, String> {
        Ok(self
            .state
            .read()
            .await
            .workers
            .values()
            .find(|w| w.is_default)
            .cloned())
    }

    async fn save_worker(&self, worker: &Worker) -> Result<(), String> {
        self.state
            .write()
            .await
            .workers
            .insert(worker.id, worker.clone());
        Ok(())
    }

    async fn get_room(&self, id: Uuid) -> Result<Option<Room>, String> {
        Ok(self.state.read().await.rooms.get(&id).cloned())
    }

    async fn save_room(&self, room: &Room) -> Result<(), String> {
        self.state.write().await.rooms.insert(room.id, room.clone());
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, String> {
        Ok(self.state.read().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), String> {
        self.state
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn running_run_for_task(&self, task_id: Uuid) -> Result<Option<TaskRun>, String> {
        Ok(self
            .state
            .read()
            .await
            .runs
            .values()
            .find(|r| r.task_id == task_id && r.status == RunStatus::Running)
            .cloned())
    }

    async fn create_run(
        &self,
        task_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<Option<TaskRun>, String> {
        let mut state = self.state.write().await;
        let busy = state
            .runs
            .values()
            .any(|r| r.task_id == task_id && r.status == RunStatus::Running);
        if busy {
            return Ok(None);
        }
        let run = TaskRun::started(task_id, session_id);
        state.runs.insert(run.id, run.clone());
        Ok(Some(run))
    }

    async fn update_run_progress(
        &self,
        run_id: Uuid,
        fraction: Option<f64>,
        message: &str,
    ) -> Result<(), String> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| format!("Run {} not found", run_id))?;
        if fraction.is_some() {
            run.progress = fraction;
        }
        run.progress_message = Some(message.to_string());
        Ok(())
    }

    async fn finish_run(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<(), String> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| format!("Run {} not found", run_id))?;
        run.status = outcome.status;
        run.finished_at = Some(now_string());
        run.result = outcome.result.clone();
        run.error_message = outcome.error_message.clone();
        run.duration_ms = Some(outcome.duration_ms);
        if outcome.session_id.is_some() {
            run.session_id = outcome.session_id.clone();
        }
        run.timed_out = outcome.timed_out;
        run.input_tokens = outcome.input_tokens;
        run.output_tokens = outcome.output_tokens;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<TaskRun>, String> {
        Ok(self.state.read().await.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, task_id: Uuid, limit: usize) -> Result<Vec<TaskRun>, String> {
        let mut runs: Vec<TaskRun> = self
            .state
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn count_runs_with_session(
        &self,
        task_id: Uuid,
        session_id: &str,
    ) -> Result<u64, String> {
        Ok(self
            .state
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.task_id == task_id && r.session_id.as_deref() == Some(session_id))
            .count() as u64)
    }

    async fn fail_stale_runs(&self, older_than: DateTime<Utc>) -> Result<usize, String> {
        let cutoff = crate::util::format_timestamp(older_than);
        let now = now_string();
        let mut count = 0;
        for run in self.state.write().await.runs.values_mut() {
            if run.status == RunStatus::Running && run.started_at < cutoff {
                run.status = RunStatus::Failed;
                run.error_message = Some(STALE_RUN_ERROR.to_string());
                run.finished_at = Some(now.clone());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn append_console_logs(&self, entries: &[ConsoleLogEntry]) -> Result<(), String> {
        let mut state = self.state.write().await;
        for entry in entries {
            state
                .console
                .entry(entry.run_id)
                .or_default()
                .push(entry.clone());
        }
        Ok(())
    }

    async fn list_console_logs(&self, run_id: Uuid) -> Result<Vec<ConsoleLogEntry>, String> {
        let mut entries = self
            .state
            .read()
            .await
            .console
            .get(&run_id)
            .cloned()
            .unwrap_or_default();
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }
}
