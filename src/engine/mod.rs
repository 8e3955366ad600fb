//! Task execution engine.
//!
//! [`TaskEngine::execute_task`] owns a run's whole lifecycle: eligibility
//! checks, admission through the [`ConcurrencyLimiter`], prompt assembly,
//! dispatch with rate-limit retries, the fresh-session fallback, and
//! finalization (run record, console log, session, artifact, memory, run
//! count, distillation, auto-pause).

pub mod artifact;
pub mod console;
pub mod failure;
pub mod limiter;
pub mod prompt;
pub mod rate_limit;
pub mod session;

pub use console::{LiveTail, RunConsole};
pub use limiter::{ConcurrencyLimiter, SlotPermit, SlotScope};
pub use rate_limit::{detect_rate_limit, RateLimitInfo};
pub use session::SessionPlan;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{
    BackendKind, Dispatcher, ExecutionObserver, ExecutionRequest, ExecutionResult, HistoryHook,
    ToolSet,
};
use crate::config::{clamp_concurrency, Config};
use crate::llm::ChatMessage;
use crate::memory::{Collaborators, RunRecord};
use crate::store::{ConsoleKind, RunOutcome, RunStatus, Task, TaskStatus, TaskStore};
use crate::util::{sanitize_tool_list, truncate_chars};

use artifact::ArtifactStatus;
use prompt::PromptContext;
use rate_limit::RetryOutcome;

/// Setting holding the concurrency limit for roomless tasks.
pub const MAX_CONCURRENT_SETTING: &str = "max_concurrent_tasks";

const ERROR_MESSAGE_CHARS: usize = 2000;
const MEMORY_SUMMARY_CHARS: usize = 500;
const INTERRUPTED: &str = "Interrupted before completion";

/// Why a task was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Task is already running in this process")]
    AlreadyRunning,

    #[error("Task already has a running run (possibly in another process)")]
    RunningElsewhere,

    #[error("Task not found")]
    NotFound,

    #[error("Task is {} and cannot run", .0.as_str())]
    NotActive(TaskStatus),
}

/// Outcome of [`TaskEngine::execute_task`].
#[derive(Debug, Clone, Default)]
pub struct TaskExecutionResult {
    pub success: bool,
    pub output: String,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub artifact_path: Option<PathBuf>,
    /// Set when a precondition rejected the task; no run was created.
    pub rejection: Option<Rejection>,
    pub run_id: Option<Uuid>,
    /// Backoff sleeps taken across all attempts.
    pub rate_limit_waits: u32,
}

impl TaskExecutionResult {
    fn rejected(rejection: Rejection, started: Instant) -> Self {
        Self {
            error_message: Some(rejection.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
            rejection: Some(rejection),
            ..Default::default()
        }
    }

    fn error(message: impl Into<String>, started: Instant) -> Self {
        Self {
            error_message: Some(message.into()),
            duration_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        }
    }
}

struct RunningEntry {
    room_id: Option<Uuid>,
    cancel: CancellationToken,
}

type RunningMap = Arc<Mutex<HashMap<Uuid, RunningEntry>>>;

fn lock_running(running: &RunningMap) -> MutexGuard<'_, HashMap<Uuid, RunningEntry>> {
    running.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes the task from the in-process running set on drop.
struct RunningGuard {
    running: RunningMap,
    task_id: Uuid,
}

impl RunningGuard {
    fn set_room(&self, room_id: Option<Uuid>) {
        if let Some(entry) = lock_running(&self.running).get_mut(&self.task_id) {
            entry.room_id = room_id;
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock_running(&self.running).remove(&self.task_id);
    }
}

/// Fails the run if `execute_task` is dropped before the run is finalized.
struct PendingRun {
    store: Arc<dyn TaskStore>,
    task_id: Uuid,
    run_id: Uuid,
    started: Instant,
    finished: bool,
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(run_id = %self.run_id, "Run abandoned outside a runtime, left running");
            return;
        };
        warn!(task_id = %self.task_id, run_id = %self.run_id, "Run abandoned before completion");
        let store = self.store.clone();
        let run_id = self.run_id;
        let outcome = RunOutcome {
            status: RunStatus::Failed,
            result: None,
            error_message: Some(INTERRUPTED.to_string()),
            duration_ms: self.started.elapsed().as_millis() as u64,
            session_id: None,
            timed_out: false,
            input_tokens: 0,
            output_tokens: 0,
        };
        handle.spawn(async move {
            if let Err(e) = store.finish_run(run_id, &outcome).await {
                error!(run_id = %run_id, "Failed to fail abandoned run: {}", e);
            }
        });
    }
}

/// Persists HTTP conversation history after every tool exchange.
struct StoreHistoryHook {
    store: Arc<dyn TaskStore>,
    task_id: Uuid,
}

#[async_trait]
impl HistoryHook for StoreHistoryHook {
    async fn update(&self, history: &[ChatMessage]) {
        if let Err(e) = self.store.set_session_history(self.task_id, Some(history)).await {
            warn!(task_id = %self.task_id, "Failed to persist session history: {}", e);
        }
    }
}

/// Effective persona and model for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Persona {
    system_prompt: Option<String>,
    model: String,
    max_slots: u32,
}

/// Orchestrates task runs. Cheap to share behind an `Arc`.
pub struct TaskEngine {
    config: Arc<Config>,
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
    collaborators: Collaborators,
    limiter: ConcurrencyLimiter,
    running: RunningMap,
    tail: Option<Arc<dyn LiveTail>>,
    tools: Option<ToolSet>,
}

impl TaskEngine {
    pub fn new(config: Arc<Config>, store: Arc<dyn TaskStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            store,
            dispatcher,
            collaborators: Collaborators::default(),
            limiter: ConcurrencyLimiter::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            tail: None,
            tools: None,
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Share a limiter with other engines in the same process.
    pub fn with_limiter(mut self, limiter: ConcurrencyLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_live_tail(mut self, tail: Arc<dyn LiveTail>) -> Self {
        self.tail = Some(tail);
        self
    }

    /// Tools offered to HTTP backends.
    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        lock_running(&self.running).contains_key(&task_id)
    }

    /// Cancel a task executing in this process. Returns whether it was running.
    pub fn cancel_task(&self, task_id: Uuid) -> bool {
        match lock_running(&self.running).get(&task_id) {
            Some(entry) => {
                info!(task_id = %task_id, "Cancelling task");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every task of `room_id` executing in this process.
    pub fn cancel_room(&self, room_id: Uuid) -> usize {
        let running = lock_running(&self.running);
        let mut cancelled = 0;
        for entry in running.values().filter(|e| e.room_id == Some(room_id)) {
            entry.cancel.cancel();
            cancelled += 1;
        }
        info!(room_id = %room_id, cancelled, "Cancelled room tasks");
        cancelled
    }

    fn claim(&self, task_id: Uuid, cancel: CancellationToken) -> Option<RunningGuard> {
        let mut running = lock_running(&self.running);
        if running.contains_key(&task_id) {
            return None;
        }
        running.insert(
            task_id,
            RunningEntry {
                room_id: None,
                cancel,
            },
        );
        Some(RunningGuard {
            running: self.running.clone(),
            task_id,
        })
    }

    /// Worker, then default worker, then room, then configuration.
    async fn resolve_persona(&self, task: &Task) -> Persona {
        let assigned = match task.worker_id {
            Some(worker_id) => self.store.get_worker(worker_id).await.unwrap_or_else(|e| {
                warn!(task_id = %task.id, "Failed to load worker {}: {}", worker_id, e);
                None
            }),
            None => None,
        };
        let worker = match assigned {
            Some(worker) => Some(worker),
            None => self.store.default_worker().await.unwrap_or_else(|e| {
                warn!("Failed to load default worker: {}", e);
                None
            }),
        };

        let room = match task.room_id {
            Some(room_id) => self.store.get_room(room_id).await.unwrap_or_else(|e| {
                warn!(task_id = %task.id, "Failed to load room {}: {}", room_id, e);
                None
            }),
            None => None,
        };

        let system_prompt = worker
            .as_ref()
            .and_then(|w| w.system_prompt.clone())
            .or_else(|| room.as_ref().and_then(|r| r.system_prompt.clone()))
            .filter(|s| !s.trim().is_empty());
        let model = worker
            .as_ref()
            .and_then(|w| w.model.clone())
            .or_else(|| room.as_ref().and_then(|r| r.model.clone()))
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());

        let max_slots = match room.as_ref().and_then(|r| r.max_concurrent) {
            Some(limit) => clamp_concurrency(limit),
            None => self.global_max_concurrent().await,
        };

        Persona {
            system_prompt,
            model,
            max_slots,
        }
    }

    async fn global_max_concurrent(&self) -> u32 {
        let configured = match self.store.get_setting(MAX_CONCURRENT_SETTING).await {
            Ok(Some(value)) => value.trim().parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid {} setting: {}", MAX_CONCURRENT_SETTING, value);
                self.config.max_concurrent
            }),
            Ok(None) => self.config.max_concurrent,
            Err(e) => {
                warn!("Failed to read {} setting: {}", MAX_CONCURRENT_SETTING, e);
                self.config.max_concurrent
            }
        };
        clamp_concurrency(configured)
    }

    fn build_request(
        &self,
        task: &Task,
        persona: &Persona,
        prompt: String,
        resume_session_id: Option<String>,
        history: Vec<ChatMessage>,
    ) -> ExecutionRequest {
        let timeout = task
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_timeout);

        let mut request = ExecutionRequest::new(prompt, persona.model.clone(), timeout);
        request.system_prompt = persona.system_prompt.clone();
        request.resume_session_id = resume_session_id;
        request.max_turns = task.max_turns;
        request.allowed_tools = sanitize_tool_list(&task.allowed_tools);
        request.disallowed_tools = sanitize_tool_list(&task.disallowed_tools);
        request.tools = self.tools.clone();
        request.history = history;
        if task.session_continuity {
            request.history_hook = Some(Arc::new(StoreHistoryHook {
                store: self.store.clone(),
                task_id: task.id,
            }));
        }
        request
    }

    /// Dispatch `request`, retrying while the backend reports rate limits.
    async fn dispatch_with_retry(
        &self,
        request: ExecutionRequest,
        console: &Arc<RunConsole>,
        cancel: &CancellationToken,
    ) -> RetryOutcome {
        let max_retries = self.config.rate_limit.max_retries;
        let observer: Arc<dyn ExecutionObserver> = console.clone();
        let dispatcher = &self.dispatcher;

        rate_limit::run_with_retry(
            &self.config.rate_limit,
            cancel,
            |info, attempt| {
                let message = rate_limit::wait_message(info, attempt, max_retries);
                console.log(ConsoleKind::Error, message.clone());
                console.progress(None, message);
            },
            || {
                let request = request.clone();
                let observer = observer.clone();
                let cancel = cancel.clone();
                async move { dispatcher.dispatch(request, observer, cancel).await }
            },
        )
        .await
    }

    /// Prior HTTP turns to send, compacted first when they grew too long.
    async fn prepare_history(&self, task: &Task, model: &str, cancel: &CancellationToken) -> Vec<ChatMessage> {
        let is_cli = BackendKind::parse(model).map(|k| k.is_cli()).unwrap_or(true);
        if is_cli {
            return Vec::new();
        }
        let Some(history) = session::resumable_history(task) else {
            return Vec::new();
        };

        if session::needs_compaction(history, self.config.history_compact_messages) {
            if let Some(compacted) = session::compact_history(
                &self.dispatcher,
                model,
                history,
                self.config.default_timeout,
                cancel,
            )
            .await
            {
                info!(
                    task_id = %task.id,
                    before = history.len(),
                    after = compacted.len(),
                    "Compacted session history"
                );
                if let Err(e) = self.store.set_session_history(task.id, Some(&compacted)).await {
                    warn!(task_id = %task.id, "Failed to store compacted history: {}", e);
                }
                return compacted;
            }
        }
        history.to_vec()
    }

    /// Run one task end to end.
    pub async fn execute_task(&self, task_id: Uuid) -> TaskExecutionResult {
        let started = Instant::now();
        let cancel = CancellationToken::new();

        let Some(guard) = self.claim(task_id, cancel.clone()) else {
            debug!(task_id = %task_id, "Rejected: already running in this process");
            return TaskExecutionResult::rejected(Rejection::AlreadyRunning, started);
        };

        match self.store.running_run_for_task(task_id).await {
            Ok(Some(run)) => {
                warn!(task_id = %task_id, run_id = %run.id, "Rejected: a running run already exists");
                return TaskExecutionResult::rejected(Rejection::RunningElsewhere, started);
            }
            Ok(None) => {}
            Err(e) => return TaskExecutionResult::error(format!("Failed to check runs: {}", e), started),
        }

        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return TaskExecutionResult::rejected(Rejection::NotFound, started),
            Err(e) => return TaskExecutionResult::error(format!("Failed to load task: {}", e), started),
        };
        if task.status != TaskStatus::Active {
            return TaskExecutionResult::rejected(Rejection::NotActive(task.status), started);
        }
        guard.set_room(task.room_id);

        let persona = self.resolve_persona(&task).await;
        let scope = SlotScope::for_room(task.room_id);
        let Some(_permit) = self.limiter.acquire(scope, persona.max_slots, &cancel).await else {
            info!(task_id = %task.id, "Cancelled while waiting for a concurrency slot");
            return TaskExecutionResult::error("Cancelled", started);
        };

        let plan = session::plan(self.store.as_ref(), &task, self.config.session_rotation_runs)
            .await
            .unwrap_or_else(|e| {
                warn!(task_id = %task.id, "Session lookup failed, starting fresh: {}", e);
                SessionPlan::Fresh
            });

        let run = match self.store.create_run(task.id, plan.resume_id()).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                warn!(task_id = %task.id, "Rejected: another process created a running run");
                return TaskExecutionResult::rejected(Rejection::RunningElsewhere, started);
            }
            Err(e) => return TaskExecutionResult::error(format!("Failed to create run: {}", e), started),
        };
        let pending = PendingRun {
            store: self.store.clone(),
            task_id: task.id,
            run_id: run.id,
            started,
            finished: false,
        };

        info!(
            task_id = %task.id,
            run_id = %run.id,
            model = %persona.model,
            resume = plan.is_resume(),
            "Starting task run"
        );

        let console = RunConsole::start(
            run.id,
            self.store.clone(),
            self.config.console_flush_interval,
            self.tail.clone(),
        );

        let history = self.prepare_history(&task, &persona.model, &cancel).await;
        let resuming = plan.is_resume() || !history.is_empty();
        let context = PromptContext::gather(&self.collaborators, &task, resuming).await;
        let request = self.build_request(
            &task,
            &persona,
            context.apply(&task.prompt),
            plan.resume_id().map(str::to_string),
            history,
        );

        let first = self.dispatch_with_retry(request, &console, &cancel).await;
        let mut waits = first.waits;
        let mut result = first.result;

        if resuming
            && !result.is_success()
            && !result.timed_out
            && !cancel.is_cancelled()
            && !failure::is_terminal_failure(&result)
        {
            warn!(
                task_id = %task.id,
                run_id = %run.id,
                "Resumed session failed, retrying with a fresh session"
            );
            console.log(
                ConsoleKind::Error,
                "Resumed session failed, retrying with a fresh session",
            );
            if let Err(e) = self.store.set_task_session_id(task.id, None).await {
                warn!(task_id = %task.id, "Failed to clear session id: {}", e);
            }
            if let Err(e) = self.store.set_session_history(task.id, None).await {
                warn!(task_id = %task.id, "Failed to clear session history: {}", e);
            }

            let context = PromptContext::gather(&self.collaborators, &task, false).await;
            let request = self.build_request(
                &task,
                &persona,
                context.apply(&task.prompt),
                None,
                Vec::new(),
            );
            let retry = self.dispatch_with_retry(request, &console, &cancel).await;
            waits += retry.waits;
            result = retry.result;
        }

        let mut outcome = self
            .finalize(&task, pending, &result, &console, cancel.is_cancelled(), started)
            .await;
        outcome.rate_limit_waits = waits;
        outcome
    }

    async fn finalize(
        &self,
        task: &Task,
        mut pending: PendingRun,
        result: &ExecutionResult,
        console: &Arc<RunConsole>,
        cancelled: bool,
        started: Instant,
    ) -> TaskExecutionResult {
        let run_id = pending.run_id;
        let success = result.is_success();
        let error_message = if success {
            None
        } else if cancelled {
            Some("Cancelled".to_string())
        } else if result.timed_out {
            Some(format!("Timed out after {}s", result.duration.as_secs()))
        } else {
            let text = result.combined_output();
            Some(if text.trim().is_empty() {
                format!("Exited with code {}", result.exit_code)
            } else {
                truncate_chars(text.trim(), ERROR_MESSAGE_CHARS)
            })
        };

        if let Some(message) = &error_message {
            console.log(ConsoleKind::Error, message.clone());
        }

        let session_id = result
            .session_id
            .clone()
            .filter(|_| task.session_continuity);
        let usage = result.usage.unwrap_or_default();
        let run_outcome = RunOutcome {
            status: if success {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            },
            result: Some(result.output.clone()),
            error_message: error_message.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            session_id: session_id.clone(),
            timed_out: result.timed_out,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        };
        if let Err(e) = self.store.finish_run(run_id, &run_outcome).await {
            error!(task_id = %task.id, run_id = %run_id, "Failed to finalize run: {}", e);
        }
        pending.finished = true;
        console.close().await;

        if task.session_continuity {
            if let Some(session_id) = &session_id {
                if let Err(e) = self.store.set_task_session_id(task.id, Some(session_id)).await {
                    warn!(task_id = %task.id, "Failed to store session id: {}", e);
                }
            }
            if let Some(history) = result.history.as_deref().filter(|_| success) {
                if let Err(e) = self.store.set_session_history(task.id, Some(history)).await {
                    warn!(task_id = %task.id, "Failed to store session history: {}", e);
                }
            }
        }

        let status = if result.timed_out {
            ArtifactStatus::TimedOut
        } else if success {
            ArtifactStatus::Success
        } else {
            ArtifactStatus::Failed(result.exit_code)
        };
        let artifact_path = match artifact::write_artifact(
            &self.config.results_dir,
            &task.name,
            Utc::now(),
            result.duration,
            status,
            &result.combined_output(),
        )
        .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(task_id = %task.id, "Failed to write result artifact: {}", e);
                None
            }
        };

        let summary = error_message.clone().unwrap_or_else(|| result.output.clone());
        let record = RunRecord {
            task_id: task.id,
            room_id: task.room_id,
            task_name: task.name.clone(),
            success,
            summary: truncate_chars(&summary, MEMORY_SUMMARY_CHARS),
        };
        if let Err(e) = self.collaborators.memory.record(record).await {
            warn!(task_id = %task.id, "Failed to record run in memory: {}", e);
        }

        match self.store.increment_run_count(task.id).await {
            Ok(count) => {
                if task.max_runs.is_some_and(|max| count >= max) {
                    info!(task_id = %task.id, run_count = count, "Task reached max runs, completing");
                    if let Err(e) = self.store.set_task_status(task.id, TaskStatus::Completed).await {
                        warn!(task_id = %task.id, "Failed to complete task: {}", e);
                    }
                }
            }
            Err(e) => warn!(task_id = %task.id, "Failed to increment run count: {}", e),
        }

        if success {
            self.spawn_distillation(task).await;
        } else if !result.timed_out && failure::is_terminal_failure(result) {
            warn!(
                task_id = %task.id,
                "Terminal failure, pausing task: {}",
                error_message.as_deref().unwrap_or("")
            );
            if let Err(e) = self.store.set_task_status(task.id, TaskStatus::Paused).await {
                warn!(task_id = %task.id, "Failed to pause task: {}", e);
            }
        }

        info!(
            task_id = %task.id,
            run_id = %run_id,
            success,
            timed_out = result.timed_out,
            "Task run finished"
        );

        TaskExecutionResult {
            success,
            output: result.output.clone(),
            error_message,
            duration_ms: started.elapsed().as_millis() as u64,
            artifact_path,
            rejection: None,
            run_id: Some(run_id),
            rate_limit_waits: 0,
        }
    }

    /// Fire and forget; failures are only logged.
    async fn spawn_distillation(&self, task: &Task) {
        let distiller = self.collaborators.distiller.clone();
        if !distiller.should_distill(task).await {
            return;
        }
        let store = self.store.clone();
        let task = task.clone();
        tokio::spawn(async move {
            match distiller.distill(&task).await {
                Ok(Some(learned)) if !learned.trim().is_empty() => {
                    match store.set_learned_context(task.id, &learned).await {
                        Ok(()) => info!(task_id = %task.id, "Updated learned context"),
                        Err(e) => warn!(task_id = %task.id, "Failed to store learned context: {}", e),
                    }
                }
                Ok(_) => debug!(task_id = %task.id, "Distillation produced nothing"),
                Err(e) => warn!(task_id = %task.id, "Distillation failed: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFamily, ExecutionEvent, Executor};
    use crate::config::RateLimitConfig;
    use crate::llm::Role;
    use crate::memory::{Distiller, MemoryScope, MemoryService, NoMemory, RecentOutcomes};
    use crate::store::{InMemoryTaskStore, Room, Worker};
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    struct Seen {
        prompt: String,
        model: String,
        system_prompt: Option<String>,
        resume_session_id: Option<String>,
        history: Vec<ChatMessage>,
    }

    /// Replays canned results and records what it was asked. Successful
    /// calls report the extended conversation through the history hook.
    #[derive(Default)]
    struct Scripted {
        results: Mutex<VecDeque<ExecutionResult>>,
        seen: Mutex<Vec<Seen>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(results: Vec<ExecutionResult>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                ..Default::default()
            })
        }

        fn slow(results: Vec<ExecutionResult>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                delay,
                ..Default::default()
            })
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn execute(
            &self,
            target: &BackendKind,
            request: ExecutionRequest,
            observer: Arc<dyn ExecutionObserver>,
            cancel: CancellationToken,
        ) -> ExecutionResult {
            self.seen.lock().unwrap().push(Seen {
                prompt: request.prompt.clone(),
                model: target.to_string(),
                system_prompt: request.system_prompt.clone(),
                resume_session_id: request.resume_session_id.clone(),
                history: request.history.clone(),
            });
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => {
                        return ExecutionResult {
                            stderr: "Cancelled".into(),
                            exit_code: 1,
                            ..Default::default()
                        };
                    }
                }
            }
            let result = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ok("default answer"));
            if let Some(hook) = request.history_hook.as_ref().filter(|_| result.is_success()) {
                let mut history = request.history.clone();
                history.push(ChatMessage::new(Role::User, request.prompt.clone()));
                history.push(ChatMessage::new(Role::Assistant, result.output.clone()));
                hook.update(&history).await;
            }
            if result.is_success() {
                observer.on_event(ExecutionEvent::Result {
                    text: result.output.clone(),
                    session_id: result.session_id.clone(),
                });
            }
            result
        }
    }

    fn ok(output: &str) -> ExecutionResult {
        ExecutionResult {
            output: output.to_string(),
            ..Default::default()
        }
    }

    fn failed(stderr: &str) -> ExecutionResult {
        ExecutionResult {
            stderr: stderr.to_string(),
            exit_code: 1,
            ..Default::default()
        }
    }

    struct Harness {
        engine: Arc<TaskEngine>,
        store: Arc<InMemoryTaskStore>,
        script: Arc<Scripted>,
        _dir: tempfile::TempDir,
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            results_dir: dir.path().join("results"),
            data_dir: dir.path().to_path_buf(),
            rate_limit: RateLimitConfig {
                min_wait: Duration::from_millis(5),
                max_wait: Duration::from_millis(20),
                default_wait: Duration::from_millis(10),
                max_retries: 3,
            },
            console_flush_interval: Duration::from_millis(10),
            ..Config::default()
        }
    }

    fn harness_with(script: Arc<Scripted>, store: Arc<InMemoryTaskStore>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(BackendFamily::ClaudeCode, script.clone());
        dispatcher.register(BackendFamily::OpenAi, script.clone());
        let engine = TaskEngine::new(
            Arc::new(test_config(&dir)),
            store.clone(),
            Arc::new(dispatcher),
        );
        Harness {
            engine: Arc::new(engine),
            store,
            script,
            _dir: dir,
        }
    }

    fn harness(results: Vec<ExecutionResult>) -> Harness {
        harness_with(Scripted::new(results), Arc::new(InMemoryTaskStore::new()))
    }

    async fn add_task(store: &InMemoryTaskStore, configure: impl FnOnce(&mut Task)) -> Task {
        let mut task = Task::new("nightly report", "Summarize yesterday's builds");
        configure(&mut task);
        store.save_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn inactive_task_is_rejected_without_a_run() {
        let h = harness(vec![]);
        for status in [TaskStatus::Paused, TaskStatus::Completed] {
            let task = add_task(&h.store, |t| t.status = status).await;
            let result = h.engine.execute_task(task.id).await;
            assert!(!result.success);
            assert_eq!(result.rejection, Some(Rejection::NotActive(status)));
            assert!(h.store.list_runs(task.id, 10).await.unwrap().is_empty());
        }
        assert!(h.script.seen().is_empty());

        let missing = h.engine.execute_task(Uuid::new_v4()).await;
        assert_eq!(missing.rejection, Some(Rejection::NotFound));
    }

    #[tokio::test]
    async fn successful_run_is_persisted_with_artifact_and_console() {
        let h = harness(vec![ok("all green")]);
        let task = add_task(&h.store, |_| {}).await;

        let result = h.engine.execute_task(task.id).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.output, "all green");

        let runs = h.store.list_runs(task.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].result.as_deref(), Some("all green"));

        let logs = h.store.list_console_logs(runs[0].id).await.unwrap();
        assert_eq!(logs.last().unwrap().kind, ConsoleKind::Result);

        let artifact = std::fs::read_to_string(result.artifact_path.unwrap()).unwrap();
        assert!(artifact.contains("Task: nightly report"));
        assert!(artifact.contains("Status: Success"));
        assert!(artifact.contains("all green"));

        assert_eq!(h.store.get_task(task.id).await.unwrap().unwrap().run_count, 1);
        assert!(!h.engine.is_running(task.id));
    }

    #[tokio::test]
    async fn concurrent_invocations_never_overlap() {
        let script = Scripted::slow(vec![ok("one"), ok("two")], Duration::from_millis(100));
        let store = Arc::new(InMemoryTaskStore::new());
        let h = harness_with(script.clone(), store.clone());
        let other_process = harness_with(script, store.clone());
        let task = add_task(&store, |_| {}).await;

        let a = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.execute_task(task.id).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store
                .list_runs(task.id, 10)
                .await
                .unwrap()
                .iter()
                .filter(|r| r.status == RunStatus::Running)
                .count(),
            1
        );

        let same = h.engine.execute_task(task.id).await;
        assert_eq!(same.rejection, Some(Rejection::AlreadyRunning));
        let elsewhere = other_process.engine.execute_task(task.id).await;
        assert_eq!(elsewhere.rejection, Some(Rejection::RunningElsewhere));

        assert!(a.await.unwrap().success);
        assert_eq!(store.list_runs(task.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn max_runs_completes_task() {
        let h = harness(vec![ok("1"), ok("2")]);
        let task = add_task(&h.store, |t| t.max_runs = Some(2)).await;

        assert!(h.engine.execute_task(task.id).await.success);
        assert!(h.engine.execute_task(task.id).await.success);

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.run_count, 2);

        let third = h.engine.execute_task(task.id).await;
        assert!(!third.success);
        assert_eq!(
            third.rejection,
            Some(Rejection::NotActive(TaskStatus::Completed))
        );
    }

    #[tokio::test]
    async fn rate_limit_then_success_waits_once() {
        let h = harness(vec![failed("429 rate_limit_error"), ok("recovered")]);
        let task = add_task(&h.store, |_| {}).await;

        let result = h.engine.execute_task(task.id).await;
        assert!(result.success);
        assert_eq!(result.output, "recovered");
        assert_eq!(result.rate_limit_waits, 1);
        assert_eq!(h.script.seen().len(), 2);

        let run_id = result.run_id.unwrap();
        let waits: Vec<_> = h
            .store
            .list_console_logs(run_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.content.starts_with("Rate limit reached. Waiting"))
            .collect();
        assert_eq!(waits.len(), 1);
        assert_eq!(waits[0].kind, ConsoleKind::Error);
    }

    #[tokio::test]
    async fn enoent_pauses_task_without_retry() {
        let h = harness(vec![failed(
            "spawn claude ENOENT: Claude CLI is not installed",
        )]);
        let task = add_task(&h.store, |_| {}).await;

        let result = h.engine.execute_task(task.id).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("ENOENT"));
        assert_eq!(h.script.seen().len(), 1);

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Paused);
        let run = &h.store.list_runs(task.id, 1).await.unwrap()[0];
        assert_eq!(run.status, RunStatus::Failed);

        let artifact = std::fs::read_to_string(result.artifact_path.unwrap()).unwrap();
        assert!(artifact.contains("Status: Failed (exit 1)"));
    }

    #[tokio::test]
    async fn timeout_is_recorded_and_not_paused() {
        let mut timed_out = failed("command not found");
        timed_out.timed_out = true;
        let h = harness(vec![timed_out]);
        let task = add_task(&h.store, |_| {}).await;

        let result = h.engine.execute_task(task.id).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().starts_with("Timed out"));
        let run = &h.store.list_runs(task.id, 1).await.unwrap()[0];
        assert!(run.timed_out);
        assert_eq!(
            h.store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Active
        );
        let artifact = std::fs::read_to_string(result.artifact_path.unwrap()).unwrap();
        assert!(artifact.contains("Status: Timed Out"));
    }

    #[tokio::test]
    async fn session_rotates_after_ceiling() {
        let h = harness(vec![]);
        let task = add_task(&h.store, |t| {
            t.session_continuity = true;
            t.session_id = Some("sess-old".into());
        })
        .await;
        for _ in 0..20 {
            let run = h.store.create_run(task.id, Some("sess-old")).await.unwrap().unwrap();
            h.store
                .finish_run(
                    run.id,
                    &RunOutcome {
                        status: RunStatus::Completed,
                        result: None,
                        error_message: None,
                        duration_ms: 1,
                        session_id: None,
                        timed_out: false,
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                )
                .await
                .unwrap();
        }

        assert!(h.engine.execute_task(task.id).await.success);
        assert_eq!(h.script.seen()[0].resume_session_id, None);
    }

    #[tokio::test]
    async fn failed_resume_retries_with_fresh_session() {
        let mut fresh = ok("fresh answer");
        fresh.session_id = Some("sess-new".into());
        let h = harness(vec![failed("No conversation found with session ID"), fresh]);
        let task = add_task(&h.store, |t| {
            t.session_continuity = true;
            t.session_id = Some("sess-old".into());
        })
        .await;

        let result = h.engine.execute_task(task.id).await;
        assert!(result.success);

        let seen = h.script.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].resume_session_id.as_deref(), Some("sess-old"));
        assert_eq!(seen[1].resume_session_id, None);

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.session_id.as_deref(), Some("sess-new"));
        let run = h.store.get_run(result.run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(run.session_id.as_deref(), Some("sess-new"));
    }

    #[tokio::test]
    async fn persona_resolution_prefers_worker_then_default_then_room() {
        let h = harness(vec![ok("a"), ok("b"), ok("c")]);
        let room = Room {
            id: Uuid::new_v4(),
            name: "ops".into(),
            max_concurrent: Some(2),
            model: Some("openai:gpt-4o-mini".into()),
            system_prompt: Some("Room persona".into()),
        };
        h.store.save_room(&room).await.unwrap();

        let roomed = add_task(&h.store, |t| t.room_id = Some(room.id)).await;
        h.engine.execute_task(roomed.id).await;

        let default_worker = Worker {
            id: Uuid::new_v4(),
            name: "generalist".into(),
            system_prompt: Some("Default persona".into()),
            model: None,
            is_default: true,
        };
        h.store.save_worker(&default_worker).await.unwrap();
        h.engine.execute_task(roomed.id).await;

        let worker = Worker {
            id: Uuid::new_v4(),
            name: "analyst".into(),
            system_prompt: Some("Analyst persona".into()),
            model: Some("sonnet".into()),
            is_default: false,
        };
        h.store.save_worker(&worker).await.unwrap();
        let assigned = add_task(&h.store, |t| t.worker_id = Some(worker.id)).await;
        h.engine.execute_task(assigned.id).await;

        let seen = h.script.seen();
        assert_eq!(seen[0].system_prompt.as_deref(), Some("Room persona"));
        assert_eq!(seen[0].model, "openai:gpt-4o-mini");
        assert_eq!(seen[1].system_prompt.as_deref(), Some("Default persona"));
        assert_eq!(seen[1].model, "openai:gpt-4o-mini");
        assert_eq!(seen[2].system_prompt.as_deref(), Some("Analyst persona"));
        assert_eq!(seen[2].model, "claude:sonnet");
    }

    #[tokio::test]
    async fn cancel_task_aborts_run() {
        let script = Scripted::slow(vec![ok("never")], Duration::from_secs(30));
        let h = harness_with(script, Arc::new(InMemoryTaskStore::new()));
        let task = add_task(&h.store, |_| {}).await;

        let handle = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.execute_task(task.id).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.engine.cancel_task(task.id));

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("Cancelled"));
        let run = &h.store.list_runs(task.id, 1).await.unwrap()[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert!(!h.engine.cancel_task(task.id));
    }

    #[tokio::test]
    async fn cancel_room_releases_queued_and_running_tasks() {
        let script = Scripted::slow(vec![], Duration::from_secs(30));
        let h = harness_with(script, Arc::new(InMemoryTaskStore::new()));
        let room = Room {
            id: Uuid::new_v4(),
            name: "r".into(),
            max_concurrent: Some(1),
            model: None,
            system_prompt: None,
        };
        h.store.save_room(&room).await.unwrap();
        let first = add_task(&h.store, |t| t.room_id = Some(room.id)).await;
        let second = add_task(&h.store, |t| t.room_id = Some(room.id)).await;

        let spawn = |id: Uuid| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.execute_task(id).await })
        };
        let a = spawn(first.id);
        let b = spawn(second.id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.limiter().queued(SlotScope::Room(room.id)), 1);

        assert_eq!(h.engine.cancel_room(room.id), 2);
        let a = a.await.unwrap();
        let b = b.await.unwrap();
        assert!(!a.success && !b.success);
        assert_eq!(h.engine.limiter().active(SlotScope::Room(room.id)), 0);
    }

    struct AlwaysDistill;

    #[async_trait]
    impl Distiller for AlwaysDistill {
        async fn should_distill(&self, _task: &Task) -> bool {
            true
        }

        async fn distill(&self, _task: &Task) -> Result<Option<String>, String> {
            Ok(Some("Check CI first, then summarize".into()))
        }
    }

    struct BrokenMemory;

    #[async_trait]
    impl MemoryService for BrokenMemory {
        async fn context_for(&self, _task: &Task, _scope: MemoryScope) -> Option<String> {
            None
        }

        async fn record(&self, _record: RunRecord) -> Result<(), String> {
            Err("memory offline".into())
        }
    }

    #[tokio::test]
    async fn distillation_runs_in_background_and_memory_failures_are_ignored() {
        let h = harness(vec![ok("done")]);
        let engine = TaskEngine::new(
            h.engine.config.clone(),
            h.store.clone(),
            h.engine.dispatcher.clone(),
        )
        .with_collaborators(Collaborators {
            memory: Arc::new(BrokenMemory),
            referrals: Arc::new(NoMemory),
            distiller: Arc::new(AlwaysDistill),
        });
        let task = add_task(&h.store, |_| {}).await;

        assert!(engine.execute_task(task.id).await.success);

        let mut learned = None;
        for _ in 0..50 {
            learned = h.store.get_task(task.id).await.unwrap().unwrap().learned_context;
            if learned.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(learned.as_deref(), Some("Check CI first, then summarize"));
    }

    #[tokio::test]
    async fn memory_and_learned_context_reach_the_prompt() {
        let h = harness(vec![ok("first"), ok("second")]);
        let memory = Arc::new(RecentOutcomes::new(5));
        let engine = TaskEngine::new(
            h.engine.config.clone(),
            h.store.clone(),
            h.engine.dispatcher.clone(),
        )
        .with_collaborators(Collaborators {
            memory: memory.clone(),
            referrals: Arc::new(NoMemory),
            distiller: Arc::new(NoMemory),
        });
        let task = add_task(&h.store, |t| t.learned_context = Some("Use the dashboard".into())).await;

        engine.execute_task(task.id).await;
        engine.execute_task(task.id).await;

        let seen = h.script.seen();
        assert!(seen[0].prompt.starts_with("## Learned Methodology"));
        assert!(!seen[0].prompt.contains("Previous Runs"));
        assert!(seen[1].prompt.contains("Previous Runs Of This Task"));
        assert!(seen[1].prompt.contains("first"));
        assert!(seen[1].prompt.ends_with("Summarize yesterday's builds"));
    }

    async fn add_http_task(store: &InMemoryTaskStore, history: Vec<ChatMessage>) -> Task {
        let worker = Worker {
            id: Uuid::new_v4(),
            name: "api".into(),
            system_prompt: None,
            model: Some("openai:gpt-4o-mini".into()),
            is_default: true,
        };
        store.save_worker(&worker).await.unwrap();
        add_task(store, |t| {
            t.session_continuity = true;
            t.session_history = Some(history);
        })
        .await
    }

    fn conversation(messages: usize) -> Vec<ChatMessage> {
        (0..messages)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                ChatMessage::new(role, format!("turn {}", i))
            })
            .collect()
    }

    #[tokio::test]
    async fn long_http_history_is_compacted_and_stored() {
        let h = harness(vec![
            ok("Goals set: weekly digest"),
            failed("spawn ENOENT: helper not installed"),
        ]);
        let task = add_http_task(&h.store, conversation(40)).await;

        let result = h.engine.execute_task(task.id).await;
        assert!(!result.success);

        let seen = h.script.seen();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].prompt.starts_with("Summarize the conversation"));
        assert!(seen[0].prompt.contains("turn 39"));
        assert_eq!(seen[1].history.len(), 2);
        assert!(seen[1].history[0]
            .text_content()
            .unwrap()
            .contains("Goals set: weekly digest"));

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.session_history, Some(seen[1].history.clone()));
    }

    #[tokio::test]
    async fn http_turns_are_persisted_during_the_run() {
        let h = harness(vec![ok("digest ready")]);
        let task = add_http_task(&h.store, conversation(4)).await;

        assert!(h.engine.execute_task(task.id).await.success);

        let seen = h.script.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].history, conversation(4));

        let history = h
            .store
            .get_task(task.id)
            .await
            .unwrap()
            .unwrap()
            .session_history
            .unwrap();
        assert_eq!(history.len(), 6);
        assert_eq!(history[5].text_content(), Some("digest ready"));
    }

    #[tokio::test]
    async fn failed_http_resume_clears_history_and_retries_fresh() {
        let h = harness(vec![
            failed("HTTP 400: messages are malformed"),
            failed("HTTP 500: internal error"),
        ]);
        let task = add_http_task(&h.store, conversation(4)).await;

        let result = h.engine.execute_task(task.id).await;
        assert!(!result.success);

        let seen = h.script.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].history.len(), 4);
        assert!(seen[1].history.is_empty());

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.session_history, None);
        assert_eq!(stored.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn dropped_execution_fails_run_and_frees_slot() {
        let script = Scripted::slow(vec![ok("late"), ok("next")], Duration::from_millis(200));
        let h = harness_with(script, Arc::new(InMemoryTaskStore::new()));
        let task = add_task(&h.store, |_| {}).await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(30), h.engine.execute_task(task.id)).await;
        assert!(abandoned.is_err());
        assert!(!h.engine.is_running(task.id));
        assert_eq!(h.engine.limiter().active(SlotScope::Global), 0);

        let mut run = None;
        for _ in 0..50 {
            let runs = h.store.list_runs(task.id, 1).await.unwrap();
            if runs[0].status != RunStatus::Running {
                run = Some(runs[0].clone());
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let run = run.expect("abandoned run finalized");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some(INTERRUPTED));

        let next = h.engine.execute_task(task.id).await;
        assert!(next.success, "{:?}", next.error_message);
        assert_eq!(next.output, "late");
    }
}
