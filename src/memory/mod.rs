//! Memory collaborators consulted while assembling a run's prompt.
//!
//! The engine only sees opaque context strings. Three seams:
//! - [`MemoryService`]: prior-run context and outcome recording
//! - [`ReferralProvider`]: tenant referral context for a room
//! - [`Distiller`]: learned-context summaries from successful runs
//!
//! [`NoMemory`] disables all three. [`RecentOutcomes`] keeps a bounded
//! in-process history of run outcomes and formats it for prompt injection.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::Task;
use crate::util::truncate_chars;

/// Which memories a run may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryScope {
    /// This task's own history plus other tasks in the room
    Full,
    /// Only other tasks; a resumed session already carries its own history
    CrossTask,
}

/// Outcome handed to the memory service after every run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub task_id: Uuid,
    pub room_id: Option<Uuid>,
    pub task_name: String,
    pub success: bool,
    pub summary: String,
}

#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Context to prepend to the prompt, or `None` when there is nothing relevant.
    async fn context_for(&self, task: &Task, scope: MemoryScope) -> Option<String>;

    async fn record(&self, record: RunRecord) -> Result<(), String>;
}

#[async_trait]
pub trait ReferralProvider: Send + Sync {
    async fn referral_context(&self, room_id: Option<Uuid>) -> Option<String>;
}

#[async_trait]
pub trait Distiller: Send + Sync {
    /// Whether a successful run should trigger a new learned-context summary.
    async fn should_distill(&self, task: &Task) -> bool;

    /// Produce a learned-context summary for `task`.
    async fn distill(&self, task: &Task) -> Result<Option<String>, String>;
}

/// Collaborator that remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemory;

#[async_trait]
impl MemoryService for NoMemory {
    async fn context_for(&self, _task: &Task, _scope: MemoryScope) -> Option<String> {
        None
    }

    async fn record(&self, _record: RunRecord) -> Result<(), String> {
        Ok(())
    }
}

#[async_trait]
impl ReferralProvider for NoMemory {
    async fn referral_context(&self, _room_id: Option<Uuid>) -> Option<String> {
        None
    }
}

#[async_trait]
impl Distiller for NoMemory {
    async fn should_distill(&self, _task: &Task) -> bool {
        false
    }

    async fn distill(&self, _task: &Task) -> Result<Option<String>, String> {
        Ok(None)
    }
}

/// Bundle of collaborators passed to the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub memory: Arc<dyn MemoryService>,
    pub referrals: Arc<dyn ReferralProvider>,
    pub distiller: Arc<dyn Distiller>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            memory: Arc::new(NoMemory),
            referrals: Arc::new(NoMemory),
            distiller: Arc::new(NoMemory),
        }
    }
}

const SUMMARY_CHARS: usize = 300;
const DEFAULT_MAX_TASKS: usize = 256;

#[derive(Default)]
struct Outcomes {
    by_task: HashMap<Uuid, VecDeque<RunRecord>>,
    /// Task ids, least recently recorded first.
    recency: VecDeque<Uuid>,
}

/// In-process memory of the most recent outcomes per task.
///
/// Bounded both per task and in the number of tasks; the task recorded
/// least recently is evicted first.
pub struct RecentOutcomes {
    per_task: usize,
    max_tasks: usize,
    records: RwLock<Outcomes>,
}

impl RecentOutcomes {
    pub fn new(per_task: usize) -> Self {
        Self {
            per_task: per_task.max(1),
            max_tasks: DEFAULT_MAX_TASKS,
            records: RwLock::new(Outcomes::default()),
        }
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks.max(1);
        self
    }

    /// Drop everything remembered about a deleted or completed task.
    pub async fn forget(&self, task_id: Uuid) {
        let mut records = self.records.write().await;
        records.by_task.remove(&task_id);
        records.recency.retain(|id| *id != task_id);
    }

    pub async fn tracked_tasks(&self) -> usize {
        self.records.read().await.by_task.len()
    }

    fn format(own: &[&RunRecord], others: &[&RunRecord]) -> Option<String> {
        let line = |r: &&RunRecord| {
            let icon = if r.success { "✅" } else { "❌" };
            format!("• {} [{}] {}", icon, r.task_name, r.summary)
        };

        let mut sections = Vec::new();
        if !own.is_empty() {
            let lines = own.iter().map(line).collect::<Vec<_>>().join("\n");
            sections.push(format!("### Previous Runs Of This Task\n{}", lines));
        }
        if !others.is_empty() {
            let lines = others.iter().map(line).collect::<Vec<_>>().join("\n");
            sections.push(format!("### Related Work In This Room\n{}", lines));
        }

        if sections.is_empty() {
            None
        } else {
            Some(format!("## Memory\n\n{}", sections.join("\n\n")))
        }
    }
}

#[async_trait]
impl MemoryService for RecentOutcomes {
    async fn context_for(&self, task: &Task, scope: MemoryScope) -> Option<String> {
        let records = self.records.read().await;

        let own: Vec<&RunRecord> = match scope {
            MemoryScope::Full => records
                .by_task
                .get(&task.id)
                .map(|r| r.iter().collect())
                .unwrap_or_default(),
            MemoryScope::CrossTask => Vec::new(),
        };

        let others: Vec<&RunRecord> = match task.room_id {
            Some(room_id) => records
                .by_task
                .iter()
                .filter(|(id, _)| **id != task.id)
                .flat_map(|(_, r)| r.iter())
                .filter(|r| r.room_id == Some(room_id))
                .collect(),
            None => Vec::new(),
        };

        Self::format(&own, &others)
    }

    async fn record(&self, mut record: RunRecord) -> Result<(), String> {
        record.summary = truncate_chars(record.summary.trim(), SUMMARY_CHARS);
        let task_id = record.task_id;
        let mut records = self.records.write().await;

        let entries = records.by_task.entry(task_id).or_default();
        entries.push_back(record);
        while entries.len() > self.per_task {
            entries.pop_front();
        }

        records.recency.retain(|id| *id != task_id);
        records.recency.push_back(task_id);
        while records.recency.len() > self.max_tasks {
            if let Some(evicted) = records.recency.pop_front() {
                records.by_task.remove(&evicted);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task: &Task, success: bool, summary: &str) -> RunRecord {
        RunRecord {
            task_id: task.id,
            room_id: task.room_id,
            task_name: task.name.clone(),
            success,
            summary: summary.to_string(),
        }
    }

    #[tokio::test]
    async fn no_memory_supplies_nothing() {
        let task = Task::new("t", "p");
        assert!(NoMemory.context_for(&task, MemoryScope::Full).await.is_none());
        assert!(NoMemory.referral_context(None).await.is_none());
        assert!(!NoMemory.should_distill(&task).await);
    }

    #[tokio::test]
    async fn recent_outcomes_keeps_bounded_history() {
        let memory = RecentOutcomes::new(2);
        let task = Task::new("digest", "summarize");
        for i in 0..3 {
            memory
                .record(record(&task, true, &format!("run {}", i)))
                .await
                .unwrap();
        }

        let context = memory.context_for(&task, MemoryScope::Full).await.unwrap();
        assert!(context.contains("Previous Runs Of This Task"));
        assert!(!context.contains("run 0"));
        assert!(context.contains("run 2"));
    }

    #[tokio::test]
    async fn cross_task_scope_excludes_own_history() {
        let memory = RecentOutcomes::new(5);
        let room = Uuid::new_v4();
        let mut mine = Task::new("mine", "p");
        mine.room_id = Some(room);
        let mut sibling = Task::new("sibling", "p");
        sibling.room_id = Some(room);
        let outsider = Task::new("outsider", "p");

        memory.record(record(&mine, true, "own note")).await.unwrap();
        memory.record(record(&sibling, false, "sibling note")).await.unwrap();
        memory.record(record(&outsider, true, "outsider note")).await.unwrap();

        let context = memory
            .context_for(&mine, MemoryScope::CrossTask)
            .await
            .unwrap();
        assert!(context.contains("sibling note"));
        assert!(!context.contains("own note"));
        assert!(!context.contains("outsider note"));

        assert!(memory
            .context_for(&outsider, MemoryScope::CrossTask)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn least_recent_task_is_evicted() {
        let memory = RecentOutcomes::new(3).with_max_tasks(2);
        let first = Task::new("first", "p");
        let second = Task::new("second", "p");
        let third = Task::new("third", "p");

        memory.record(record(&first, true, "first note")).await.unwrap();
        memory.record(record(&second, true, "second note")).await.unwrap();
        memory.record(record(&first, true, "first again")).await.unwrap();
        memory.record(record(&third, true, "third note")).await.unwrap();

        assert_eq!(memory.tracked_tasks().await, 2);
        assert!(memory.context_for(&second, MemoryScope::Full).await.is_none());
        let kept = memory.context_for(&first, MemoryScope::Full).await.unwrap();
        assert!(kept.contains("first again"));

        memory.forget(first.id).await;
        assert_eq!(memory.tracked_tasks().await, 1);
        assert!(memory.context_for(&first, MemoryScope::Full).await.is_none());
    }
}
