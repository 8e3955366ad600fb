//! Final prompt assembly.
//!
//! Context sections are prepended outer to inner: referral, learned
//! methodology, memory. Empty sections are left out.

use tracing::debug;

use crate::memory::{Collaborators, MemoryScope};
use crate::store::Task;

/// Context gathered from collaborators for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptContext {
    pub referral: Option<String>,
    pub learned: Option<String>,
    pub memory: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl PromptContext {
    /// Query collaborators. A resumed session already carries its own
    /// history, so it only gets cross-task memory.
    pub async fn gather(collaborators: &Collaborators, task: &Task, resuming: bool) -> Self {
        let scope = if resuming {
            MemoryScope::CrossTask
        } else {
            MemoryScope::Full
        };

        let context = Self {
            referral: non_empty(collaborators.referrals.referral_context(task.room_id).await),
            learned: non_empty(task.learned_context.clone()),
            memory: non_empty(collaborators.memory.context_for(task, scope).await),
        };
        debug!(
            task_id = %task.id,
            referral = context.referral.is_some(),
            learned = context.learned.is_some(),
            memory = context.memory.is_some(),
            ?scope,
            "Gathered prompt context"
        );
        context
    }

    pub fn is_empty(&self) -> bool {
        self.referral.is_none() && self.learned.is_none() && self.memory.is_none()
    }

    /// Prepend the sections to `prompt`.
    pub fn apply(&self, prompt: &str) -> String {
        let mut sections = Vec::new();
        if let Some(referral) = &self.referral {
            sections.push(referral.trim().to_string());
        }
        if let Some(learned) = &self.learned {
            sections.push(format!("## Learned Methodology\n\n{}", learned.trim()));
        }
        if let Some(memory) = &self.memory {
            sections.push(memory.trim().to_string());
        }

        if sections.is_empty() {
            return prompt.to_string();
        }
        format!("{}\n\n---\n\n{}", sections.join("\n\n"), prompt)
    }
}
