//! # taskforge
//!
//! Task execution engine for AI workers.
//!
//! A task (prompt + execution policy) is run by a worker persona against one
//! of several interchangeable backends, with durable run history, bounded
//! concurrency, and automatic recovery from rate limits and stale sessions.
//!
//! ## Architecture
//!
//! ```text
//!   TaskEngine::execute_task(task_id)
//!        │  preconditions, persona, session plan
//!        ▼
//!   ConcurrencyLimiter ──▶ prompt assembly (memory, learned context)
//!        │
//!        ▼
//!   rate-limit retry loop ──▶ Dispatcher ──┬─▶ Claude CLI (subprocess)
//!        │                                 ├─▶ Station (CLI over SSH)
//!        │                                 ├─▶ OpenAI / Anthropic (HTTP)
//!        │                                 └─▶ Ollama (local daemon)
//!        ▼
//!   finalize: run record, console log, artifact, memory, auto-pause
//! ```
//!
//! ## Modules
//! - `engine`: the orchestrator plus limiter, rate limiting, sessions
//! - `backend`: model identifier parsing, executors, event stream
//! - `llm`: HTTP chat-completion clients
//! - `store`: task/run persistence (in-memory and SQLite)
//! - `memory`: context collaborators consulted during prompt assembly

pub mod backend;
pub mod config;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod store;
pub mod util;

pub use config::Config;
pub use engine::{Rejection, TaskEngine, TaskExecutionResult};
pub use store::{SqliteTaskStore, TaskStore};
