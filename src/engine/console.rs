//! Per-run console log.
//!
//! Backend events become numbered [`ConsoleLogEntry`] lines. A live tail sees
//! every line synchronously; the store receives them in batches from a
//! writer task that flushes on a fixed interval and once more on close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{ExecutionEvent, ExecutionObserver};
use crate::store::{now_string, ConsoleKind, ConsoleLogEntry, TaskStore};
use crate::util::truncate_chars;

const ENTRY_CHARS: usize = 4000;

/// Synchronous side channel for live observers.
pub trait LiveTail: Send + Sync {
    fn on_entry(&self, entry: &ConsoleLogEntry);

    fn on_progress(&self, _run_id: Uuid, _fraction: Option<f64>, _message: &str) {}
}

enum ConsoleMsg {
    Entry(ConsoleLogEntry),
    Progress(Option<f64>, String),
    Close,
}

pub struct RunConsole {
    run_id: Uuid,
    seq: AtomicU64,
    tail: Option<Arc<dyn LiveTail>>,
    tx: mpsc::UnboundedSender<ConsoleMsg>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl RunConsole {
    /// Start the writer task for `run_id`.
    pub fn start(
        run_id: Uuid,
        store: Arc<dyn TaskStore>,
        flush_interval: Duration,
        tail: Option<Arc<dyn LiveTail>>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(run_id, store, flush_interval, rx));
        Arc::new(Self {
            run_id,
            seq: AtomicU64::new(0),
            tail,
            tx,
            writer: Mutex::new(Some(handle)),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append one line.
    pub fn log(&self, kind: ConsoleKind, content: impl Into<String>) {
        let entry = ConsoleLogEntry {
            run_id: self.run_id,
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            kind,
            content: truncate_chars(&content.into(), ENTRY_CHARS),
            created_at: now_string(),
        };
        if let Some(tail) = &self.tail {
            tail.on_entry(&entry);
        }
        let _ = self.tx.send(ConsoleMsg::Entry(entry));
    }

    pub fn progress(&self, fraction: Option<f64>, message: impl Into<String>) {
        let message = message.into();
        if let Some(tail) = &self.tail {
            tail.on_progress(self.run_id, fraction, &message);
        }
        let _ = self.tx.send(ConsoleMsg::Progress(fraction, message));
    }

    /// Flush everything buffered and stop the writer.
    pub async fn close(&self) {
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.tx.send(ConsoleMsg::Close);
        if let Err(e) = handle.await {
            warn!(run_id = %self.run_id, "Console writer crashed: {}", e);
        }
    }
}

impl ExecutionObserver for RunConsole {
    fn on_event(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::ToolCall { name, input, .. } => {
                let input = serde_json::to_string(&input).unwrap_or_default();
                self.log(
                    ConsoleKind::ToolCall,
                    format!("{} {}", name, truncate_chars(&input, 1000)),
                );
            }
            ExecutionEvent::AssistantText { text } => {
                if !text.trim().is_empty() {
                    self.log(ConsoleKind::AssistantText, text);
                }
            }
            ExecutionEvent::ToolResult {
                name,
                content,
                is_error,
                ..
            } => {
                let prefix = if is_error { "[error] " } else { "" };
                self.log(
                    ConsoleKind::ToolResult,
                    format!("{}{}: {}", prefix, name, content),
                );
            }
            ExecutionEvent::Result { text, .. } => self.log(ConsoleKind::Result, text),
            ExecutionEvent::Progress { fraction, message } => self.progress(fraction, message),
        }
    }
}

async fn flush(run_id: Uuid, store: &dyn TaskStore, buffer: &mut Vec<ConsoleLogEntry>) {
    if buffer.is_empty() {
        return;
    }
    match store.append_console_logs(buffer).await {
        Ok(()) => debug!(run_id = %run_id, count = buffer.len(), "Flushed console log"),
        Err(e) => warn!(run_id = %run_id, "Failed to flush {} console entries: {}", buffer.len(), e),
    }
    buffer.clear();
}

async fn write_progress(
    run_id: Uuid,
    store: &dyn TaskStore,
    pending: &mut Option<(Option<f64>, String)>,
) {
    if let Some((fraction, message)) = pending.take() {
        if let Err(e) = store.update_run_progress(run_id, fraction, &message).await {
            warn!(run_id = %run_id, "Failed to update run progress: {}", e);
        }
    }
}

async fn write_loop(
    run_id: Uuid,
    store: Arc<dyn TaskStore>,
    flush_interval: Duration,
    mut rx: mpsc::UnboundedReceiver<ConsoleMsg>,
) {
    let mut buffer = Vec::new();
    let mut progress = None;
    let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(ConsoleMsg::Entry(entry)) => buffer.push(entry),
                Some(ConsoleMsg::Progress(fraction, message)) => progress = Some((fraction, message)),
                Some(ConsoleMsg::Close) | None => break,
            },
            _ = ticker.tick() => {
                flush(run_id, store.as_ref(), &mut buffer).await;
                write_progress(run_id, store.as_ref(), &mut progress).await;
            }
        }
    }

    // Entries sent before Close are already queued ahead of it.
    while let Ok(msg) = rx.try_recv() {
        match msg {
            ConsoleMsg::Entry(entry) => buffer.push(entry),
            ConsoleMsg::Progress(fraction, message) => progress = Some((fraction, message)),
            ConsoleMsg::Close => {}
        }
    }
    flush(run_id, store.as_ref(), &mut buffer).await;
    write_progress(run_id, store.as_ref(), &mut progress).await;
}
