use serde_json::Value;
use tokio::sync::mpsc;

/// Backend-agnostic execution events.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Agent is calling a tool.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    /// Text produced by the model.
    AssistantText { text: String },
    /// Tool execution completed.
    ToolResult {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    /// Final answer, with the backend's session handle if it has one.
    Result {
        text: String,
        session_id: Option<String>,
    },
    /// Progress update for the run record.
    Progress {
        fraction: Option<f64>,
        message: String,
    },
}

/// Sink for events emitted while a backend call is in flight.
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: ExecutionEvent);
}

/// Discards every event.
pub struct NullObserver;

impl ExecutionObserver for NullObserver {
    fn on_event(&self, _event: ExecutionEvent) {}
}

/// Forwards events into a channel so a consumer can read them as a stream.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ExecutionObserver for ChannelObserver {
    fn on_event(&self, event: ExecutionEvent) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}
