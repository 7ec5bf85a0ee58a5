//! Events streamed to the client during a chat turn.

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::TurnError;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta { content: String },
    SubAgentStart { document_id: String, query: String },
    SubAgentThinking { content: String },
    SubAgentResult { content: String },
    Error { error: String },
    Done,
}

impl StreamEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::SubAgentStart { .. } => "sub_agent_start",
            StreamEvent::SubAgentThinking { .. } => "sub_agent_thinking",
            StreamEvent::SubAgentResult { .. } => "sub_agent_result",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        }
    }

    /// SSE data payload.
    pub fn data(&self) -> Value {
        match self {
            StreamEvent::TextDelta { content }
            | StreamEvent::SubAgentThinking { content }
            | StreamEvent::SubAgentResult { content } => json!({ "content": content }),
            StreamEvent::SubAgentStart { document_id, query } => {
                json!({ "document_id": document_id, "query": query })
            }
            StreamEvent::Error { error } => json!({ "error": error }),
            StreamEvent::Done => json!({}),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Done)
    }
}

/// Sending half of a turn's event channel. The turn owns the only sink;
/// [`EventSink::finish`] consumes it, so at most one terminal event is
/// ever sent and the channel closes right after.
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Send a non-terminal event. Fails with [`TurnError::Cancelled`] once
    /// the receiver has gone away.
    pub async fn send(&self, event: StreamEvent) -> Result<(), TurnError> {
        debug_assert!(!event.is_terminal());
        self.tx.send(event).await.map_err(|_| TurnError::Cancelled)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn finish(self, event: StreamEvent) {
        // Nobody is listening any more; nothing to do.
        let _ = self.tx.send(event).await;
    }
}
