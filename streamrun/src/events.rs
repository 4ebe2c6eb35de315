//! Events broadcast to observers of a session.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::node::NodeId;
use crate::core::status::NodeStatus;

/// Where a chunk of process output came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum OutputSource {
    /// The session's interactive shell.
    Shell,
    /// A background process started by the given command node.
    Background(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Human-readable status line, e.g. `executing: update src/App.tsx`.
    Status { line: String },
    NodeStatus { id: NodeId, status: NodeStatus },
    /// A batch aborted on this failure.
    ExecutionError { message: String },
    /// Failure signature seen in background output.
    Detection { node_id: NodeId, line: String },
    Output { source: OutputSource, chunk: String },
    BackgroundExited { node_id: NodeId, code: i32 },
    ShellExited { code: i32 },
    PersistenceError { message: String },
}

/// Broadcast sender. Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}
