//! Per-node lifecycle ledger shared with observers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Error,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub status: NodeStatus,
    /// Failure description for `Error` entries.
    pub message: Option<String>,
    /// Exit code of a background process, once it has exited.
    pub exit_code: Option<i32>,
}

/// Map from node id to lifecycle state. Unknown ids read as `Pending`.
#[derive(Debug, Default)]
pub struct StatusLedger {
    entries: HashMap<NodeId, LedgerEntry>,
}

impl StatusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, id: &NodeId) -> NodeStatus {
        self.entries
            .get(id)
            .map(|entry| entry.status)
            .unwrap_or_default()
    }

    pub fn entry(&self, id: &NodeId) -> Option<&LedgerEntry> {
        self.entries.get(id)
    }

    pub fn mark_pending(&mut self, id: &NodeId) -> bool {
        self.transition(id, NodeStatus::Pending, None)
    }

    pub fn mark_executing(&mut self, id: &NodeId) -> bool {
        self.transition(id, NodeStatus::Executing, None)
    }

    pub fn mark_completed(&mut self, id: &NodeId) -> bool {
        self.transition(id, NodeStatus::Completed, None)
    }

    pub fn mark_error(&mut self, id: &NodeId, message: impl Into<String>) -> bool {
        self.transition(id, NodeStatus::Error, Some(message.into()))
    }

    /// Drop an entry that never started (aborted batch).
    pub fn forget(&mut self, id: &NodeId) {
        if self.status(id) == NodeStatus::Pending {
            self.entries.remove(id);
        }
    }

    pub fn record_exit(&mut self, id: &NodeId, code: i32) {
        self.entries.entry(id.clone()).or_default().exit_code = Some(code);
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status == status)
            .count()
    }

    /// Error is terminal; every other move is allowed.
    fn transition(&mut self, id: &NodeId, next: NodeStatus, message: Option<String>) -> bool {
        let entry = self.entries.entry(id.clone()).or_default();
        if entry.status == NodeStatus::Error {
            return false;
        }
        entry.status = next;
        entry.message = message;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ids_read_as_pending() {
        let ledger = StatusLedger::new();
        assert_eq!(ledger.status(&NodeId::new("x")), NodeStatus::Pending);
    }

    #[test]
    fn error_is_terminal() {
        let mut ledger = StatusLedger::new();
        let id = NodeId::new("a");
        assert!(ledger.mark_executing(&id));
        assert!(ledger.mark_error(&id, "boom"));
        assert!(!ledger.mark_completed(&id));
        assert_eq!(ledger.status(&id), NodeStatus::Error);
        assert_eq!(
            ledger.entry(&id).and_then(|e| e.message.as_deref()),
            Some("boom")
        );
    }

    #[test]
    fn forget_only_drops_unstarted_entries() {
        let mut ledger = StatusLedger::new();
        let pending = NodeId::new("p");
        let done = NodeId::new("d");
        ledger.mark_pending(&pending);
        ledger.mark_completed(&done);
        ledger.forget(&pending);
        ledger.forget(&done);
        assert!(ledger.entry(&pending).is_none());
        assert_eq!(ledger.status(&done), NodeStatus::Completed);
    }

    #[test]
    fn exit_code_does_not_change_status() {
        let mut ledger = StatusLedger::new();
        let id = NodeId::new("bg");
        ledger.mark_completed(&id);
        ledger.record_exit(&id, 1);
        let entry = ledger.entry(&id).expect("entry");
        assert_eq!(entry.status, NodeStatus::Completed);
        assert_eq!(entry.exit_code, Some(1));
    }
}
