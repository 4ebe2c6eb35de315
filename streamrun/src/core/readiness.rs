//! Readiness classification and dispatch dedup.
//!
//! A node is ready when its definition is complete: commands always, files
//! once closed. Each ready identifier is handed out exactly once, in stream
//! order.

use std::collections::HashSet;

use crate::core::node::{Instruction, NodeId, StreamNode};

pub fn is_ready(node: &StreamNode) -> bool {
    match node {
        StreamNode::Narration { .. } => false,
        StreamNode::File(op) => op.closed,
        StreamNode::Command(_) => true,
    }
}

/// Ready nodes whose identifier is not in `dispatched`, in sequence order.
///
/// A repeated identifier within `nodes` is returned once.
pub fn ready_unseen(nodes: &[StreamNode], dispatched: &HashSet<NodeId>) -> Vec<Instruction> {
    let mut seen_here: HashSet<&NodeId> = HashSet::new();
    let mut ready = Vec::new();
    for node in nodes {
        if !is_ready(node) || dispatched.contains(node.id()) || !seen_here.insert(node.id()) {
            continue;
        }
        ready.extend(to_instruction(node));
    }
    ready
}

fn to_instruction(node: &StreamNode) -> Option<Instruction> {
    match node {
        StreamNode::Narration { .. } => None,
        StreamNode::File(op) => Some(Instruction::File(op.clone())),
        StreamNode::Command(op) => Some(Instruction::Command(op.clone())),
    }
}

/// Identifiers already handed to the execution queue.
#[derive(Debug, Default)]
pub struct DispatchRegistry {
    dispatched: HashSet<NodeId>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready, not-yet-dispatched instructions; records them as dispatched.
    pub fn take_ready(&mut self, nodes: &[StreamNode]) -> Vec<Instruction> {
        let ready = ready_unseen(nodes, &self.dispatched);
        self.dispatched
            .extend(ready.iter().map(|instruction| instruction.id().clone()));
        ready
    }

    pub fn was_dispatched(&self, id: &NodeId) -> bool {
        self.dispatched.contains(id)
    }

    pub fn len(&self) -> usize {
        self.dispatched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
    }
}
