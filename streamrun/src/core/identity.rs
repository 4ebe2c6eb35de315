//! Deterministic node identifiers.
//!
//! File identifiers depend on (turn, action, path) and never on content, so a
//! file operation observed at different stream lengths keeps one identifier.
//! Command identifiers depend on (turn, command text).

use sha2::{Digest, Sha256};

use crate::core::node::{FileAction, NodeId};

const ID_HEX_LEN: usize = 16;

pub fn file_id(turn_id: &str, action: FileAction, path: &str) -> NodeId {
    NodeId::new(format!(
        "file-{}",
        digest(&[turn_id, action.as_str(), path])
    ))
}

pub fn command_id(turn_id: &str, command: &str) -> NodeId {
    NodeId::new(format!("cmd-{}", digest(&[turn_id, command])))
}

/// Positional identifier; may change across re-parses.
pub fn narration_id(turn_id: &str, index: usize) -> NodeId {
    NodeId::new(format!("text-{}-{index}", digest(&[turn_id])))
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        // Length prefix keeps ("ab","c") and ("a","bc") apart.
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(ID_HEX_LEN);
    hex
}
