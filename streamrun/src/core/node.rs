//! Node types produced by the tag decoder.
//!
//! These types are the stable contract between the decoder, the readiness
//! classifier and the execution pipeline. They carry no I/O handles and
//! serialize deterministically.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a decoded node.
///
/// File and command identifiers are content-stable across re-parses of a
/// growing buffer; narration identifiers are positional.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Action carried by a `<file>` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Update,
    Delete,
}

impl FileAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file write or delete. `closed` flips to true once the body is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub id: NodeId,
    pub path: String,
    pub action: FileAction,
    pub content: String,
    pub closed: bool,
}

/// A shell command. Always complete as soon as its tag is seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOp {
    pub id: NodeId,
    pub command: String,
    pub background: bool,
}

/// One element of the decoded stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamNode {
    Narration { id: NodeId, text: String },
    File(FileOp),
    Command(CommandOp),
}

impl StreamNode {
    pub fn id(&self) -> &NodeId {
        match self {
            Self::Narration { id, .. } => id,
            Self::File(op) => &op.id,
            Self::Command(op) => &op.id,
        }
    }

    /// Narration that carries no renderable text.
    pub fn is_blank_narration(&self) -> bool {
        match self {
            Self::Narration { text, .. } => {
                let trimmed = text.trim();
                trimmed.is_empty() || trimmed == "/>"
            }
            _ => false,
        }
    }
}

/// Executable subset of [`StreamNode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Instruction {
    File(FileOp),
    Command(CommandOp),
}

impl Instruction {
    pub fn id(&self) -> &NodeId {
        match self {
            Self::File(op) => &op.id,
            Self::Command(op) => &op.id,
        }
    }

    /// Short human-readable label, e.g. `update src/App.tsx`.
    pub fn describe(&self) -> String {
        match self {
            Self::File(op) => format!("{} {}", op.action, op.path),
            Self::Command(op) if op.background => format!("run (background) {}", op.command),
            Self::Command(op) => format!("run {}", op.command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_narration_includes_stray_self_close() {
        let blank = StreamNode::Narration {
            id: NodeId::new("n"),
            text: "  \n/> ".to_string(),
        };
        let text = StreamNode::Narration {
            id: NodeId::new("n"),
            text: "hello".to_string(),
        };
        assert!(blank.is_blank_narration());
        assert!(!text.is_blank_narration());
    }

    #[test]
    fn describe_uses_action_and_path() {
        let op = Instruction::File(FileOp {
            id: NodeId::new("f"),
            path: "src/App.tsx".to_string(),
            action: FileAction::Update,
            content: String::new(),
            closed: true,
        });
        assert_eq!(op.describe(), "update src/App.tsx");
    }

    #[test]
    fn node_serializes_with_kind_tag() {
        let node = StreamNode::Command(CommandOp {
            id: NodeId::new("cmd-1"),
            command: "npm install".to_string(),
            background: false,
        });
        let json = serde_json::to_value(&node).expect("serialize");
        assert_eq!(json["kind"], "command");
        assert_eq!(json["id"], "cmd-1");
    }
}
