//! In-memory mirror of the sandbox file hierarchy.
//!
//! Mutated only after a file operation succeeds against the sandbox.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::node::{FileAction, FileOp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TreeEntry {
    File { content: String },
    Directory,
}

/// Flat path → entry map. Keys are normalized, `/`-separated, no leading or
/// trailing slash. Directories are implied by their files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileTree {
    entries: BTreeMap<String, TreeEntry>,
}

pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(&normalize_path(path))
    }

    pub fn read(&self, path: &str) -> Option<&str> {
        match self.get(path)? {
            TreeEntry::File { content } => Some(content),
            TreeEntry::Directory => None,
        }
    }

    pub fn insert_dir(&mut self, path: &str) {
        let key = normalize_path(path);
        if key.is_empty() {
            return;
        }
        self.ensure_parents(&key);
        self.entries.insert(key, TreeEntry::Directory);
    }

    pub fn write_file(&mut self, path: &str, content: &str) {
        let key = normalize_path(path);
        if key.is_empty() {
            return;
        }
        self.ensure_parents(&key);
        self.entries.insert(
            key,
            TreeEntry::File {
                content: content.to_string(),
            },
        );
    }

    /// Remove `path` and everything beneath it. Returns removed entry count.
    pub fn remove(&mut self, path: &str) -> usize {
        let key = normalize_path(path);
        let prefix = format!("{key}/");
        let before = self.entries.len();
        self.entries
            .retain(|candidate, _| candidate != &key && !candidate.starts_with(&prefix));
        before - self.entries.len()
    }

    /// Apply a successful file operation.
    pub fn apply(&mut self, op: &FileOp) {
        match op.action {
            FileAction::Create | FileAction::Update => self.write_file(&op.path, &op.content),
            FileAction::Delete => {
                self.remove(&op.path);
            }
        }
    }

    /// Direct children of `dir` (`""` for the root), sorted by name.
    pub fn children(&self, dir: &str) -> Vec<(&str, &TreeEntry)> {
        let key = normalize_path(dir);
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };
        self.entries
            .iter()
            .filter_map(|(path, entry)| {
                let rest = path.strip_prefix(&prefix)?;
                (!rest.is_empty() && !rest.contains('/')).then_some((rest, entry))
            })
            .collect()
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(path, entry)| match entry {
            TreeEntry::File { content } => Some((path.as_str(), content.as_str())),
            TreeEntry::Directory => None,
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn ensure_parents(&mut self, key: &str) {
        let mut end = 0;
        while let Some(offset) = key[end..].find('/') {
            end += offset;
            self.entries
                .entry(key[..end].to_string())
                .or_insert(TreeEntry::Directory);
            end += 1;
        }
    }
}
