//! Best-effort durable mirror of successful file operations.
//!
//! The queue fires `save_operations` without awaiting it; failures are
//! logged and published but never affect execution.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::node::{FileAction, FileOp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirroredOperation {
    pub path: String,
    pub action: FileAction,
    pub content: String,
}

impl From<&FileOp> for MirroredOperation {
    fn from(op: &FileOp) -> Self {
        Self {
            path: op.path.clone(),
            action: op.action,
            content: op.content.clone(),
        }
    }
}

pub trait OperationMirror: Send + Sync + 'static {
    fn save_operations(
        &self,
        scope_id: &str,
        operations: &[MirroredOperation],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMirror;

impl OperationMirror for NoopMirror {
    async fn save_operations(&self, _scope_id: &str, _operations: &[MirroredOperation]) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct JournalRecord<'a> {
    scope: &'a str,
    operations: &'a [MirroredOperation],
}

/// Appends one JSON line per call.
#[derive(Debug)]
pub struct JournalMirror {
    path: PathBuf,
    // Serializes appends from concurrently spawned saves.
    write_lock: Mutex<()>,
}

impl JournalMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OperationMirror for JournalMirror {
    async fn save_operations(&self, scope_id: &str, operations: &[MirroredOperation]) -> Result<()> {
        let mut line = serde_json::to_string(&JournalRecord {
            scope: scope_id,
            operations,
        })
        .context("serialize journal record")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create journal dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open journal {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("append journal {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flush journal {}", self.path.display()))
    }
}

/// Either mirror, chosen from configuration.
#[derive(Debug)]
pub enum ConfiguredMirror {
    Noop(NoopMirror),
    Journal(JournalMirror),
}

impl ConfiguredMirror {
    pub fn from_path(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => Self::Journal(JournalMirror::new(path)),
            None => Self::Noop(NoopMirror),
        }
    }
}

impl OperationMirror for ConfiguredMirror {
    async fn save_operations(&self, scope_id: &str, operations: &[MirroredOperation]) -> Result<()> {
        match self {
            Self::Noop(mirror) => mirror.save_operations(scope_id, operations).await,
            Self::Journal(mirror) => mirror.save_operations(scope_id, operations).await,
        }
    }
}
