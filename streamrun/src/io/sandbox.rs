//! Contracts for the sandbox host.
//!
//! The pipeline never touches the real filesystem or spawns processes
//! directly; it goes through [`SandboxFs`] and [`ProcessHost`]. Production
//! uses [`crate::io::local::LocalSandbox`]; tests use the fakes in
//! `test_support`.

use std::future::Future;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;

/// A running sandbox process.
pub struct ProcessHandle {
    /// Writable stdin.
    pub input: ProcessInput,
    /// Output text chunks (stdout and stderr interleaved) in arrival order.
    /// Closed once the process has no more output.
    pub output: mpsc::UnboundedReceiver<String>,
    /// Resolves with the exit code; `-1` when killed by a signal.
    pub exit: oneshot::Receiver<i32>,
    pub resize: mpsc::UnboundedSender<TerminalSize>,
}

/// Sandbox filesystem. Paths are sandbox-relative and `/`-separated.
pub trait SandboxFs: Send + Sync + 'static {
    fn mkdir(&self, path: &str, recursive: bool) -> impl Future<Output = Result<()>> + Send;

    fn write_file(&self, path: &str, content: &str) -> impl Future<Output = Result<()>> + Send;

    fn read_file(&self, path: &str) -> impl Future<Output = Result<String>> + Send;

    fn rm(&self, path: &str, recursive: bool) -> impl Future<Output = Result<()>> + Send;

    /// Entries of `path` (`""` for the root) with their kinds.
    fn read_dir(&self, path: &str) -> impl Future<Output = Result<Vec<DirEntry>>> + Send;
}

pub trait ProcessHost: Send + Sync + 'static {
    fn spawn(
        &self,
        program: &str,
        args: &[String],
        terminal: Option<TerminalSize>,
    ) -> impl Future<Output = Result<ProcessHandle>> + Send;
}

/// Both halves of a sandbox.
pub trait Sandbox: SandboxFs + ProcessHost {}

impl<T: SandboxFs + ProcessHost> Sandbox for T {}
