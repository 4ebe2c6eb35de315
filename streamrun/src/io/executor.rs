//! File and command executors.
//!
//! Both convert every failure into an `Err` value; the queue decides what a
//! failure means for the rest of the batch.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument};

use crate::core::file_tree::normalize_path;
use crate::core::node::{CommandOp, FileAction, FileOp};
use crate::io::sandbox::{ProcessHandle, ProcessHost, SandboxFs};
use crate::io::shell::ShellSession;

/// Reject operations that should never have been classified ready.
pub fn validate_file_op(op: &FileOp) -> Result<()> {
    if normalize_path(&op.path).is_empty() {
        bail!("file operation {} has no path", op.id);
    }
    if !op.closed {
        bail!("file operation {} on {} is not closed", op.id, op.path);
    }
    Ok(())
}

pub fn validate_command_op(op: &CommandOp) -> Result<()> {
    if op.command.trim().is_empty() {
        bail!("command {} is empty", op.id);
    }
    Ok(())
}

/// Parent directory of a sandbox path, if it has one.
fn parent_dir(path: &str) -> Option<String> {
    let normalized = normalize_path(path);
    normalized
        .rsplit_once('/')
        .map(|(parent, _)| parent.to_string())
}

pub struct FileExecutor<F> {
    fs: Arc<F>,
}

impl<F: SandboxFs> FileExecutor<F> {
    pub fn new(fs: Arc<F>) -> Self {
        Self { fs }
    }

    /// Create/update overwrite the whole file; delete removes recursively.
    #[instrument(skip_all, fields(path = %op.path, action = %op.action))]
    pub async fn execute(&self, op: &FileOp) -> Result<()> {
        validate_file_op(op)?;
        match op.action {
            FileAction::Create | FileAction::Update => {
                if let Some(parent) = parent_dir(&op.path) {
                    self.fs
                        .mkdir(&parent, true)
                        .await
                        .with_context(|| format!("create parent of {}", op.path))?;
                }
                self.fs
                    .write_file(&op.path, &op.content)
                    .await
                    .with_context(|| format!("{} {}", op.action, op.path))?;
            }
            FileAction::Delete => {
                self.fs
                    .rm(&op.path, true)
                    .await
                    .with_context(|| format!("delete {}", op.path))?;
            }
        }
        debug!(bytes = op.content.len(), "file operation applied");
        Ok(())
    }
}

/// What happened to a command.
pub enum CommandOutcome {
    /// Written to the interactive shell.
    Injected,
    /// Spawned as its own process; the caller owns the handle.
    Spawned(ProcessHandle),
}

pub struct CommandExecutor<H> {
    host: Arc<H>,
    shell: Arc<ShellSession>,
}

impl<H: ProcessHost> CommandExecutor<H> {
    pub fn new(host: Arc<H>, shell: Arc<ShellSession>) -> Self {
        Self { host, shell }
    }

    pub fn shell(&self) -> &ShellSession {
        &self.shell
    }

    #[instrument(skip_all, fields(command = %op.command, background = op.background))]
    pub async fn execute(&self, op: &CommandOp) -> Result<CommandOutcome> {
        validate_command_op(op)?;
        if !op.background {
            self.shell
                .run(&op.command)
                .await
                .with_context(|| format!("run {}", op.command))?;
            info!("command sent to interactive shell");
            return Ok(CommandOutcome::Injected);
        }

        let mut parts = op.command.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            bail!("command {} is empty", op.id);
        };
        let args: Vec<String> = parts.collect();
        let handle = self
            .host
            .spawn(&program, &args, None)
            .await
            .with_context(|| format!("spawn {}", op.command))?;
        info!("background process started");
        Ok(CommandOutcome::Spawned(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::NodeId;
    use crate::events::EventBus;
    use crate::io::config::ShellConfig;
    use crate::test_support::{MemorySandbox, ScriptedProcess};

    fn file_op(path: &str, action: FileAction, content: &str) -> FileOp {
        FileOp {
            id: NodeId::new(format!("f-{path}")),
            path: path.to_string(),
            action,
            content: content.to_string(),
            closed: true,
        }
    }

    fn command(text: &str, background: bool) -> CommandOp {
        CommandOp {
            id: NodeId::new(format!("c-{text}")),
            command: text.to_string(),
            background,
        }
    }

    async fn command_executor(sandbox: &Arc<MemorySandbox>) -> CommandExecutor<MemorySandbox> {
        let shell = ShellSession::start(sandbox.as_ref(), &ShellConfig::default(), EventBus::new(8))
            .await
            .expect("shell");
        CommandExecutor::new(sandbox.clone(), Arc::new(shell))
    }

    #[test]
    fn parent_dir_of_nested_and_top_level_paths() {
        assert_eq!(parent_dir("src/a/b.ts").as_deref(), Some("src/a"));
        assert_eq!(parent_dir("./b.ts"), None);
    }

    #[tokio::test]
    async fn create_makes_parent_directories() {
        let sandbox = Arc::new(MemorySandbox::new());
        let executor = FileExecutor::new(sandbox.clone());
        executor
            .execute(&file_op("src/components/App.tsx", FileAction::Create, "app"))
            .await
            .expect("create");
        assert_eq!(sandbox.file("src/components/App.tsx").as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn update_overwrites_whole_file() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.seed_file("a.txt", "old content that is longer");
        let executor = FileExecutor::new(sandbox.clone());
        executor
            .execute(&file_op("a.txt", FileAction::Update, "new"))
            .await
            .expect("update");
        assert_eq!(sandbox.file("a.txt").as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn delete_removes_directory_recursively() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.seed_file("dist/a.js", "a");
        sandbox.seed_file("dist/lib/b.js", "b");
        let executor = FileExecutor::new(sandbox.clone());
        executor
            .execute(&file_op("dist", FileAction::Delete, ""))
            .await
            .expect("delete");
        assert!(sandbox.file("dist/lib/b.js").is_none());
    }

    #[tokio::test]
    async fn sandbox_failure_becomes_error_value() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.fail_path("locked.txt");
        let executor = FileExecutor::new(sandbox.clone());
        let err = executor
            .execute(&file_op("locked.txt", FileAction::Create, "x"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("create locked.txt"));
    }

    #[tokio::test]
    async fn structurally_invalid_ops_are_rejected() {
        let sandbox = Arc::new(MemorySandbox::new());
        let executor = FileExecutor::new(sandbox.clone());
        let mut open = file_op("a.txt", FileAction::Create, "x");
        open.closed = false;
        assert!(executor.execute(&open).await.is_err());
        assert!(executor.execute(&file_op("  ", FileAction::Create, "x")).await.is_err());
        assert!(sandbox.file("a.txt").is_none());
    }

    #[tokio::test]
    async fn foreground_command_is_written_to_shell() {
        let sandbox = Arc::new(MemorySandbox::new());
        let executor = command_executor(&sandbox).await;
        let outcome = executor.execute(&command("npm install", false)).await.expect("run");
        assert!(matches!(outcome, CommandOutcome::Injected));
        assert_eq!(sandbox.input_written("sh"), "npm install\n");
    }

    #[tokio::test]
    async fn background_command_is_split_on_whitespace() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script("npm", ScriptedProcess::new(vec!["ready\n"], 0));
        let executor = command_executor(&sandbox).await;
        let outcome = executor
            .execute(&command("npm  run   dev", true))
            .await
            .expect("spawn");
        assert!(matches!(outcome, CommandOutcome::Spawned(_)));
        let spawn = sandbox.spawns().pop().expect("spawn record");
        assert_eq!(spawn.program, "npm");
        assert_eq!(spawn.args, vec!["run".to_string(), "dev".to_string()]);
    }

    #[tokio::test]
    async fn failed_spawn_is_an_error() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.fail_spawn("vite");
        let executor = command_executor(&sandbox).await;
        assert!(executor.execute(&command("vite", true)).await.is_err());
    }
}
