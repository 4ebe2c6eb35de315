//! Ordered, single-drain execution queue.
//!
//! Instructions run strictly one at a time in enqueue order. The first
//! failure marks its node `error`, raises the out-of-band execution error and
//! drops every queued item that has not started. Background processes are the
//! one deliberate exception to serial execution: they are spawned by the
//! queue, then watched by a detached task that feeds the output scanner and
//! the ledger without holding up later items.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::core::file_tree::FileTree;
use crate::core::node::{FileAction, FileOp, Instruction, NodeId};
use crate::core::scanner::{OutputScanner, failure_regex};
use crate::core::status::{LedgerEntry, NodeStatus, StatusLedger};
use crate::events::{EventBus, OutputSource, PipelineEvent};
use crate::io::config::StreamConfig;
use crate::io::executor::{CommandExecutor, CommandOutcome, FileExecutor};
use crate::io::journal::{MirroredOperation, OperationMirror};
use crate::io::sandbox::{EntryKind, ProcessHandle, Sandbox};
use crate::io::shell::ShellSession;

pub const IDLE_STATUS: &str = "idle";

/// Directories skipped when hydrating the in-memory tree.
const HYDRATE_SKIP: &[&str] = &[".git", "node_modules", ".streamrun"];

pub type DetectionHook = Arc<dyn Fn(&NodeId, &str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub instruction: Instruction,
    /// Session scope the instruction belongs to (e.g. a project id).
    pub scope: String,
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: Vec<NodeId>,
    pub failed: Option<(NodeId, String)>,
    /// Queued items dropped after the failure.
    pub discarded: Vec<NodeId>,
}

impl DrainReport {
    pub fn aborted(&self) -> bool {
        self.failed.is_some()
    }
}

#[derive(Default)]
struct PipelineState {
    queue: VecDeque<QueueItem>,
    ledger: StatusLedger,
    tree: FileTree,
    active_file: Option<String>,
    current: Option<NodeId>,
    status_line: String,
    execution_error: Option<String>,
    hooks: Vec<DetectionHook>,
}

/// State shared with detached background watchers.
struct Shared {
    state: Mutex<PipelineState>,
    draining: AtomicBool,
    events: EventBus,
    failure_pattern: Regex,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status_line(&self, line: String) {
        self.state().status_line = line.clone();
        self.events.publish(PipelineEvent::Status { line });
    }

    fn set_node_status(&self, id: &NodeId, status: NodeStatus, message: Option<&str>) {
        let applied = {
            let mut state = self.state();
            match (status, message) {
                (NodeStatus::Error, Some(message)) => state.ledger.mark_error(id, message),
                (NodeStatus::Error, None) => state.ledger.mark_error(id, "failed"),
                (NodeStatus::Pending, _) => state.ledger.mark_pending(id),
                (NodeStatus::Executing, _) => state.ledger.mark_executing(id),
                (NodeStatus::Completed, _) => state.ledger.mark_completed(id),
            }
        };
        if applied {
            self.events.publish(PipelineEvent::NodeStatus {
                id: id.clone(),
                status,
            });
        }
    }

    fn detect(&self, node_id: &NodeId, line: String) {
        warn!(node = %node_id, line = %line, "failure signature in process output");
        let hooks = self.state().hooks.clone();
        for hook in &hooks {
            hook(node_id, &line);
        }
        self.events.publish(PipelineEvent::Detection {
            node_id: node_id.clone(),
            line,
        });
    }
}

pub struct Pipeline<S, M> {
    sandbox: Arc<S>,
    mirror: Arc<M>,
    files: Arc<FileExecutor<S>>,
    commands: Arc<CommandExecutor<S>>,
    shared: Arc<Shared>,
}

impl<S, M> Clone for Pipeline<S, M> {
    fn clone(&self) -> Self {
        Self {
            sandbox: self.sandbox.clone(),
            mirror: self.mirror.clone(),
            files: self.files.clone(),
            commands: self.commands.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<S: Sandbox, M: OperationMirror> Pipeline<S, M> {
    /// Build a pipeline around an already-started shell.
    pub fn new(
        sandbox: Arc<S>,
        mirror: Arc<M>,
        shell: Arc<ShellSession>,
        events: EventBus,
        failure_pattern: Regex,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PipelineState {
                status_line: IDLE_STATUS.to_string(),
                ..PipelineState::default()
            }),
            draining: AtomicBool::new(false),
            events,
            failure_pattern,
        });
        Self {
            files: Arc::new(FileExecutor::new(sandbox.clone())),
            commands: Arc::new(CommandExecutor::new(sandbox.clone(), shell)),
            sandbox,
            mirror,
            shared,
        }
    }

    /// Start the session shell from `config` and build the pipeline.
    pub async fn start(sandbox: Arc<S>, mirror: Arc<M>, config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.events.capacity);
        let pattern = failure_regex(&config.scanner.failure_pattern)?;
        let shell = ShellSession::start(sandbox.as_ref(), &config.shell, events.clone()).await?;
        Ok(Self::new(sandbox, mirror, Arc::new(shell), events, pattern))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Register a callback for the first failure line of each background
    /// process.
    pub fn on_detection<F>(&self, hook: F)
    where
        F: Fn(&NodeId, &str) + Send + Sync + 'static,
    {
        self.shared.state().hooks.push(Arc::new(hook));
    }

    pub fn shell(&self) -> &ShellSession {
        self.commands.shell()
    }

    pub fn status(&self, id: &NodeId) -> NodeStatus {
        self.shared.state().ledger.status(id)
    }

    pub fn ledger_entry(&self, id: &NodeId) -> Option<LedgerEntry> {
        self.shared.state().ledger.entry(id).cloned()
    }

    pub fn status_line(&self) -> String {
        self.shared.state().status_line.clone()
    }

    /// The node currently executing, if a drain is in progress.
    pub fn current(&self) -> Option<NodeId> {
        self.shared.state().current.clone()
    }

    /// Take the pending execution error, if any. Each error is returned once.
    pub fn take_execution_error(&self) -> Option<String> {
        self.shared.state().execution_error.take()
    }

    pub fn active_file(&self) -> Option<String> {
        self.shared.state().active_file.clone()
    }

    pub fn tree(&self) -> FileTree {
        self.shared.state().tree.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state().queue.len()
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::Acquire)
    }

    /// Append ready instructions; each starts `pending`.
    pub fn enqueue(&self, scope: &str, instructions: Vec<Instruction>) -> usize {
        let count = instructions.len();
        for instruction in instructions {
            let id = instruction.id().clone();
            debug!(node = %id, "enqueue {}", instruction.describe());
            self.shared.state().queue.push_back(QueueItem {
                instruction,
                scope: scope.to_string(),
            });
            self.shared.set_node_status(&id, NodeStatus::Pending, None);
        }
        count
    }

    /// Drain the queue. Returns `None` when another drain is already active;
    /// that drain picks up anything enqueued meanwhile.
    pub async fn process_queue(&self) -> Option<DrainReport> {
        if self.shared.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already active");
            return None;
        }
        let _drain = DrainGuard(&self.shared.draining);

        let mut report = DrainReport::default();
        while let Some(item) = self.pop_front() {
            let id = item.instruction.id().clone();
            self.begin(&item);
            match self.execute(&item).await {
                Ok(()) => {
                    self.complete(&item);
                    report.completed.push(id);
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    self.fail(&item, &message);
                    report.discarded = self.discard_remaining();
                    report.failed = Some((id, message));
                    break;
                }
            }
        }

        self.shared.state().current = None;
        self.shared.set_status_line(IDLE_STATUS.to_string());
        Some(report)
    }

    /// Rebuild the in-memory tree from the sandbox.
    #[instrument(skip_all)]
    pub async fn hydrate_tree(&self) -> Result<usize> {
        let mut tree = FileTree::new();
        let mut pending = vec![String::new()];
        while let Some(dir) = pending.pop() {
            let entries = self
                .sandbox
                .read_dir(&dir)
                .await
                .with_context(|| format!("list {dir:?}"))?;
            for entry in entries {
                if HYDRATE_SKIP.contains(&entry.name.as_str()) {
                    continue;
                }
                let path = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{dir}/{}", entry.name)
                };
                match entry.kind {
                    EntryKind::Directory => {
                        tree.insert_dir(&path);
                        pending.push(path);
                    }
                    EntryKind::File => match self.sandbox.read_file(&path).await {
                        Ok(content) => tree.write_file(&path, &content),
                        Err(err) => warn!(path = %path, err = %format!("{err:#}"), "skipping unreadable file"),
                    },
                }
            }
        }
        let count = tree.files().count();
        info!(files = count, "hydrated file tree");
        self.shared.state().tree = tree;
        Ok(count)
    }

    fn pop_front(&self) -> Option<QueueItem> {
        self.shared.state().queue.pop_front()
    }

    fn begin(&self, item: &QueueItem) {
        let id = item.instruction.id();
        self.shared.state().current = Some(id.clone());
        self.shared.set_node_status(id, NodeStatus::Executing, None);
        self.shared
            .set_status_line(format!("executing: {}", item.instruction.describe()));
    }

    async fn execute(&self, item: &QueueItem) -> Result<()> {
        match &item.instruction {
            Instruction::File(op) => self.files.execute(op).await,
            Instruction::Command(op) => match self.commands.execute(op).await? {
                CommandOutcome::Injected => Ok(()),
                CommandOutcome::Spawned(handle) => {
                    self.watch_background(op.id.clone(), handle);
                    Ok(())
                }
            },
        }
    }

    fn complete(&self, item: &QueueItem) {
        if let Instruction::File(op) = &item.instruction {
            self.mirror_file_op(&item.scope, op);
        }
        self.shared
            .set_node_status(item.instruction.id(), NodeStatus::Completed, None);
    }

    fn mirror_file_op(&self, scope: &str, op: &FileOp) {
        {
            let mut state = self.shared.state();
            state.tree.apply(op);
            if op.action != FileAction::Delete {
                state.active_file = Some(op.path.clone());
            } else if state.active_file.as_deref() == Some(op.path.as_str()) {
                state.active_file = None;
            }
        }

        let mirror = self.mirror.clone();
        let events = self.shared.events.clone();
        let scope = scope.to_string();
        let operations = vec![MirroredOperation::from(op)];
        tokio::spawn(async move {
            if let Err(err) = mirror.save_operations(&scope, &operations).await {
                let message = format!("{err:#}");
                warn!(scope = %scope, err = %message, "failed to mirror file operation");
                events.publish(PipelineEvent::PersistenceError { message });
            }
        });
    }

    fn fail(&self, item: &QueueItem, message: &str) {
        let id = item.instruction.id();
        warn!(node = %id, err = %message, "instruction failed, aborting batch");
        self.shared
            .set_node_status(id, NodeStatus::Error, Some(message));
        self.shared.state().execution_error = Some(message.to_string());
        self.shared.events.publish(PipelineEvent::ExecutionError {
            message: message.to_string(),
        });
        self.shared.set_status_line(format!(
            "error: {}: {message}",
            item.instruction.describe()
        ));
    }

    /// Drop every queued item; none of them has started.
    fn discard_remaining(&self) -> Vec<NodeId> {
        let mut state = self.shared.state();
        let dropped: Vec<NodeId> = state
            .queue
            .drain(..)
            .map(|item| item.instruction.id().clone())
            .collect();
        for id in &dropped {
            state.ledger.forget(id);
        }
        if !dropped.is_empty() {
            info!(count = dropped.len(), "discarded queued instructions");
        }
        dropped
    }

    /// Detached: stream output through the scanner, then record the exit.
    fn watch_background(&self, node_id: NodeId, handle: ProcessHandle) {
        let shared = self.shared.clone();
        let mut scanner = OutputScanner::new(shared.failure_pattern.clone());
        tokio::spawn(async move {
            let ProcessHandle {
                input: _input,
                mut output,
                exit,
                ..
            } = handle;
            while let Some(chunk) = output.recv().await {
                let hit = scanner.push(&chunk);
                shared.events.publish(PipelineEvent::Output {
                    source: OutputSource::Background(node_id.clone()),
                    chunk,
                });
                if let Some(line) = hit {
                    shared.detect(&node_id, line);
                }
            }
            if let Some(line) = scanner.finish() {
                shared.detect(&node_id, line);
            }
            let code = exit.await.unwrap_or(-1);
            debug!(node = %node_id, code, "background process exited");
            shared.state().ledger.record_exit(&node_id, code);
            shared
                .events
                .publish(PipelineEvent::BackgroundExited { node_id, code });
        });
    }
}

/// Clears the drain flag when the drain finishes or its future is dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::CommandOp;
    use crate::test_support::{MemorySandbox, RecordingMirror, ScriptedProcess};

    async fn pipeline(sandbox: &Arc<MemorySandbox>) -> Pipeline<MemorySandbox, RecordingMirror> {
        Pipeline::start(
            sandbox.clone(),
            Arc::new(RecordingMirror::new()),
            &StreamConfig::default(),
        )
        .await
        .expect("pipeline")
    }

    fn file(id: &str, path: &str, action: FileAction, content: &str) -> Instruction {
        Instruction::File(FileOp {
            id: NodeId::new(id),
            path: path.to_string(),
            action,
            content: content.to_string(),
            closed: true,
        })
    }

    fn command(id: &str, text: &str, background: bool) -> Instruction {
        Instruction::Command(CommandOp {
            id: NodeId::new(id),
            command: text.to_string(),
            background,
        })
    }

    #[tokio::test]
    async fn runs_items_in_order_and_mirrors_tree() {
        let sandbox = Arc::new(MemorySandbox::new());
        let pipeline = pipeline(&sandbox).await;
        pipeline.enqueue(
            "p1",
            vec![
                file("a", "src/a.ts", FileAction::Create, "a"),
                file("b", "src/b.ts", FileAction::Create, "b"),
                command("c", "npm test", false),
            ],
        );
        let report = pipeline.process_queue().await.expect("drained");
        assert_eq!(
            report.completed,
            vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("c")]
        );
        assert_eq!(pipeline.tree().read("src/b.ts"), Some("b"));
        assert_eq!(pipeline.active_file().as_deref(), Some("src/b.ts"));
        assert_eq!(pipeline.status_line(), IDLE_STATUS);
        assert_eq!(sandbox.input_written("sh"), "npm test\n");
    }

    #[tokio::test]
    async fn second_failure_aborts_the_rest() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.fail_path("two.txt");
        let pipeline = pipeline(&sandbox).await;
        pipeline.enqueue(
            "p1",
            vec![
                file("one", "one.txt", FileAction::Create, "1"),
                file("two", "two.txt", FileAction::Create, "2"),
                file("three", "three.txt", FileAction::Create, "3"),
            ],
        );
        let report = pipeline.process_queue().await.expect("drained");

        assert!(report.aborted());
        assert_eq!(report.discarded, vec![NodeId::new("three")]);
        assert_eq!(pipeline.status(&NodeId::new("one")), NodeStatus::Completed);
        assert_eq!(pipeline.status(&NodeId::new("two")), NodeStatus::Error);
        assert!(pipeline.ledger_entry(&NodeId::new("three")).is_none());
        assert!(!sandbox.exists("three.txt"));
        assert_eq!(pipeline.queue_len(), 0);

        let error = pipeline.take_execution_error().expect("error signal");
        assert!(error.contains("two.txt"));
        assert!(pipeline.take_execution_error().is_none());
    }

    #[tokio::test]
    async fn concurrent_drain_request_is_a_no_op() {
        let sandbox = Arc::new(MemorySandbox::new());
        let pipeline = pipeline(&sandbox).await;
        pipeline.shared.draining.store(true, Ordering::Release);
        pipeline.enqueue("p1", vec![file("a", "a.txt", FileAction::Create, "")]);
        assert!(pipeline.process_queue().await.is_none());
        assert_eq!(pipeline.queue_len(), 1);

        pipeline.shared.draining.store(false, Ordering::Release);
        let report = pipeline.process_queue().await.expect("drained");
        assert_eq!(report.completed.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_drain_releases_the_guard() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.stall_path("slow.txt");
        let pipeline = pipeline(&sandbox).await;
        pipeline.enqueue("p1", vec![file("slow", "slow.txt", FileAction::Create, "")]);

        let drain = tokio::time::timeout(std::time::Duration::from_millis(20), pipeline.process_queue());
        assert!(drain.await.is_err());
        assert!(!pipeline.is_draining());

        pipeline.enqueue("p1", vec![file("next", "next.txt", FileAction::Create, "")]);
        let report = pipeline.process_queue().await.expect("drained");
        assert_eq!(report.completed, vec![NodeId::new("next")]);
        assert!(sandbox.exists("next.txt"));
    }

    #[tokio::test]
    async fn delete_clears_tree_and_active_file() {
        let sandbox = Arc::new(MemorySandbox::new());
        let pipeline = pipeline(&sandbox).await;
        pipeline.enqueue(
            "p1",
            vec![
                file("a", "old.js", FileAction::Create, "x"),
                file("d", "old.js", FileAction::Delete, ""),
            ],
        );
        pipeline.process_queue().await.expect("drained");
        assert!(pipeline.tree().get("old.js").is_none());
        assert_eq!(pipeline.active_file(), None);
    }

    #[tokio::test]
    async fn background_output_is_scanned_after_queue_moves_on() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.script(
            "npm",
            ScriptedProcess::new(vec!["compiling\n", "\x1b[31mErr", "or: build fail", "ed\n"], 1),
        );
        let pipeline = pipeline(&sandbox).await;
        let detections = Arc::new(Mutex::new(Vec::new()));
        let sink = detections.clone();
        pipeline.on_detection(move |_, line| {
            sink.lock().expect("lock").push(line.to_string());
        });
        let mut events = pipeline.subscribe();

        pipeline.enqueue(
            "p1",
            vec![
                command("dev", "npm run dev", true),
                file("a", "a.txt", FileAction::Create, "a"),
            ],
        );
        let report = pipeline.process_queue().await.expect("drained");
        assert_eq!(report.completed.len(), 2);

        loop {
            match events.recv().await.expect("event") {
                PipelineEvent::BackgroundExited { node_id, code } => {
                    assert_eq!(node_id, NodeId::new("dev"));
                    assert_eq!(code, 1);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(
            detections.lock().expect("lock").clone(),
            vec!["Error: build failed".to_string()]
        );
        let entry = pipeline.ledger_entry(&NodeId::new("dev")).expect("entry");
        assert_eq!(entry.status, NodeStatus::Completed);
        assert_eq!(entry.exit_code, Some(1));
    }

    #[tokio::test]
    async fn hydrate_reads_existing_files() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.seed_file("src/main.ts", "main");
        sandbox.seed_file("node_modules/x/index.js", "skip");
        let pipeline = pipeline(&sandbox).await;
        assert_eq!(pipeline.hydrate_tree().await.expect("hydrate"), 1);
        assert_eq!(pipeline.tree().read("src/main.ts"), Some("main"));
        assert!(pipeline.tree().get("node_modules").is_none());
    }
}
