//! Test-only fakes for the sandbox and the durable mirror.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use anyhow::{Result, bail};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};

use crate::core::file_tree::{FileTree, TreeEntry, normalize_path};
use crate::io::journal::{MirroredOperation, OperationMirror};
use crate::io::sandbox::{
    DirEntry, EntryKind, ProcessHandle, ProcessHost, SandboxFs, TerminalSize,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Output and exit code replayed by a spawned fake process.
#[derive(Debug, Clone)]
pub struct ScriptedProcess {
    pub chunks: Vec<String>,
    pub exit_code: i32,
}

impl ScriptedProcess {
    pub fn new(chunks: Vec<&str>, exit_code: i32) -> Self {
        Self {
            chunks: chunks.into_iter().map(str::to_string).collect(),
            exit_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRecord {
    pub program: String,
    pub args: Vec<String>,
    pub terminal: Option<TerminalSize>,
}

/// Keeps an unscripted process alive until the sandbox is dropped.
struct LiveProcess {
    _output: mpsc::UnboundedSender<String>,
    _exit: oneshot::Sender<i32>,
    _resize: mpsc::UnboundedReceiver<TerminalSize>,
}

#[derive(Clone, Default)]
struct RecordingInput(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for RecordingInput {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        lock(&self.0).extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// In-memory sandbox. Programs without a script behave like an interactive
/// shell: no output, never exit.
#[derive(Default)]
pub struct MemorySandbox {
    tree: Mutex<FileTree>,
    failing_paths: Mutex<HashSet<String>>,
    stalled_paths: Mutex<HashSet<String>>,
    operations: Mutex<Vec<String>>,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedProcess>>>,
    failing_programs: Mutex<HashSet<String>>,
    spawns: Mutex<Vec<SpawnRecord>>,
    inputs: Mutex<Vec<(String, RecordingInput)>>,
    live: Mutex<Vec<LiveProcess>>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_file(&self, path: &str, content: &str) {
        lock(&self.tree).write_file(path, content);
    }

    pub fn file(&self, path: &str) -> Option<String> {
        lock(&self.tree).read(path).map(str::to_string)
    }

    pub fn exists(&self, path: &str) -> bool {
        lock(&self.tree).get(path).is_some()
    }

    /// Writes and removals of `path` fail.
    pub fn fail_path(&self, path: &str) {
        lock(&self.failing_paths).insert(normalize_path(path));
    }

    /// Writes to `path` never complete.
    pub fn stall_path(&self, path: &str) {
        lock(&self.stalled_paths).insert(normalize_path(path));
    }

    /// Filesystem calls in order, e.g. `write a.txt`.
    pub fn operations(&self) -> Vec<String> {
        lock(&self.operations).clone()
    }

    /// Queue a script for the next spawn of `program`.
    pub fn script(&self, program: &str, process: ScriptedProcess) {
        lock(&self.scripts)
            .entry(program.to_string())
            .or_default()
            .push_back(process);
    }

    pub fn fail_spawn(&self, program: &str) {
        lock(&self.failing_programs).insert(program.to_string());
    }

    pub fn spawns(&self) -> Vec<SpawnRecord> {
        lock(&self.spawns).clone()
    }

    /// Everything written to stdin of processes named `program`.
    pub fn input_written(&self, program: &str) -> String {
        lock(&self.inputs)
            .iter()
            .filter(|(name, _)| name == program)
            .map(|(_, input)| String::from_utf8_lossy(&lock(&input.0)).into_owned())
            .collect()
    }

    fn record(&self, operation: String) {
        lock(&self.operations).push(operation);
    }

    fn check_writable(&self, path: &str) -> Result<String> {
        let key = normalize_path(path);
        if lock(&self.failing_paths).contains(&key) {
            bail!("permission denied: {key}");
        }
        Ok(key)
    }

    fn parent_exists(tree: &FileTree, key: &str) -> bool {
        match key.rsplit_once('/') {
            Some((parent, _)) => matches!(tree.get(parent), Some(TreeEntry::Directory)),
            None => true,
        }
    }
}

impl SandboxFs for MemorySandbox {
    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()> {
        let key = normalize_path(path);
        self.record(format!("mkdir {key}"));
        let mut tree = lock(&self.tree);
        if let Some(TreeEntry::File { .. }) = tree.get(&key) {
            bail!("not a directory: {key}");
        }
        if !recursive && !Self::parent_exists(&tree, &key) {
            bail!("no such directory: parent of {key}");
        }
        tree.insert_dir(&key);
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let key = self.check_writable(path)?;
        self.record(format!("write {key}"));
        let stalled = lock(&self.stalled_paths).contains(&key);
        if stalled {
            std::future::pending::<()>().await;
        }
        let mut tree = lock(&self.tree);
        if !Self::parent_exists(&tree, &key) {
            bail!("no such directory: parent of {key}");
        }
        if let Some(TreeEntry::Directory) = tree.get(&key) {
            bail!("is a directory: {key}");
        }
        tree.write_file(&key, content);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        match lock(&self.tree).read(path) {
            Some(content) => Ok(content.to_string()),
            None => bail!("no such file: {path}"),
        }
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let key = self.check_writable(path)?;
        self.record(format!("rm {key}"));
        let mut tree = lock(&self.tree);
        match tree.get(&key) {
            None => bail!("no such file or directory: {key}"),
            Some(TreeEntry::Directory) if !recursive && !tree.children(&key).is_empty() => {
                bail!("directory not empty: {key}")
            }
            Some(_) => {
                tree.remove(&key);
                Ok(())
            }
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let tree = lock(&self.tree);
        let key = normalize_path(path);
        if !key.is_empty() && !matches!(tree.get(&key), Some(TreeEntry::Directory)) {
            bail!("not a directory: {key}");
        }
        Ok(tree
            .children(&key)
            .into_iter()
            .map(|(name, entry)| DirEntry {
                name: name.to_string(),
                kind: match entry {
                    TreeEntry::File { .. } => EntryKind::File,
                    TreeEntry::Directory => EntryKind::Directory,
                },
            })
            .collect())
    }
}

impl ProcessHost for MemorySandbox {
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        terminal: Option<TerminalSize>,
    ) -> Result<ProcessHandle> {
        if lock(&self.failing_programs).contains(program) {
            bail!("spawn {program}: no such program");
        }
        lock(&self.spawns).push(SpawnRecord {
            program: program.to_string(),
            args: args.to_vec(),
            terminal,
        });
        let input = RecordingInput::default();
        lock(&self.inputs).push((program.to_string(), input.clone()));

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();

        let script = lock(&self.scripts)
            .get_mut(program)
            .and_then(VecDeque::pop_front);
        match script {
            Some(script) => {
                tokio::spawn(async move {
                    for chunk in script.chunks {
                        let _ = output_tx.send(chunk);
                        tokio::task::yield_now().await;
                    }
                    drop(output_tx);
                    let _ = exit_tx.send(script.exit_code);
                });
            }
            None => lock(&self.live).push(LiveProcess {
                _output: output_tx,
                _exit: exit_tx,
                _resize: resize_rx,
            }),
        }

        Ok(ProcessHandle {
            input: Box::new(input),
            output: output_rx,
            exit: exit_rx,
            resize: resize_tx,
        })
    }
}

/// Mirror that records every save; optionally fails them.
#[derive(Default)]
pub struct RecordingMirror {
    saves: Mutex<Vec<(String, Vec<MirroredOperation>)>>,
    fail: Mutex<bool>,
}

impl RecordingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let mirror = Self::default();
        *lock(&mirror.fail) = true;
        mirror
    }

    pub fn saves(&self) -> Vec<(String, Vec<MirroredOperation>)> {
        lock(&self.saves).clone()
    }
}

impl OperationMirror for RecordingMirror {
    async fn save_operations(&self, scope_id: &str, operations: &[MirroredOperation]) -> Result<()> {
        if *lock(&self.fail) {
            bail!("storage unavailable");
        }
        lock(&self.saves).push((scope_id.to_string(), operations.to_vec()));
        Ok(())
    }
}
