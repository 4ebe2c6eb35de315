//! Orchestration for `streamrun parse` and `streamrun run`.
//!
//! A recorded transcript is replayed as a growing cumulative buffer, the way
//! a model stream arrives, so the decoder sees tags split at arbitrary points.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::core::node::{Instruction, NodeId, StreamNode};
use crate::core::registry::DecoderRegistry;
use crate::events::PipelineEvent;
use crate::io::config::{DEFAULT_CONFIG_PATH, load_config};
use crate::io::journal::ConfiguredMirror;
use crate::io::local::LocalSandbox;
use crate::pipeline::Pipeline;
use crate::session::Session;

pub const DEFAULT_TURN_ID: &str = "turn-1";
pub const DEFAULT_SCOPE_ID: &str = "local";

/// Cumulative prefixes of `text`, growing by `chunk_chars` characters.
///
/// The last prefix is always the full text. `chunk_chars == 0` yields only
/// the full text.
pub fn cumulative_prefixes(text: &str, chunk_chars: usize) -> Vec<&str> {
    if chunk_chars == 0 || text.is_empty() {
        return vec![text];
    }
    let mut ends: Vec<usize> = text
        .char_indices()
        .map(|(idx, _)| idx)
        .skip(chunk_chars)
        .step_by(chunk_chars)
        .collect();
    ends.push(text.len());
    ends.into_iter().map(|end| &text[..end]).collect()
}

/// Decode a transcript without executing anything.
pub fn parse_transcript(text: &str, turn_id: &str, chunk_chars: usize) -> Vec<StreamNode> {
    let mut registry = DecoderRegistry::new();
    let mut nodes = Vec::new();
    for prefix in cumulative_prefixes(text, chunk_chars) {
        nodes = registry.parse(turn_id, prefix);
    }
    nodes
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Sandbox root directory.
    pub root: PathBuf,
    /// Defaults to `<root>/.streamrun/config.toml`.
    pub config_path: Option<PathBuf>,
    pub turn_id: String,
    pub chunk_chars: usize,
    /// How long to keep watching background output after the last drain.
    pub settle: Duration,
}

impl RunOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_path: None,
            turn_id: DEFAULT_TURN_ID.to_string(),
            chunk_chars: 0,
            settle: Duration::ZERO,
        }
    }

    fn resolved_config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.root.join(DEFAULT_CONFIG_PATH))
    }
}

/// Structured replay outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every dispatched instruction completed.
    Completed { executed: Vec<NodeId> },
    /// A batch aborted; replay stopped at that point.
    Failed {
        executed: Vec<NodeId>,
        failed: NodeId,
        message: String,
        discarded: Vec<NodeId>,
    },
}

/// Replay a transcript into a full session against a local sandbox.
pub async fn run_transcript(text: &str, options: &RunOptions) -> Result<RunOutcome> {
    if !options.root.is_dir() {
        bail!("sandbox root {} is not a directory", options.root.display());
    }
    let mut config = load_config(&options.resolved_config_path())?;
    if let Some(path) = config.journal.path.take() {
        config.journal.path = Some(resolve_against(&options.root, path));
    }

    let sandbox = Arc::new(LocalSandbox::new(&options.root));
    let mirror = Arc::new(ConfiguredMirror::from_path(config.journal.path.clone()));
    let pipeline = Pipeline::start(sandbox, mirror, &config)
        .await
        .context("start session")?;
    pipeline.hydrate_tree().await.context("hydrate file tree")?;
    pipeline.on_detection(|node_id, line| {
        println!("detected [{node_id}]: {line}");
    });
    let printer = tokio::spawn(print_events(pipeline.subscribe()));

    let mut session = Session::new(DEFAULT_SCOPE_ID, pipeline.clone());
    let mut executed = Vec::new();
    let mut outcome = None;
    for prefix in cumulative_prefixes(text, options.chunk_chars) {
        let (ingested, report) = session.ingest_and_drain(&options.turn_id, prefix).await;
        let Some(report) = report else {
            continue;
        };
        describe_completed(&ingested.nodes, &report.completed);
        executed.extend(report.completed);
        if let Some((failed, message)) = report.failed {
            outcome = Some(RunOutcome::Failed {
                executed: executed.clone(),
                failed,
                message,
                discarded: report.discarded,
            });
            break;
        }
    }
    // A drain that started while another was active leaves items behind.
    if outcome.is_none() && pipeline.queue_len() > 0 {
        warn!(remaining = pipeline.queue_len(), "draining leftover queue");
        if let Some(report) = pipeline.process_queue().await {
            executed.extend(report.completed);
        }
    }

    if !options.settle.is_zero() {
        tokio::time::sleep(options.settle).await;
    }
    printer.abort();

    let outcome = outcome.unwrap_or(RunOutcome::Completed { executed });
    info!(?outcome, "replay finished");
    Ok(outcome)
}

fn resolve_against(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn describe_completed(nodes: &[StreamNode], completed: &[NodeId]) {
    for node in nodes {
        let instruction = match node {
            StreamNode::File(op) => Instruction::File(op.clone()),
            StreamNode::Command(op) => Instruction::Command(op.clone()),
            StreamNode::Narration { .. } => continue,
        };
        if completed.contains(instruction.id()) {
            println!("completed: {}", instruction.describe());
        }
    }
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<PipelineEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(PipelineEvent::Status { line }) => println!("status: {line}"),
            Ok(PipelineEvent::Output { chunk, .. }) => print!("{chunk}"),
            Ok(PipelineEvent::PersistenceError { message }) => {
                eprintln!("persistence error: {message}");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
