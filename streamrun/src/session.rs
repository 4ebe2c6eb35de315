//! One streaming session: decoder registry, dispatch registry and pipeline.
//!
//! The conversational loop calls [`Session::ingest`] with the cumulative text
//! of the current turn every time it grows. Newly ready instructions are
//! enqueued exactly once, in stream order.

use tracing::debug;

use crate::core::node::{NodeId, StreamNode};
use crate::core::readiness::DispatchRegistry;
use crate::core::registry::DecoderRegistry;
use crate::core::status::NodeStatus;
use crate::io::journal::OperationMirror;
use crate::io::sandbox::Sandbox;
use crate::pipeline::{DrainReport, Pipeline};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ingested {
    /// Full visible node sequence for the turn so far.
    pub nodes: Vec<StreamNode>,
    /// Instructions enqueued by this call.
    pub enqueued: usize,
}

pub struct Session<S, M> {
    scope_id: String,
    decoder: DecoderRegistry,
    dispatch: DispatchRegistry,
    pipeline: Pipeline<S, M>,
}

impl<S: Sandbox, M: OperationMirror> Session<S, M> {
    pub fn new(scope_id: impl Into<String>, pipeline: Pipeline<S, M>) -> Self {
        Self {
            scope_id: scope_id.into(),
            decoder: DecoderRegistry::new(),
            dispatch: DispatchRegistry::new(),
            pipeline,
        }
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn pipeline(&self) -> &Pipeline<S, M> {
        &self.pipeline
    }

    /// Decode only; nothing is enqueued.
    pub fn parse(&mut self, turn_id: &str, cumulative: &str) -> Vec<StreamNode> {
        self.decoder.parse(turn_id, cumulative)
    }

    /// Decode and enqueue whatever became ready.
    pub fn ingest(&mut self, turn_id: &str, cumulative: &str) -> Ingested {
        let nodes = self.decoder.parse(turn_id, cumulative);
        let ready = self.dispatch.take_ready(&nodes);
        if !ready.is_empty() {
            debug!(turn_id, count = ready.len(), "dispatching ready instructions");
        }
        let enqueued = self.pipeline.enqueue(&self.scope_id, ready);
        Ingested { nodes, enqueued }
    }

    /// [`Session::ingest`], then drain if anything was enqueued.
    pub async fn ingest_and_drain(
        &mut self,
        turn_id: &str,
        cumulative: &str,
    ) -> (Ingested, Option<DrainReport>) {
        let ingested = self.ingest(turn_id, cumulative);
        if ingested.enqueued == 0 {
            return (ingested, None);
        }
        let report = self.pipeline.process_queue().await;
        (ingested, report)
    }

    pub fn status(&self, id: &NodeId) -> NodeStatus {
        self.pipeline.status(id)
    }

    pub fn was_dispatched(&self, id: &NodeId) -> bool {
        self.dispatch.was_dispatched(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::io::config::StreamConfig;
    use crate::test_support::{MemorySandbox, RecordingMirror};

    async fn session(sandbox: &Arc<MemorySandbox>) -> Session<MemorySandbox, RecordingMirror> {
        let pipeline = Pipeline::start(
            sandbox.clone(),
            Arc::new(RecordingMirror::new()),
            &StreamConfig::default(),
        )
        .await
        .expect("pipeline");
        Session::new("project-1", pipeline)
    }

    const TURN: &str = "Writing files.\n<file path=\"a.txt\" action=\"create\">\nalpha\n</file>\n<terminal command=\"ls\"/>\n<file path=\"b.txt\" action=\"create\">beta</file>";

    #[tokio::test]
    async fn growing_buffer_dispatches_each_instruction_once() {
        let sandbox = Arc::new(MemorySandbox::new());
        let mut session = session(&sandbox).await;

        let mut total = 0;
        for end in (1..=TURN.len()).filter(|end| TURN.is_char_boundary(*end)) {
            let (ingested, _) = session.ingest_and_drain("turn-1", &TURN[..end]).await;
            total += ingested.enqueued;
        }
        let (again, report) = session.ingest_and_drain("turn-1", TURN).await;

        assert_eq!(total, 3);
        assert_eq!(again.enqueued, 0);
        assert!(report.is_none());
        assert_eq!(sandbox.file("a.txt").as_deref(), Some("alpha\n"));
        assert_eq!(sandbox.file("b.txt").as_deref(), Some("beta"));
        assert_eq!(sandbox.input_written("sh"), "ls\n");
        assert_eq!(
            sandbox.operations(),
            vec!["write a.txt".to_string(), "write b.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn open_file_is_not_dispatched_until_closed() {
        let sandbox = Arc::new(MemorySandbox::new());
        let mut session = session(&sandbox).await;
        let partial = "<file path=\"a.txt\" action=\"create\">hel";
        let ingested = session.ingest("turn-1", partial);
        assert_eq!(ingested.enqueued, 0);
        assert_eq!(ingested.nodes.len(), 1);

        let ingested = session.ingest("turn-1", &format!("{partial}lo</file>"));
        assert_eq!(ingested.enqueued, 1);
        let id = ingested.nodes[0].id().clone();
        assert!(session.was_dispatched(&id));
        assert_eq!(session.status(&id), NodeStatus::Pending);
    }

    #[tokio::test]
    async fn new_turn_may_repeat_a_command() {
        let sandbox = Arc::new(MemorySandbox::new());
        let mut session = session(&sandbox).await;
        let text = "<terminal command=\"npm test\"/>";
        session.ingest_and_drain("turn-1", text).await;
        let (ingested, _) = session.ingest_and_drain("turn-2", text).await;
        assert_eq!(ingested.enqueued, 1);
        assert_eq!(sandbox.input_written("sh"), "npm test\nnpm test\n");
    }

    #[tokio::test]
    async fn aborted_items_stay_dispatched() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.fail_path("b.txt");
        let mut session = session(&sandbox).await;
        let text = "<file path=\"a.txt\" action=\"create\">a</file><file path=\"b.txt\" action=\"create\">b</file><file path=\"c.txt\" action=\"create\">c</file>";
        let (ingested, report) = session.ingest_and_drain("turn-1", text).await;
        let report = report.expect("drained");
        assert!(report.aborted());
        assert_eq!(report.discarded.len(), 1);

        let third = ingested.nodes[2].id().clone();
        assert!(session.was_dispatched(&third));
        let (again, _) = session.ingest_and_drain("turn-1", text).await;
        assert_eq!(again.enqueued, 0);
        assert!(!sandbox.exists("c.txt"));
    }
}
