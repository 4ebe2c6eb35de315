//! Turn-keyed owner of the live [`ParseState`].
//!
//! Exactly one decoder instance is live at a time. A new turn identifier, or a
//! buffer that does not extend the previous one, discards the old state.

use tracing::{debug, warn};

use crate::core::decoder::{ParseState, extend};
use crate::core::node::StreamNode;

#[derive(Debug, Default)]
pub struct DecoderRegistry {
    active: Option<ParseState>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the cumulative text of `turn_id`.
    ///
    /// Idempotent for an unchanged buffer; monotonic for a growing one.
    pub fn parse(&mut self, turn_id: &str, cumulative: &str) -> Vec<StreamNode> {
        let state = self.state_for(turn_id, cumulative);
        let seen = state.buffer().len();
        if cumulative.len() > seen {
            extend(state, &cumulative[seen..]);
        }
        state.visible_nodes()
    }

    pub fn current_turn(&self) -> Option<&str> {
        self.active.as_ref().map(ParseState::turn_id)
    }

    pub fn state(&self) -> Option<&ParseState> {
        self.active.as_ref()
    }

    pub fn reset(&mut self) {
        self.active = None;
    }

    fn state_for(&mut self, turn_id: &str, cumulative: &str) -> &mut ParseState {
        let keep = match &self.active {
            Some(state) if state.turn_id() != turn_id => {
                debug!(from = state.turn_id(), to = turn_id, "turn changed, discarding parse state");
                false
            }
            Some(state) if !cumulative.starts_with(state.buffer()) => {
                warn!(
                    turn_id,
                    previous_len = state.buffer().len(),
                    new_len = cumulative.len(),
                    "buffer does not extend the previous one, restarting decoder"
                );
                false
            }
            Some(_) => true,
            None => false,
        };
        if !keep {
            self.active = None;
        }
        self.active.get_or_insert_with(|| ParseState::new(turn_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "Setting up.\n<file path=\"a.txt\" action=\"create\">hello</file>\n<terminal command=\"cat a.txt\"/>\nDone.";

    fn executable_ids(nodes: &[StreamNode]) -> Vec<String> {
        nodes
            .iter()
            .filter(|node| !matches!(node, StreamNode::Narration { .. }))
            .map(|node| node.id().to_string())
            .collect()
    }

    #[test]
    fn reparse_of_same_buffer_is_idempotent() {
        let mut registry = DecoderRegistry::new();
        let first = registry.parse("t1", STREAM);
        let second = registry.parse("t1", STREAM);
        assert_eq!(first, second);
    }

    #[test]
    fn growing_prefixes_keep_identities() {
        let mut registry = DecoderRegistry::new();
        let mut previous: Vec<String> = Vec::new();
        for end in (1..=STREAM.len()).filter(|end| STREAM.is_char_boundary(*end)) {
            let ids = executable_ids(&registry.parse("t1", &STREAM[..end]));
            assert!(
                ids.starts_with(&previous),
                "ids regressed at {end}: {previous:?} -> {ids:?}"
            );
            previous = ids;
        }
        assert_eq!(previous.len(), 2);
        assert_eq!(registry.state().map(ParseState::cursor), Some(STREAM.len()));
    }

    #[test]
    fn chunked_and_whole_parses_agree() {
        let mut chunked = DecoderRegistry::new();
        for end in (7..STREAM.len()).step_by(7) {
            chunked.parse("t1", &STREAM[..end]);
        }
        let from_chunks = chunked.parse("t1", STREAM);

        let mut whole = DecoderRegistry::new();
        assert_eq!(from_chunks, whole.parse("t1", STREAM));
    }

    #[test]
    fn new_turn_discards_state() {
        let mut registry = DecoderRegistry::new();
        registry.parse("t1", STREAM);
        let nodes = registry.parse("t2", "fresh");
        assert_eq!(registry.current_turn(), Some("t2"));
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn non_extending_buffer_restarts() {
        let mut registry = DecoderRegistry::new();
        registry.parse("t1", "<terminal command=\"ls\"/>");
        let nodes = registry.parse("t1", "rewritten");
        assert_eq!(nodes.len(), 1);
        assert!(matches!(&nodes[0], StreamNode::Narration { text, .. } if text == "rewritten"));
    }
}
