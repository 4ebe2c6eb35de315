//! Incremental tag decoder.
//!
//! A restartable state machine over a cumulative text buffer. All state lives
//! in an owned [`ParseState`]; [`extend`] appends new text and [`step`] drives
//! the machine to a fixed point, yielding whenever the buffer ends mid-tag or
//! mid-content. Text before the cursor is never scanned again.
//!
//! Recognized markup:
//!
//! ```text
//! <file path="src/a.ts" action="create|update|delete">...</file>
//! <file path="old.js" action="delete"/>
//! <terminal command="npm run dev" bg="true"/>
//! ```
//!
//! Anything else that looks like a tag is folded back into the surrounding
//! text verbatim.

use tracing::trace;

use crate::core::attrs::{TagHead, is_truthy, parse_tag};
use crate::core::identity::{command_id, file_id, narration_id};
use crate::core::node::{CommandOp, FileAction, FileOp, StreamNode};

const FILE_TAG: &str = "file";
const TERMINAL_TAG: &str = "terminal";
const FILE_CLOSE: &str = "</file>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderMode {
    SearchingForTag,
    CapturingTagDefinition,
    CapturingFileContent,
}

/// Decoder state for one conversation turn.
#[derive(Debug, Clone)]
pub struct ParseState {
    turn_id: String,
    buffer: String,
    cursor: usize,
    mode: DecoderMode,
    nodes: Vec<StreamNode>,
    /// Index into `nodes` of the file whose body is streaming.
    open_file: Option<usize>,
    /// Whether the line break right after the open tag has been resolved.
    body_started: bool,
}

impl ParseState {
    pub fn new(turn_id: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            buffer: String::new(),
            cursor: 0,
            mode: DecoderMode::SearchingForTag,
            nodes: Vec::new(),
            open_file: None,
            body_started: false,
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn mode(&self) -> DecoderMode {
        self.mode
    }

    /// The file node whose body is still streaming, if any.
    pub fn open_file(&self) -> Option<&FileOp> {
        match self.nodes.get(self.open_file?) {
            Some(StreamNode::File(op)) => Some(op),
            _ => None,
        }
    }

    /// Nodes for callers: blank narration removed.
    pub fn visible_nodes(&self) -> Vec<StreamNode> {
        self.nodes
            .iter()
            .filter(|node| !node.is_blank_narration())
            .cloned()
            .collect()
    }

    fn push_narration(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(StreamNode::Narration { text: last, .. }) = self.nodes.last_mut() {
            last.push_str(text);
            return;
        }
        let id = narration_id(&self.turn_id, self.nodes.len());
        self.nodes.push(StreamNode::Narration {
            id,
            text: text.to_string(),
        });
    }

    fn push_file_content(&mut self, text: &str) {
        if let Some(StreamNode::File(op)) = self.open_file.and_then(|idx| self.nodes.get_mut(idx)) {
            op.content.push_str(text);
        }
    }

    /// Tags are only captured outside file bodies, so literal tag text is
    /// always narration.
    fn fold_literal(&mut self, text: &str) {
        self.push_narration(text);
        self.mode = DecoderMode::SearchingForTag;
    }

    fn close_open_file(&mut self) {
        if let Some(StreamNode::File(op)) = self.open_file.and_then(|idx| self.nodes.get_mut(idx)) {
            op.closed = true;
        }
        self.open_file = None;
    }
}

/// Append `suffix` to the buffer and run the machine.
pub fn extend(state: &mut ParseState, suffix: &str) {
    state.buffer.push_str(suffix);
    step(state);
}

/// Drive the machine until it needs more input.
pub fn step(state: &mut ParseState) {
    loop {
        let progressed = match state.mode {
            DecoderMode::SearchingForTag => search_for_tag(state),
            DecoderMode::CapturingTagDefinition => capture_tag_definition(state),
            DecoderMode::CapturingFileContent => capture_file_content(state),
        };
        if !progressed {
            break;
        }
    }
}

fn search_for_tag(state: &mut ParseState) -> bool {
    let rest = &state.buffer[state.cursor..];
    match rest.find('<') {
        None => {
            let text = rest.to_string();
            state.cursor = state.buffer.len();
            state.push_narration(&text);
            false
        }
        Some(offset) => {
            let text = rest[..offset].to_string();
            state.cursor += offset;
            state.push_narration(&text);
            state.mode = DecoderMode::CapturingTagDefinition;
            true
        }
    }
}

fn capture_tag_definition(state: &mut ParseState) -> bool {
    let rest = &state.buffer[state.cursor..];
    // rest starts with '<'; a second '<' before any '>' abandons this candidate.
    let Some(end) = tag_boundary(rest) else {
        return false;
    };
    if rest.as_bytes()[end] == b'<' {
        let literal = rest[..end].to_string();
        state.cursor += end;
        state.fold_literal(&literal);
        return true;
    }

    let raw = rest[..=end].to_string();
    state.cursor += end + 1;
    match classify(&state.turn_id, &raw) {
        TagMatch::FileOpen(op) => {
            trace!(path = %op.path, action = %op.action, "file tag opened");
            state.nodes.push(StreamNode::File(op));
            state.open_file = Some(state.nodes.len() - 1);
            state.body_started = false;
            state.mode = DecoderMode::CapturingFileContent;
        }
        TagMatch::FileDelete(op) => {
            trace!(path = %op.path, "self-closing delete");
            state.nodes.push(StreamNode::File(op));
            state.mode = DecoderMode::SearchingForTag;
        }
        TagMatch::Command(op) => {
            trace!(command = %op.command, background = op.background, "terminal tag");
            state.nodes.push(StreamNode::Command(op));
            state.mode = DecoderMode::SearchingForTag;
        }
        TagMatch::Literal => state.fold_literal(&raw),
    }
    true
}

/// Offset of the first `<` or `>` after the leading `<`, skipping quoted
/// attribute values. A quote only opens a value right after `=`.
fn tag_boundary(rest: &str) -> Option<usize> {
    let mut quote = None;
    let mut after_equals = false;
    for (idx, byte) in rest.bytes().enumerate().skip(1) {
        if let Some(open) = quote {
            if byte == open {
                quote = None;
            }
            continue;
        }
        match byte {
            b'<' | b'>' => return Some(idx),
            b'"' | b'\'' if after_equals => quote = Some(byte),
            _ => {}
        }
        if !byte.is_ascii_whitespace() {
            after_equals = byte == b'=';
        }
    }
    None
}

fn capture_file_content(state: &mut ParseState) -> bool {
    if !state.body_started {
        let rest = &state.buffer[state.cursor..];
        if rest.is_empty() || rest == "\r" {
            return false;
        }
        if rest.starts_with("\r\n") {
            state.cursor += 2;
        } else if rest.starts_with('\n') {
            state.cursor += 1;
        }
        state.body_started = true;
    }

    let rest = &state.buffer[state.cursor..];
    match rest.find(FILE_CLOSE) {
        Some(offset) => {
            let body = rest[..offset].to_string();
            state.cursor += offset + FILE_CLOSE.len();
            state.push_file_content(&body);
            state.close_open_file();
            state.mode = DecoderMode::SearchingForTag;
            true
        }
        None => {
            let take = rest.len() - partial_close_len(rest);
            let body = rest[..take].to_string();
            state.cursor += take;
            state.push_file_content(&body);
            false
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `</file>`.
fn partial_close_len(text: &str) -> usize {
    (1..FILE_CLOSE.len())
        .rev()
        .find(|&len| text.ends_with(&FILE_CLOSE[..len]))
        .unwrap_or(0)
}

enum TagMatch {
    FileOpen(FileOp),
    FileDelete(FileOp),
    Command(CommandOp),
    Literal,
}

fn classify(turn_id: &str, raw: &str) -> TagMatch {
    let Some(head) = parse_tag(raw) else {
        return TagMatch::Literal;
    };
    if head.end_tag {
        return TagMatch::Literal;
    }
    match head.name.as_str() {
        FILE_TAG => classify_file(turn_id, &head),
        TERMINAL_TAG => classify_terminal(turn_id, &head),
        _ => TagMatch::Literal,
    }
}

fn classify_file(turn_id: &str, head: &TagHead) -> TagMatch {
    let (Some(path), Some(action)) = (head.attr("path"), head.attr("action")) else {
        return TagMatch::Literal;
    };
    let Some(action) = FileAction::parse(action) else {
        return TagMatch::Literal;
    };
    let op = FileOp {
        id: file_id(turn_id, action, path),
        path: path.to_string(),
        action,
        content: String::new(),
        closed: false,
    };
    match (head.self_closing, action) {
        (false, _) => TagMatch::FileOpen(op),
        (true, FileAction::Delete) => TagMatch::FileDelete(FileOp { closed: true, ..op }),
        // Self-closed create/update has no body to write.
        (true, _) => TagMatch::Literal,
    }
}

fn classify_terminal(turn_id: &str, head: &TagHead) -> TagMatch {
    if !head.self_closing {
        return TagMatch::Literal;
    }
    let Some(command) = head.attr("command") else {
        return TagMatch::Literal;
    };
    TagMatch::Command(CommandOp {
        id: command_id(turn_id, command),
        command: command.to_string(),
        background: head.attr("bg").is_some_and(is_truthy),
    })
}
