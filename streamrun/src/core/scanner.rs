//! Failure-signature detection over streamed process output.
//!
//! Output arrives in arbitrary chunks. The scanner keeps the trailing partial
//! line, splits completed lines on `\r\n`, `\n` or `\r`, strips ANSI escape
//! sequences and tests each line against the failure pattern. Only the first
//! match per process is reported.

use std::borrow::Cow;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};

pub const DEFAULT_FAILURE_PATTERN: &str = r"error|err!|failed|exception|could not be resolved";

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]").unwrap()
});

/// Compile a failure pattern, matched case-insensitively.
pub fn failure_regex(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("compile failure pattern {pattern:?}"))
}

pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_RE.replace_all(line, "")
}

#[derive(Debug, Clone)]
pub struct OutputScanner {
    pattern: Regex,
    pending: String,
    detected: bool,
}

impl OutputScanner {
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            pending: String::new(),
            detected: false,
        }
    }

    pub fn has_detected(&self) -> bool {
        self.detected
    }

    /// Feed a chunk. Returns the cleaned line on the first match.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        if self.detected {
            return None;
        }
        self.pending.push_str(chunk);
        while let Some(idx) = self.pending.find(['\r', '\n']) {
            let width = if self.pending[idx..].starts_with("\r\n") { 2 } else { 1 };
            let line = self.pending[..idx].to_string();
            self.pending.drain(..idx + width);
            if let Some(hit) = self.test(&line) {
                self.pending.clear();
                return Some(hit);
            }
        }
        None
    }

    /// Flush the trailing partial line, e.g. when the process exits.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.pending);
        if self.detected || line.is_empty() {
            return None;
        }
        self.test(&line)
    }

    fn test(&mut self, raw: &str) -> Option<String> {
        let cleaned = strip_ansi(raw);
        let cleaned = cleaned.trim_end();
        if self.pattern.is_match(cleaned) {
            self.detected = true;
            return Some(cleaned.to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> OutputScanner {
        OutputScanner::new(failure_regex(DEFAULT_FAILURE_PATTERN).expect("pattern"))
    }

    #[test]
    fn joins_line_split_across_chunks() {
        let mut scanner = scanner();
        let hits: Vec<String> = ["Err", "or: build fail", "ed\n"]
            .iter()
            .filter_map(|chunk| scanner.push(chunk))
            .collect();
        assert_eq!(hits, vec!["Error: build failed".to_string()]);
    }

    #[test]
    fn reports_only_first_match() {
        let mut scanner = scanner();
        assert!(scanner.push("error one\n").is_some());
        assert!(scanner.push("error two\n").is_none());
        assert!(scanner.finish().is_none());
    }

    #[test]
    fn strips_ansi_before_matching() {
        let mut scanner = scanner();
        let hit = scanner.push("\x1b[31mERROR\x1b[0m in ./src/App.tsx\r\n");
        assert_eq!(hit.as_deref(), Some("ERROR in ./src/App.tsx"));
    }

    #[test]
    fn carriage_return_terminates_lines() {
        let mut scanner = scanner();
        assert!(scanner.push("progress 10%\rprogress 20%\r").is_none());
        assert_eq!(
            scanner.push("Module not found: could not be resolved\r").as_deref(),
            Some("Module not found: could not be resolved")
        );
    }

    #[test]
    fn partial_line_tested_on_finish() {
        let mut scanner = scanner();
        assert!(scanner.push("npm ERR! install failed").is_none());
        assert_eq!(scanner.finish().as_deref(), Some("npm ERR! install failed"));
    }

    #[test]
    fn tokens_inside_words_match() {
        for line in [
            "TypeError: Cannot read properties of undefined",
            "SyntaxError: Unexpected token",
            "Found 3 errors.",
            "npm ERR! code ELIFECYCLE",
        ] {
            let mut scanner = scanner();
            assert_eq!(
                scanner.push(&format!("{line}\n")).as_deref(),
                Some(line),
                "{line}"
            );
        }
    }

    #[test]
    fn clean_output_does_not_match() {
        let mut scanner = scanner();
        assert!(scanner.push("VITE v5.0.0 ready in 300ms\n").is_none());
        assert!(scanner.push("compiled successfully\n").is_none());
        assert!(!scanner.has_detected());
    }

    #[test]
    fn strip_ansi_handles_osc_and_partial_sequences() {
        assert_eq!(strip_ansi("\x1b]0;title\x07plain"), "plain");
        assert_eq!(strip_ansi("a\x1b[1;32mb\x1b[0mc"), "abc");
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(failure_regex("(unclosed").is_err());
    }
}
