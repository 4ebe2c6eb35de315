//! Session configuration stored under `.streamrun/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::scanner::{DEFAULT_FAILURE_PATTERN, failure_regex};
use crate::io::sandbox::TerminalSize;

pub const DEFAULT_CONFIG_PATH: &str = ".streamrun/config.toml";

/// Stream runner configuration (TOML).
///
/// Missing fields default to values that work with a POSIX `sh`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StreamConfig {
    pub shell: ShellConfig,
    pub scanner: ScannerConfig,
    pub journal: JournalConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    /// Program started once per session for foreground commands.
    pub program: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

impl ShellConfig {
    pub fn terminal_size(&self) -> TerminalSize {
        TerminalSize {
            cols: self.cols,
            rows: self.rows,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerConfig {
    /// Regex tested case-insensitively against each cleaned output line.
    pub failure_pattern: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            failure_pattern: DEFAULT_FAILURE_PATTERN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct JournalConfig {
    /// JSONL file mirroring successful file operations. Unset disables it.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast buffer per subscriber; slow subscribers lose older events.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shell.program.trim().is_empty() {
            return Err(anyhow!("shell.program must be non-empty"));
        }
        if self.shell.cols == 0 || self.shell.rows == 0 {
            return Err(anyhow!("shell.cols and shell.rows must be > 0"));
        }
        failure_regex(&self.scanner.failure_pattern).context("scanner.failure_pattern")?;
        if self.events.capacity == 0 {
            return Err(anyhow!("events.capacity must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StreamConfig::default()`.
pub fn load_config(path: &Path) -> Result<StreamConfig> {
    if !path.exists() {
        let cfg = StreamConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: StreamConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StreamConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, StreamConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".streamrun").join("config.toml");
        let mut cfg = StreamConfig::default();
        cfg.journal.path = Some(PathBuf::from("journal.jsonl"));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[shell]\nprogram = \"bash\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.shell.program, "bash");
        assert_eq!(cfg.shell.cols, 80);
        assert_eq!(cfg.scanner.failure_pattern, DEFAULT_FAILURE_PATTERN);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut cfg = StreamConfig::default();
        cfg.scanner.failure_pattern = "(".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("scanner.failure_pattern"));
    }

    #[test]
    fn zero_terminal_size_is_rejected() {
        let mut cfg = StreamConfig::default();
        cfg.shell.rows = 0;
        assert!(cfg.validate().is_err());
    }
}
