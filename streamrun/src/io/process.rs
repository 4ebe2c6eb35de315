//! Local process spawning with live, chunked output.
//!
//! stdout and stderr are read concurrently and forwarded as text chunks on one
//! channel. The exit code is delivered separately so callers can keep
//! streaming output while awaiting exit, or ignore exit entirely.

use std::process::Stdio;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, warn};

use crate::io::local::LocalSandbox;
use crate::io::sandbox::{ProcessHandle, ProcessHost, TerminalSize};

const READ_CHUNK_BYTES: usize = 8192;

impl ProcessHost for LocalSandbox {
    #[instrument(skip_all, fields(program = program, args = args.len()))]
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        terminal: Option<TerminalSize>,
    ) -> Result<ProcessHandle> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(self.root())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(size) = terminal {
            cmd.env("COLUMNS", size.cols.to_string())
                .env("LINES", size.rows.to_string());
        }

        debug!("spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn {program}"));
            }
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_output(stdout, output_tx.clone()));
        tokio::spawn(forward_output(stderr, output_tx));

        let (exit_tx, exit_rx) = oneshot::channel();
        let pid = child.id();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(err = %e, "failed to wait for child");
                    -1
                }
            };
            debug!(?pid, code, "child exited");
            let _ = exit_tx.send(code);
        });

        let (resize_tx, mut resize_rx) = mpsc::unbounded_channel::<TerminalSize>();
        tokio::spawn(async move {
            while let Some(size) = resize_rx.recv().await {
                debug!(?pid, cols = size.cols, rows = size.rows, "resize ignored for piped process");
            }
        });

        Ok(ProcessHandle {
            input: Box::new(stdin),
            output: output_rx,
            exit: exit_rx,
            resize: resize_tx,
        })
    }
}

async fn forward_output<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut carry = Vec::new();
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(err = %e, "failed to read process output");
                break;
            }
        };
        let text = decode_utf8_chunk(&mut carry, &chunk[..n]);
        if !text.is_empty() && tx.send(text).is_err() {
            break;
        }
    }
    if !carry.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&carry).into_owned());
    }
}

/// Decode `bytes` after any carried prefix, holding back an incomplete
/// trailing UTF-8 sequence for the next read.
pub fn decode_utf8_chunk(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let valid = err.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}
