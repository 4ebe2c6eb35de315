//! The session's persistent interactive shell.
//!
//! Started once per session and injected into the command executor.
//! Foreground commands are written to its stdin; nothing waits for them.

use anyhow::{Context, Result, anyhow};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, instrument, warn};

use crate::events::{EventBus, OutputSource, PipelineEvent};
use crate::io::config::ShellConfig;
use crate::io::sandbox::{ProcessHost, ProcessInput, TerminalSize};

pub struct ShellSession {
    input: Mutex<ProcessInput>,
    resize: mpsc::UnboundedSender<TerminalSize>,
}

impl ShellSession {
    /// Spawn the shell and start forwarding its output to `events`.
    #[instrument(skip_all, fields(program = %config.program))]
    pub async fn start<H: ProcessHost>(
        host: &H,
        config: &ShellConfig,
        events: EventBus,
    ) -> Result<Self> {
        let handle = host
            .spawn(&config.program, &config.args, Some(config.terminal_size()))
            .await
            .context("start interactive shell")?;
        info!("interactive shell started");

        let mut output = handle.output;
        let output_events = events.clone();
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                output_events.publish(PipelineEvent::Output {
                    source: OutputSource::Shell,
                    chunk,
                });
            }
        });

        let exit = handle.exit;
        tokio::spawn(async move {
            if let Ok(code) = exit.await {
                warn!(code, "interactive shell exited");
                events.publish(PipelineEvent::ShellExited { code });
            }
        });

        Ok(Self {
            input: Mutex::new(handle.input),
            resize: handle.resize,
        })
    }

    /// Write `command` and a line terminator to the shell.
    pub async fn run(&self, command: &str) -> Result<()> {
        let mut input = self.input.lock().await;
        input
            .write_all(format!("{command}\n").as_bytes())
            .await
            .context("write to interactive shell")?;
        input.flush().await.context("flush interactive shell")
    }

    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        self.resize
            .send(size)
            .map_err(|_| anyhow!("interactive shell is gone"))
    }
}
