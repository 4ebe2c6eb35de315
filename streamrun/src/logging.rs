//! Diagnostics for the stream runner, on stderr.
//!
//! Tracing is separate from product output: the status line, pipeline events
//! and the journal are always produced and never depend on the filter set
//! here.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset and no `-v` was given.
pub const DEFAULT_FILTER: &str = "warn";

/// Directive for the runner's own targets at a `-v` count.
fn crate_directive(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("streamrun=info"),
        2 => Some("streamrun=debug"),
        _ => Some("streamrun=trace"),
    }
}

/// Filter directives: `RUST_LOG` (or [`DEFAULT_FILTER`]) plus the crate
/// directive for `verbose`. The crate directive comes last so it wins.
pub fn filter_directives(rust_log: Option<&str>, verbose: u8) -> String {
    let base = rust_log
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_FILTER);
    match crate_directive(verbose) {
        Some(directive) => format!("{base},{directive}"),
        None => base.to_string(),
    }
}

/// Install the stderr subscriber. Fails on a malformed filter or when a
/// subscriber is already installed.
///
/// ```bash
/// RUST_LOG=streamrun::pipeline=debug streamrun run transcript.txt --root sandbox
/// streamrun -vv parse transcript.txt
/// ```
pub fn init(verbose: u8) -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directives = filter_directives(rust_log.as_deref(), verbose);
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter {directives:?}"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .context("install tracing subscriber")
}
