//! Stream runner CLI.
//!
//! Replays a recorded model transcript through the incremental decoder and,
//! for `run`, executes the decoded instructions against a local sandbox
//! directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use streamrun::exit_codes;
use streamrun::io::config::{DEFAULT_CONFIG_PATH, StreamConfig, write_config};
use streamrun::replay::{DEFAULT_TURN_ID, RunOptions, RunOutcome, parse_transcript, run_transcript};

#[derive(Parser)]
#[command(
    name = "streamrun",
    version,
    about = "Decode streamed file/terminal tags and execute them in order"
)]
struct Cli {
    /// Raise runner diagnostics on stderr (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.streamrun/config.toml` with defaults.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Decode a transcript and print the node list as JSON.
    Parse {
        transcript: PathBuf,
        /// Feed the decoder this many characters at a time (0 = all at once).
        #[arg(long, default_value_t = 0)]
        chunk_size: usize,
        #[arg(long, default_value = DEFAULT_TURN_ID)]
        turn: String,
    },
    /// Replay a transcript and execute its instructions in a sandbox root.
    Run {
        transcript: PathBuf,
        /// Sandbox root directory.
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long, default_value_t = 0)]
        chunk_size: usize,
        #[arg(long, default_value = DEFAULT_TURN_ID)]
        turn: String,
        /// Config file (default: `<root>/.streamrun/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Keep watching background output this long before exiting.
        #[arg(long, default_value_t = 0)]
        settle_ms: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = streamrun::logging::init(cli.verbose) {
        eprintln!("{:#}", err);
        process::exit(exit_codes::INVALID);
    }
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Parse {
            transcript,
            chunk_size,
            turn,
        } => cmd_parse(&transcript, chunk_size, &turn),
        Command::Run {
            transcript,
            root,
            chunk_size,
            turn,
            config,
            settle_ms,
        } => {
            let options = RunOptions {
                root,
                config_path: config,
                turn_id: turn,
                chunk_chars: chunk_size,
                settle: Duration::from_millis(settle_ms),
            };
            cmd_run(&transcript, &options)
        }
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let path = Path::new(DEFAULT_CONFIG_PATH);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &StreamConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_parse(transcript: &Path, chunk_size: usize, turn: &str) -> Result<i32> {
    let text = read_transcript(transcript)?;
    let nodes = parse_transcript(&text, turn, chunk_size);
    let payload = serde_json::to_string_pretty(&nodes).context("serialize nodes")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

fn cmd_run(transcript: &Path, options: &RunOptions) -> Result<i32> {
    let text = read_transcript(transcript)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let outcome = runtime.block_on(run_transcript(&text, options))?;
    // Background processes may outlive the replay; don't wait for them.
    runtime.shutdown_background();

    match outcome {
        RunOutcome::Completed { executed } => {
            println!("done: {} instruction(s) executed", executed.len());
            Ok(exit_codes::OK)
        }
        RunOutcome::Failed {
            failed,
            message,
            discarded,
            ..
        } => {
            eprintln!("execution failed at {failed}: {message}");
            if !discarded.is_empty() {
                eprintln!("discarded {} queued instruction(s)", discarded.len());
            }
            Ok(exit_codes::EXECUTION_FAILED)
        }
    }
}

fn read_transcript(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read transcript {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["streamrun", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["streamrun", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["streamrun", "run", "t.txt"]);
        match cli.command {
            Command::Run {
                root,
                chunk_size,
                turn,
                config,
                settle_ms,
                ..
            } => {
                assert_eq!(root, PathBuf::from("."));
                assert_eq!(chunk_size, 0);
                assert_eq!(turn, DEFAULT_TURN_ID);
                assert!(config.is_none());
                assert_eq!(settle_ms, 0);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn verbose_counts_after_subcommand() {
        let cli = Cli::parse_from(["streamrun", "parse", "t.txt", "-vv"]);
        assert_eq!(cli.verbose, 2);
        let cli = Cli::parse_from(["streamrun", "init"]);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parse_parse_with_chunk_size() {
        let cli = Cli::parse_from(["streamrun", "parse", "t.txt", "--chunk-size", "5"]);
        assert!(matches!(cli.command, Command::Parse { chunk_size: 5, .. }));
    }
}
