//! Side-effecting adapters: sandbox, processes, shell, journal, config.

pub mod config;
pub mod executor;
pub mod journal;
pub mod local;
pub mod process;
pub mod sandbox;
pub mod shell;
