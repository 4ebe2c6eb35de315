//! Incremental stream decoder and ordered instruction runner.
//!
//! A model streams text containing `<file>` and `<terminal>` tags. This crate
//! decodes the growing buffer while it arrives and executes each completed
//! instruction, in stream order and one at a time, against a sandbox. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (decoding, readiness, identity,
//!   status ledger, output scanning). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (sandbox filesystem, processes,
//!   interactive shell, journal, config). Isolated behind traits so tests can
//!   substitute in-memory fakes.
//!
//! [`pipeline`] and [`session`] coordinate core logic with I/O; [`replay`]
//! implements the CLI commands on top of them.

pub mod core;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod replay;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
