//! Deterministic, pure logic shared by the stream runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod attrs;
pub mod decoder;
pub mod file_tree;
pub mod identity;
pub mod node;
pub mod readiness;
pub mod registry;
pub mod scanner;
pub mod status;
