//! Stable exit codes for streamrun CLI commands.

/// Command succeeded; every dispatched instruction completed.
pub const OK: i32 = 0;
/// Invalid arguments, config, transcript or sandbox root, or other I/O errors.
pub const INVALID: i32 = 1;
/// `streamrun run` aborted a batch on an executor error.
pub const EXECUTION_FAILED: i32 = 2;
