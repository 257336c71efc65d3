//! Stable exit codes for conductor CLI commands.

/// Command succeeded: the input is valid or the workflow completed.
pub const OK: i32 = 0;
/// Invalid input, config or workflow definition, or any other error.
pub const INVALID: i32 = 1;
/// `conductor run` ended with the workflow aborted.
pub const ABORTED: i32 = 2;
