//! Stable exit codes for engine CLI commands.

/// Command succeeded, the goal was achieved, or there was nothing to do.
pub const OK: i32 = 0;
/// Invalid input or settings, or the goal could not be decomposed.
pub const INVALID: i32 = 1;
/// `engine run` finished with at least one failed task.
pub const FAILED: i32 = 2;
/// `engine check` rejected the command.
pub const REJECTED: i32 = 3;
