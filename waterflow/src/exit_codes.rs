//! Stable exit codes for waterflow CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, unreadable state, or other errors.
pub const INVALID: i32 = 1;
/// `waterflow status` found that the loop has not completed recently.
pub const STALLED: i32 = 3;
