//! Stable exit codes for `ralph` CLI commands.

/// Command succeeded, or `run` reached `Complete`.
pub const OK: i32 = 0;
/// Fatal error: invalid config or layout, missing agent binary, auth failure.
pub const FATAL: i32 = 1;
/// `run` stopped at the iteration or time limit with work remaining.
pub const INCOMPLETE: i32 = 2;
/// `run` was interrupted; a checkpoint was written.
pub const CANCELLED: i32 = 3;
