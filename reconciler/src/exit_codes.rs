//! Stable exit codes for reconciler CLI commands.

/// Command succeeded; every institution and queue item reached its goal.
pub const OK: i32 = 0;
/// The run could not start or was aborted (configuration, input file, session).
pub const INVALID: i32 = 1;
/// The run completed but some institutions or queue items failed.
pub const PARTIAL_FAILURE: i32 = 2;
