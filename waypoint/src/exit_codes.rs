//! Stable exit codes for waypoint CLI commands.

/// Command succeeded; for `waypoint build`, every gate passed.
pub const OK: i32 = 0;
/// Command failed: invalid arguments, config or layout, an I/O error, or a
/// build that ended with an execution error.
pub const FAILED: i32 = 1;
/// `waypoint build` exhausted a budget or hit a doom loop.
pub const STUCK: i32 = 2;
