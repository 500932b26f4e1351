//! Stable exit codes for triad CLI commands.

/// Command succeeded; for `run`/`resume` the run completed.
pub const OK: i32 = 0;
/// Invalid config, arguments or run record, or any other setup failure.
pub const INVALID: i32 = 1;
/// The run ended with `status = error` or is unreachable.
pub const RUN_ERROR: i32 = 2;
/// The run stopped resumably: awaiting plan approval, needs clarification or
/// cancelled.
pub const PAUSED: i32 = 3;
