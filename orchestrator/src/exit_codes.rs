//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded: workflow completed, every agent succeeded, or no blocking conflicts.
pub const OK: i32 = 0;
/// Invalid input: unreadable or malformed config, workflow or agent documents.
pub const INVALID: i32 = 1;
/// A workflow execution failed, an agent failed, or agents have file conflicts.
pub const FAILED: i32 = 2;
/// A workflow execution was cancelled.
pub const CANCELLED: i32 = 3;
