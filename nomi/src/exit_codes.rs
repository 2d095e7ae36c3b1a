//! Stable exit codes for the `nomi` binary.

/// Session ended normally, or was cancelled by a signal.
pub const OK: i32 = 0;
/// Startup failed (config, unsupported OS, model server) or the session hit a fatal error.
pub const FAILURE: i32 = 1;
