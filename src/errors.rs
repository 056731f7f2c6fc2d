//! Typed errors that carry a process exit code.

use thiserror::Error;

/// Fatal error surfaced to the user together with the exit code the
/// process should terminate with.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ForemonError {
    pub message: String,
    pub code: i32,
}

impl ForemonError {
    pub fn new(message: impl Into<String>, code: i32) -> Self {
        ForemonError {
            message: message.into(),
            code,
        }
    }

    /// Configuration parse or validation failure.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(message, 1)
    }

    /// A path given to the monitor does not exist.
    pub fn path_missing(message: impl Into<String>) -> Self {
        Self::new(message, libc::ENOENT)
    }

    /// A task alias was used more than once.
    pub fn duplicate_task(message: impl Into<String>) -> Self {
        Self::new(message, libc::EINVAL)
    }
}
