//! Errors raised by sandbox runners.

use thiserror::Error;

/// Failure of a `run` or `reset` call on one of the runner backends.
///
/// Nothing in this crate retries on these; a caller resubmits.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The backend's control plane could not be reached.
    #[error("cannot reach {backend}: {message}")]
    Connectivity {
        backend: &'static str,
        message: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The command itself failed or exited non-zero.
    #[error("execution failed: {0}")]
    Execution(String),

    /// A watch subscription ended without the expected transition.
    #[error("{0}")]
    WaitStream(String),

    #[error("{operation} is not supported by the {backend} runner")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded while {0}")]
    DeadlineExceeded(String),

    /// Any other answer from the control plane.
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, SandboxError::AlreadyExists(_))
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
