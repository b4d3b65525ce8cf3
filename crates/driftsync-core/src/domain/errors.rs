//! Error kinds surfaced by the orchestration core
//!
//! Validation and cycle errors are rejected locally and never retried.
//! Filesystem errors carry a transient flag that drives the retry policy.
//! Decryption failures are reported uniformly so callers cannot distinguish
//! a wrong password from corrupted ciphertext.

use thiserror::Error;

/// Errors produced by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed profile, invalid remote name, bad size/age expression.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown task id, absent remote key, missing profile or board.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O or backend protocol failure from the filesystem abstraction.
    #[error("filesystem error: {message}")]
    Filesystem {
        message: String,
        /// Transient failures are eligible for retry per profile policy.
        transient: bool,
    },

    /// Wrong password, active lockout, or vault not unlocked.
    #[error("auth error: {0}")]
    Auth(String),

    /// Ciphertext tamper or key mismatch.
    #[error("decryption failed (wrong password or corrupted data)")]
    Decryption,

    /// Cooperative cancellation was requested and observed.
    #[error("operation cancelled")]
    Cancelled,

    /// The directed graph formed by a board's edges contains a cycle.
    #[error("board contains a cycle involving edges: {edges:?}")]
    Cycle { edges: Vec<String> },

    /// Invariant violation inside the core itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Builds a transient filesystem error (eligible for retry).
    pub fn fs_transient(message: impl Into<String>) -> Self {
        CoreError::Filesystem {
            message: message.into(),
            transient: true,
        }
    }

    /// Builds a permanent filesystem error.
    pub fn fs_permanent(message: impl Into<String>) -> Self {
        CoreError::Filesystem {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if the retry loop may attempt the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Filesystem {
                transient: true,
                ..
            }
        )
    }

    /// Stable machine-readable code used in `error:occurred` events.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Filesystem { .. } => "FILESYSTEM",
            CoreError::Auth(_) => "AUTH",
            CoreError::Decryption => "DECRYPTION",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Cycle { .. } => "CYCLE",
            CoreError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let transient = matches!(
            err.kind(),
            ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::WouldBlock
        );
        CoreError::Filesystem {
            message: err.to_string(),
            transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CoreError::fs_transient("connection reset").is_transient());
        assert!(!CoreError::fs_permanent("no such remote").is_transient());
        assert!(!CoreError::Validation("bad".into()).is_transient());
        assert!(!CoreError::Cancelled.is_transient());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::Decryption.code(), "DECRYPTION");
        assert_eq!(
            CoreError::Cycle {
                edges: vec!["e1".into()]
            }
            .code(),
            "CYCLE"
        );
        assert_eq!(CoreError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn test_decryption_message_has_no_oracle() {
        let msg = CoreError::Decryption.to_string();
        assert!(msg.contains("wrong password or corrupted data"));
        assert!(!msg.contains("tag"));
        assert!(!msg.contains("nonce"));
    }

    #[test]
    fn test_io_error_transient_mapping() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert!(CoreError::from(timeout).is_transient());

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!CoreError::from(missing).is_transient());
    }
}
