//! Error types for the CoralFS metadata journal
//!
//! This module defines the common error type used throughout the journal
//! subsystem and the tool that inspects it.

use thiserror::Error;

/// Common result type for journal operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the metadata journal
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Object absent from the backing store
    #[error("object not found: {0}")]
    NotFound(String),

    /// Object unexpectedly present
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// The writer lease was revoked by the backend
    #[error("writer fenced: {0}")]
    Fenced(String),

    /// An entry or event could not be decoded
    #[error("corrupt journal entry at offset {pos}: {reason}")]
    CorruptEvent { pos: u64, reason: String },

    /// The operation should be restarted by the caller
    #[error("retry: {0}")]
    Retry(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Backend storage error
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corrupt entry error anchored at a stream offset
    pub fn corrupt(pos: u64, reason: impl Into<String>) -> Self {
        Self::CorruptEvent {
            pos,
            reason: reason.into(),
        }
    }

    /// Create a retry error
    pub fn retry(msg: impl Into<String>) -> Self {
        Self::Retry(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error means the writer lost its lease
    #[must_use]
    pub fn is_fenced(&self) -> bool {
        matches!(self, Self::Fenced(_))
    }

    /// Check if this is a corrupt entry error
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptEvent { .. })
    }

    /// Check if the caller should restart the failed operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(e.to_string())
        } else {
            Self::Io(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::not_found("0x200.head").is_not_found());
        assert!(Error::Fenced("lease revoked".into()).is_fenced());
        assert!(Error::corrupt(4096, "bad sentinel").is_corrupt());
        assert!(Error::retry("journal trimmed underneath us").is_retryable());
        assert!(!Error::storage("short write").is_not_found());
    }

    #[test]
    fn test_io_error_conversion() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::from(missing).is_not_found());

        let refused = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(Error::from(refused), Error::Io(_)));
    }
}
