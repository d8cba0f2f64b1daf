//! Error types for transfer operations.

use thiserror::Error;
use tos_transfer_common::ABORT_STATUS_CODES;

/// Errors that can occur while driving a transfer.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// Invalid caller input; raised immediately, never retried.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Checkpoint file exists but does not parse as a checkpoint document.
    #[error("Corrupt checkpoint at {path}: {message}")]
    CorruptCheckpoint { path: String, message: String },

    /// The combined part CRC does not match the server-declared object CRC.
    #[error("CRC64 mismatch: server declared {expected}, computed {actual}")]
    CrcMismatch { expected: String, actual: String },

    /// A request against the object store failed.
    #[error("Request error: {message}")]
    Request {
        /// HTTP status, when the failure carries one.
        status_code: Option<u16>,
        message: String,
        retryable: bool,
    },

    /// Operation cancelled through the caller's token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Local filesystem error.
    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },
}

impl TransferError {
    /// Create an `InvalidInput` error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an `Io` error from a std I/O error.
    pub fn io(path: impl Into<String>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Check if this error is retryable on a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Request { retryable, .. } => *retryable && !self.is_abort(),
            TransferError::InvalidInput { .. } => false,
            TransferError::CorruptCheckpoint { .. } => false,
            TransferError::CrcMismatch { .. } => false,
            TransferError::Cancelled => false,
            TransferError::Io { .. } => false,
        }
    }

    /// Check if this is a part request the server rejected outright
    /// (403/404/405); such parts are abandoned rather than retried.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            TransferError::Request {
                status_code: Some(status),
                ..
            } if ABORT_STATUS_CODES.contains(status)
        )
    }

    /// Check if this is the distinguished cancellation error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(status: Option<u16>, retryable: bool) -> TransferError {
        TransferError::Request {
            status_code: status,
            message: "boom".into(),
            retryable,
        }
    }

    #[test]
    fn test_abort_statuses() {
        assert!(request(Some(403), true).is_abort());
        assert!(request(Some(404), false).is_abort());
        assert!(request(Some(405), true).is_abort());
        assert!(!request(Some(500), true).is_abort());
        assert!(!request(None, true).is_abort());
    }

    #[test]
    fn test_abort_is_not_retryable() {
        assert!(request(Some(503), true).is_retryable());
        assert!(!request(Some(404), true).is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
        assert!(!TransferError::invalid_input("bad").is_retryable());
    }

    #[test]
    fn test_cancelled_predicate() {
        assert!(TransferError::Cancelled.is_cancelled());
        assert!(!request(None, true).is_cancelled());
    }
}
