//! Error types for the transfer pipeline.
//!
//! Request and content-policy errors are reported to the client as an `abort`
//! status and the session continues; disconnects end the session silently and
//! fatal errors close the connection with the failure reason.

use thiserror::Error;

/// Content-policy rejection. The display text is sent to the client verbatim.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("Invalid file format")]
    InvalidFormat,

    #[error("File size exceeded")]
    SizeExceeded,

    #[error("Duplicate file detected")]
    Duplicate,

    #[error("Upload limit exceeded")]
    UploadLimitExceeded,

    #[error("Empty file")]
    EmptyFile,
}

#[derive(Error, Debug)]
pub enum TransferError {
    /// Malformed control frame or unexpected frame kind
    #[error("{0}")]
    Request(String),

    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("connection closed by peer")]
    Disconnected,

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl TransferError {
    pub fn request(msg: impl Into<String>) -> Self {
        TransferError::Request(msg.into())
    }

    /// Errors the session recovers from by aborting the current transfer.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransferError::Request(_) | TransferError::Rejected(_))
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Fatal(e.into())
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_messages_match_wire_text() {
        assert_eq!(Rejection::InvalidFormat.to_string(), "Invalid file format");
        assert_eq!(Rejection::Duplicate.to_string(), "Duplicate file detected");
        let e: TransferError = Rejection::SizeExceeded.into();
        assert_eq!(e.to_string(), "File size exceeded");
        assert!(e.is_recoverable());
        assert!(!TransferError::Disconnected.is_recoverable());
    }
}
