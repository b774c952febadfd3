//! Error types for replication operations
//!
//! Classifies failures so the task runner can decide between
//! retrying the tail phase and aborting the snapshot scan.

use thiserror::Error;

/// Error categories for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Source database errors (connection, query, cursor)
    Source,
    /// Sink errors (bulk rejection, transport)
    Sink,
    /// Checkpoint persistence errors
    Checkpoint,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Serialization errors (JSON, BSON)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Replication pipeline errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// MongoDB driver error
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Elasticsearch transport error
    #[error("Elasticsearch error: {0}")]
    Elasticsearch(#[from] elasticsearch::Error),

    /// Oplog cursor error (invalidated, fell off the end of the oplog)
    #[error("Oplog error: {0}")]
    Oplog(String),

    /// A change event that cannot be interpreted
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Checkpoint persistence error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Create a new oplog error
    pub fn oplog(msg: impl Into<String>) -> Self {
        Self::Oplog(msg.into())
    }

    /// Create a new malformed event error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEvent(msg.into())
    }

    /// Create a new checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is recoverable by restarting the tail phase.
    ///
    /// Oplog cursor failures and transient transport errors can be
    /// recovered by re-tailing from an earlier timestamp. Configuration
    /// and interpretation errors cannot.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Oplog(_) => true,
            Self::Mongo(_) => true,
            Self::Elasticsearch(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::MalformedEvent(_)
            | Self::Checkpoint(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::Other(_) => false,
        }
    }

    /// Get the error category for logging and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Mongo(_) => ErrorCategory::Source,
            Self::Oplog(_) => ErrorCategory::Source,
            Self::Elasticsearch(_) => ErrorCategory::Sink,
            Self::Checkpoint(_) => ErrorCategory::Checkpoint,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::MalformedEvent(_) => ErrorCategory::Serialization,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Other,
            Self::Other(_) => ErrorCategory::Other,
        }
    }
}

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::oplog("cursor invalidated");
        assert!(err.to_string().contains("Oplog error"));
        assert!(err.to_string().contains("cursor invalidated"));
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(SyncError::oplog("cursor died").is_recoverable());

        assert!(!SyncError::config("bad mapping").is_recoverable());
        assert!(!SyncError::malformed("missing _id").is_recoverable());
        assert!(!SyncError::checkpoint("save failed").is_recoverable());
        assert!(!SyncError::other("unknown").is_recoverable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(SyncError::oplog("x").category(), ErrorCategory::Source);
        assert_eq!(
            SyncError::config("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            SyncError::malformed("x").category(),
            ErrorCategory::Serialization
        );
        assert_eq!(
            SyncError::checkpoint("x").category(),
            ErrorCategory::Checkpoint
        );
        assert_eq!(SyncError::other("x").category(), ErrorCategory::Other);
    }
}
