//! Error types for the OCR pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// OCR pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied a null/empty/malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not legal in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Component was used after disposal
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// Operation was cancelled through its token
    #[error("Operation was cancelled")]
    Cancelled,

    /// Polling or remote call exceeded its time/attempt budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Every retry attempt failed
    #[error("Operation failed after {} attempts", .attempts.len())]
    RetryExhausted { attempts: Vec<Error> },

    /// Transport-level failure talking to a remote service
    #[error("Transport error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Transport { status: Option<u16>, message: String },

    /// Service-level failure, optionally wrapping the underlying cause
    #[error("Service error: {message}")]
    Service {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// A document processor failed while handling a document
    #[error("Processor '{document_type}' failed")]
    ProcessorFailed {
        document_type: String,
        #[source]
        source: Box<Error>,
    },

    /// Backing store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Create a transport error
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    /// Create a service error without an inner cause
    pub fn service(message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
            source: None,
        }
    }

    /// Create a service error wrapping an inner cause
    pub fn service_with_source(message: impl Into<String>, source: Error) -> Self {
        Self::Service {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True when this error represents cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Display of this error followed by each underlying cause
    pub fn chain_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

/// Reject null/empty/whitespace identifiers
pub(crate) fn ensure_id(id: &str, what: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::invalid_argument(format!(
            "{} cannot be null, empty or whitespace",
            what
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_processor_failure_keeps_cause() {
        let err = Error::ProcessorFailed {
            document_type: "receipt".to_string(),
            source: Box::new(Error::transport(Some(503), "service unavailable")),
        };

        let cause = err.source().expect("cause should be reachable");
        assert!(cause.to_string().contains("503"));
        assert_eq!(err.to_string(), "Processor 'receipt' failed");
        assert_eq!(
            err.chain_message(),
            "Processor 'receipt' failed: Transport error (503): service unavailable"
        );
    }

    #[test]
    fn test_retry_exhausted_message_counts_attempts() {
        let err = Error::RetryExhausted {
            attempts: vec![Error::timeout("a"), Error::timeout("b")],
        };
        assert_eq!(err.to_string(), "Operation failed after 2 attempts");
    }

    #[test]
    fn test_ensure_id() {
        assert!(ensure_id("abc", "Job id").is_ok());
        assert!(matches!(ensure_id("   ", "Job id"), Err(Error::InvalidArgument(_))));
        assert!(matches!(ensure_id("", "Job id"), Err(Error::InvalidArgument(_))));
    }
}
