//! Error types for tessera operations.
//!
//! Absence is never an error: a missing or unauthorized envelope is an empty
//! result, so `NotFound`/`Unauthorized` have no variants here. Errors cover
//! configuration bugs, backend failures, and federation transport failures.

use thiserror::Error;

/// Result type alias for tessera operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

/// Main error type for all tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage backend operation failed.
    #[error("Store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A bulk write stopped part way through. The counts let callers report
    /// exactly which prefix was persisted.
    #[error("Bulk write failed after {created} of {total} envelopes: {message}")]
    BulkWrite {
        created: usize,
        total: usize,
        message: String,
    },

    /// A query template failed to compile or render. Always a configuration
    /// bug, never swallowed.
    #[error("Malformed template: {0}")]
    MalformedTemplate(String),

    /// A federated call to a sibling service failed.
    #[error("Federation error: {message}")]
    Federation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Storage provider not compiled in or unknown.
    #[error("Provider not supported: {provider}")]
    UnsupportedProvider { provider: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error wrapping a driver error.
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a federation error.
    pub fn federation(message: impl Into<String>) -> Self {
        Self::Federation {
            message: message.into(),
            source: None,
        }
    }

    /// Create a federation error wrapping a transport error.
    pub fn federation_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Federation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a malformed template error.
    pub fn template(message: impl Into<String>) -> Self {
        Self::MalformedTemplate(message.into())
    }

    /// True when the error came from the storage backend rather than the
    /// caller. Reads degrade to empty on these; writes propagate them.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_is_backend() {
        let err = TesseraError::store("connection refused");
        assert!(err.is_backend());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn template_error_is_not_backend() {
        let err = TesseraError::template("unresolved placeholder: id");
        assert!(!err.is_backend());
    }

    #[test]
    fn bulk_write_reports_counts() {
        let err = TesseraError::BulkWrite {
            created: 2,
            total: 5,
            message: "duplicate key".into(),
        };
        assert!(err.to_string().contains("2 of 5"));
    }
}
