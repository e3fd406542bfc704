//! Error types for the synchronization engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while propagating change rows to a sink.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The storage backend failed to return metadata for an object.
    #[error("failed to fetch metadata for {object}: {message}")]
    MetadataFetch {
        /// Object path (`account/container/object`).
        object: String,
        /// Error reported by the metadata collaborator.
        message: String,
    },

    /// The destination schema has several field groupings and the engine
    /// cannot tell which one to extend.
    #[error("Cannot set more than one mapping type for index {index}. Known types: {groupings:?}")]
    SchemaAmbiguity {
        /// Destination index.
        index: String,
        /// Groupings found in the destination schema.
        groupings: Vec<String>,
    },

    /// Some rows of a batch were rejected by the sink.
    #[error("{failed} of {total} rows in the batch were rejected by the sink")]
    BatchPartialFailure {
        /// Number of rejected rows.
        failed: usize,
        /// Number of rows submitted.
        total: usize,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The sink client failed as a whole (bulk request, schema calls, producer).
    #[error("sink error: {message}")]
    Sink {
        /// Error message.
        message: String,
    },

    /// Object metadata could not be translated into a document.
    #[error("invalid metadata field {field}: {message}")]
    InvalidMetadata {
        /// Offending field (or `name` for the object name).
        field: String,
        /// Error message.
        message: String,
    },

    /// A version token could not be decoded.
    #[error("invalid version token: {0}")]
    InvalidVersionToken(String),

    /// Checkpoint file I/O failed.
    #[error("checkpoint I/O error: {0}")]
    Checkpoint(#[from] std::io::Error),

    /// Checkpoint record could not be encoded.
    #[error("checkpoint encoding error: {0}")]
    CheckpointFormat(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a sink error.
    pub fn sink(message: impl Into<String>) -> Self {
        Self::Sink {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a metadata translation error.
    pub fn invalid_metadata(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if the owning worker must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::SchemaAmbiguity { .. } | SyncError::Configuration(_)
        )
    }

    /// Returns true if re-running the same batch later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::MetadataFetch { .. }
                | SyncError::Sink { .. }
                | SyncError::BatchPartialFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_and_retryable_errors() {
        let ambiguity = SyncError::SchemaAmbiguity {
            index: "idx".into(),
            groupings: vec!["a".into(), "b".into()],
        };
        assert!(ambiguity.is_fatal());
        assert!(!ambiguity.is_retryable());

        assert!(SyncError::configuration("missing index").is_fatal());
        assert!(SyncError::sink("connection reset").is_retryable());
        assert!(SyncError::BatchPartialFailure { failed: 1, total: 2 }.is_retryable());
        assert!(!SyncError::invalid_metadata("name", "bad utf-8").is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::SchemaAmbiguity {
            index: "test_index".into(),
            groupings: vec!["bogus_type".into()],
        };
        assert_eq!(
            err.to_string(),
            "Cannot set more than one mapping type for index test_index. Known types: [\"bogus_type\"]"
        );

        let err = SyncError::BatchPartialFailure { failed: 3, total: 10 };
        assert!(err.to_string().contains("3 of 10"));
    }
}
