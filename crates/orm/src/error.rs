//! Error types for the ORM runtime
//!
//! Every failure surfaces to the awaiting caller. Errors are `Clone` so that a
//! single adapter failure can be handed to every caller waiting on a batch.

use std::sync::Arc;

use crate::identity::TaggedId;

/// Result type alias for runtime operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for ORM runtime operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrmError {
    /// An entity with the same identifier is already part of the unit of work
    #[error("Entity {id} is already registered in this unit of work")]
    DuplicateRegistration { id: TaggedId },

    /// Single-entity load with no matching row
    #[error("{entity} with id '{id}' not found")]
    NotFound { entity: String, id: String },

    /// Criteria shape that cannot be compiled
    #[error("Unsupported criteria: {0}")]
    UnsupportedCriteria(String),

    /// The batched query behind a loader failed; shared by every pending caller
    #[error("Batch '{batch}' failed: {source}")]
    BatchExecution {
        batch: String,
        #[source]
        source: Arc<OrmError>,
    },

    /// Database query error reported by the execution adapter
    #[error("Database error: {0}")]
    Database(String),

    /// Connection pool error
    #[error("Connection error: {0}")]
    Connection(String),

    /// A row could not be turned into an entity
    #[error("Hydration error: {0}")]
    Hydration(String),

    /// No metadata registered for the entity
    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    /// Field or relation missing from the entity metadata
    #[error("Unknown field '{field}' on {entity}")]
    UnknownField { entity: String, field: String },

    /// Malformed or mismatched identifier
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// Inconsistent metadata definitions
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OrmError {
    /// Wrap an adapter failure so it can be fanned out to a whole batch
    pub fn batch(batch: impl Into<String>, source: OrmError) -> Self {
        OrmError::BatchExecution {
            batch: batch.into(),
            source: Arc::new(source),
        }
    }

    /// True for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrmError::NotFound { .. })
    }
}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        OrmError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::UnsupportedCriteria(err.to_string())
    }
}

/// Configuration error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {field}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Validation failed for {field}: {reason}")]
    ValidationFailed { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_error_keeps_source() {
        let err = OrmError::batch("authors.books", OrmError::Database("boom".into()));
        match &err {
            OrmError::BatchExecution { batch, source } => {
                assert_eq!(batch, "authors.books");
                assert!(matches!(**source, OrmError::Database(_)));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.to_string(), "Batch 'authors.books' failed: Database error: boom");
    }

    #[test]
    fn test_config_error_display() {
        let err: OrmError = ConfigError::InvalidValue {
            field: "max_batch_size".into(),
            value: "zero".into(),
            expected: "a positive integer".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Invalid value for max_batch_size: 'zero', expected a positive integer"
        );
    }
}
