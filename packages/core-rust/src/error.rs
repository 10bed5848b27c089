//! Error taxonomy shared by every storage driver and the cache layer.

use crate::types::ResourceId;

/// Coarse classification of a [`StoreError`], for callers that map failures
/// onto application-level statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Read/update/delete target id absent.
    NotFound,
    /// Duplicate id on create, or a stale revision token.
    Conflict,
    /// Missing or malformed driver parameters, unusable location.
    InvalidConfiguration,
    /// I/O, network, or query execution failure.
    MediumFailure,
    /// Record shape cannot be reconciled with the store's schema.
    SchemaViolation,
}

impl ErrorKind {
    /// HTTP status a consuming service would answer with for this kind.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::SchemaViolation => 422,
            ErrorKind::InvalidConfiguration => 500,
            ErrorKind::MediumFailure => 502,
        }
    }
}

/// Errors raised by storage drivers and the cache layer.
///
/// Raised synchronously at the point of failure and never retried internally.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {id} not found")]
    NotFound { id: ResourceId },
    #[error("conflict on record {id}: {reason}")]
    Conflict { id: ResourceId, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("{context}")]
    MediumFailure {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("schema violation: {0}")]
    SchemaViolation(String),
}

impl StoreError {
    /// Wraps an underlying medium error with a short description of what was attempted.
    pub fn medium(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        StoreError::MediumFailure {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Builds a [`StoreError::Conflict`].
    pub fn conflict(id: &ResourceId, reason: impl Into<String>) -> Self {
        StoreError::Conflict {
            id: id.clone(),
            reason: reason.into(),
        }
    }

    /// Builds a [`StoreError::NotFound`].
    #[must_use]
    pub fn not_found(id: &ResourceId) -> Self {
        StoreError::NotFound { id: id.clone() }
    }

    /// Classifies this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            StoreError::MediumFailure { .. } => ErrorKind::MediumFailure,
            StoreError::SchemaViolation(_) => ErrorKind::SchemaViolation,
        }
    }
}

/// Result alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(StoreError::not_found(&ResourceId::Int(1)).kind().http_status(), 404);
        assert_eq!(
            StoreError::conflict(&ResourceId::Int(1), "stale").kind().http_status(),
            409
        );
        assert_eq!(
            StoreError::SchemaViolation("x".into()).kind(),
            ErrorKind::SchemaViolation
        );
    }

    #[test]
    fn medium_failure_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StoreError::medium("writing /tmp/x.json", io);
        assert_eq!(err.kind(), ErrorKind::MediumFailure);
        assert_eq!(err.to_string(), "writing /tmp/x.json");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "denied");
    }
}
