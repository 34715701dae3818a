//! Error types for fairdraw-core.

use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing input, rejected before any ledger write.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The external reference is already registered for the competition.
    #[error("entry {external_ref} already exists in competition {competition}")]
    DuplicateEntry {
        competition: String,
        external_ref: String,
    },

    /// The competition no longer accepts entries.
    #[error("competition {0} is closed")]
    CompetitionClosed(String),

    /// The entry already carries a void marker.
    #[error("entry {0} is already voided")]
    AlreadyVoided(String),

    /// The request conflicts with recorded history (e.g. a prize already drawn).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Lookup failed.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The chain head no longer matches the last stored event.
    #[error("ledger for operator {operator} is desynchronized: {detail}")]
    ChainDesynchronized { operator: String, detail: String },

    /// The entropy source failed.
    #[error("seed unavailable: {0}")]
    SeedUnavailable(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the caller may retry the same request unchanged.
    ///
    /// Only entropy failures qualify. A desynchronized chain must be repaired
    /// before anything else is appended.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SeedUnavailable(_))
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
