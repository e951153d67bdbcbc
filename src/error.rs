//! Library error types.

use thiserror::Error;

use crate::models::EntityKind;

/// Errors from local store operations.
///
/// Remote-sync failures never surface here: `save`/`update`/`delete`
/// succeed locally regardless of connectivity, and cycle errors are
/// reported through counts and the dead-letter list instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} records require a '{field}' field")]
    MissingKeyField {
        kind: EntityKind,
        field: &'static str,
    },

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}
