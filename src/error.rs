use thiserror::Error;

use crate::models::QueueStatus;

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("cannot move queue entry from {from} to {to}")]
    InvalidTransition { from: QueueStatus, to: QueueStatus },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

/// A text value that does not name any variant of a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl From<ParseEnumError> for QueueError {
    fn from(err: ParseEnumError) -> Self {
        QueueError::Validation(err.to_string())
    }
}
