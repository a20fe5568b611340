//! Error types for the chat core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Input rejected before any store or network work happened.
    #[error("validation error: {0}")]
    Validation(String),

    /// Lost a uniqueness race. Absorbed by chat creation, never surfaced from it.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Attachment upload failed; no message was created.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Realtime transport is unavailable.
    #[error("network error: {0}")]
    Network(String),

    /// Caller is not a participant of the chat.
    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The session actor has stopped.
    #[error("chat session closed")]
    SessionClosed,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// True for SQLite unique/constraint failures.
    pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        ChatError::Internal(format!("store task failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
