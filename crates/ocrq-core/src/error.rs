use std::time::Duration;

use thiserror::Error;

use crate::types::TaskStatus;

/// Errors raised by the task store, the broker and the payload store.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Propagated from the SQLite (or other) store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Embedded migrations failed to apply on connect.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A filesystem I/O error occurred while handling a payload.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize a queue message.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The referenced task does not exist.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// A status change was requested that the task's current state forbids.
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A stored row could not be mapped back to a domain value.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Failures reported by (or on behalf of) the OCR collaborator.
///
/// Every variant ends the task in `FAILURE`; OCR itself is never retried.
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    /// The file could not be interpreted (corrupt, empty, wrong content).
    #[error("unsupported content: {0}")]
    UnsupportedContent(String),

    /// The engine ran and reported an error.
    #[error("ocr engine failed: {0}")]
    Engine(String),

    /// The engine exceeded the processing timeout.
    #[error("ocr timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}
