use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Upper bound (in bytes) for error messages stored on a task.
pub const MAX_ERROR_LEN: usize = 1024;

/// Lifecycle state of a [`Task`].
///
/// Transitions only move forward: `Queued → Processing → {Success | Failure}`.
/// A queued task may also be failed externally (cancellation) before any
/// worker claims it.  Nothing leaves a terminal state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Processing,
    Success,
    Failure,
}

impl TaskStatus {
    /// Returns `true` for `Success` and `Failure`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Processing)
                | (TaskStatus::Queued, TaskStatus::Failure)
                | (TaskStatus::Processing, TaskStatus::Success)
                | (TaskStatus::Processing, TaskStatus::Failure)
        )
    }
}

/// Terminal outcome of a task.
///
/// `text` is the base64 encoding of the collaborator's UTF-8 text so the
/// value survives any JSON transport as plain ASCII.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f64,
    pub error: String,
}

impl OcrResult {
    pub fn success(text: &str, confidence: f64) -> Self {
        Self {
            text: STANDARD.encode(text.as_bytes()),
            confidence: clamp_confidence(confidence),
            error: String::new(),
        }
    }

    /// Build a failure result; the message is bounded to [`MAX_ERROR_LEN`]
    /// bytes and never empty.
    pub fn failure(error: impl AsRef<str>) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            error: bound_error(error.as_ref()),
        }
    }

    /// Decode `text` back into the bytes the collaborator returned.
    pub fn decoded_text(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.text)
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Trim `message` to at most [`MAX_ERROR_LEN`] bytes on a char boundary.
pub fn bound_error(message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        return "unknown error".to_owned();
    }
    if message.len() <= MAX_ERROR_LEN {
        return message.to_owned();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_owned()
}

/// One unit of OCR work tracked from submission to terminal outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: String,
    /// Client-supplied correlation identifier, opaque to the service.
    pub guid: String,
    /// Upload file name as sent by the client.
    pub filename: String,
    /// Lower-case file extension handed to the OCR engine, e.g. `"pdf"`.
    pub file_type: String,
    pub status: TaskStatus,
    /// Location of the stored upload; cleared once the payload is removed.
    pub payload_ref: Option<String>,
    pub webhook_url: Option<String>,
    /// Present only once `status` is terminal.
    pub result: Option<OcrResult>,
    /// Worker currently holding processing rights, if any.
    pub claimed_by: Option<String>,
    /// Whether the terminal-state notification has been handed to the broker.
    pub webhook_enqueued: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a task is first created.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub guid: String,
    pub filename: String,
    pub file_type: String,
    pub payload_ref: String,
    pub webhook_url: Option<String>,
}

// ── Tests ──────────────────────────────────────────────────────────────────────
