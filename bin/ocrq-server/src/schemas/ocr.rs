use ocrq_core::OcrResult;
use ocrq_core::api::{StatusView, Submitted, TaskSummary};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Multipart body of `POST /ocr`; documentation only, the handler reads the
/// fields one by one.
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct OcrUploadForm {
    /// A single image or PDF file to process.
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
    /// Client-provided identifier echoed back in the webhook.
    pub guid: String,
    /// Optional absolute `http`/`https` URL notified when the task finishes.
    pub webhook_url: Option<String>,
}

/// Returned after successfully queuing a task.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TaskQueueResponse {
    /// Id used for polling `GET /ocr/tasks/{task_id}`.
    pub task_id: String,
    pub guid: String,
    pub filename: String,
    /// Always `"queued"`.
    pub status: String,
}

impl From<Submitted> for TaskQueueResponse {
    fn from(s: Submitted) -> Self {
        Self {
            task_id: s.task_id,
            guid: s.guid,
            filename: s.filename,
            status: s.status,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OcrResultResponse {
    /// Base64 of the recognised UTF-8 text; empty on failure.
    pub text: String,
    /// Between 0 and 1.
    pub confidence: f64,
    /// Empty on success.
    pub error: String,
}

impl From<OcrResult> for OcrResultResponse {
    fn from(r: OcrResult) -> Self {
        Self {
            text: r.text,
            confidence: r.confidence,
            error: r.error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: String,
    /// `QUEUED`, `PROCESSING`, `SUCCESS` or `FAILURE`.
    pub status: String,
    /// Present once the task is terminal.
    pub result: Option<OcrResultResponse>,
}

impl From<StatusView> for TaskStatusResponse {
    fn from(v: StatusView) -> Self {
        Self {
            task_id: v.task_id,
            status: v.status.to_string(),
            result: v.result.map(OcrResultResponse::from),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TaskSummaryResponse {
    pub task_id: String,
    pub guid: String,
    pub filename: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<TaskSummary> for TaskSummaryResponse {
    fn from(t: TaskSummary) -> Self {
        Self {
            task_id: t.task_id,
            guid: t.guid,
            filename: t.filename,
            status: t.status.to_string(),
            created_at: t.created_at.to_rfc3339(),
            updated_at: t.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListTasksQuery {
    /// Only tasks in this status (case-insensitive).
    pub status: Option<String>,
    /// Page size, 1–500 (default 50).
    pub limit: Option<u32>,
}
