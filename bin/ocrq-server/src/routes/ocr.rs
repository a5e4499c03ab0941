//! OCR submission and task status routes.
//!
//! `POST /ocr` stores the upload and queues a task without waiting for OCR;
//! clients poll `GET /ocr/tasks/{task_id}` or wait for their webhook.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use bytes::Bytes;
use ocrq_core::TaskStatus;
use ocrq_core::api::Upload;
use tracing::debug;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::middleware::CorrelationId;
use crate::schemas::ocr::{
    ListTasksQuery, OcrResultResponse, OcrUploadForm, TaskQueueResponse, TaskStatusResponse,
    TaskSummaryResponse,
};
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;

#[derive(OpenApi)]
#[openapi(
    paths(create_ocr_task, get_task_status, list_tasks, cancel_task),
    components(schemas(
        OcrUploadForm,
        TaskQueueResponse,
        TaskStatusResponse,
        OcrResultResponse,
        TaskSummaryResponse,
        ListTasksQuery
    ))
)]
pub struct OcrApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ocr", post(create_ocr_task))
        .route("/ocr/tasks", get(list_tasks))
        .route("/ocr/tasks/{task_id}", get(get_task_status))
        .route("/ocr/tasks/{task_id}/cancel", post(cancel_task))
}

/// Queue a file for asynchronous OCR (`POST /ocr`).
///
/// The file extension must be on the configured allow-list and the file must
/// fit the upload limit; the size is checked while streaming so an oversized
/// upload is rejected before it is fully read.
#[utoipa::path(
    post,
    path = "/ocr",
    tag = "ocr",
    request_body(content = OcrUploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Task queued", body = TaskQueueResponse),
        (status = 400, description = "Unsupported format, missing field or file too large"),
        (status = 500, description = "Storage or queue failure"),
    )
)]
pub async fn create_ocr_task(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    mut multipart: Multipart,
) -> Result<Json<TaskQueueResponse>, ServerError> {
    let policy = state.service.policy();
    let max_upload_bytes = policy.max_upload_bytes;

    let mut file: Option<(String, Vec<u8>)> = None;
    let mut guid: Option<String> = None;
    let mut webhook_url: Option<String> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("failed to read multipart field: {e}")))?
    {
        let field_name = field.name().unwrap_or_default().to_owned();
        match field_name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_owned();
                // Reject the format before reading the body.
                policy.file_type(&filename)?;

                let mut bytes = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("failed to read file chunk: {e}")))?
                {
                    bytes.extend_from_slice(&chunk);
                    if bytes.len() > max_upload_bytes {
                        return Err(ServerError::BadRequest(format!(
                            "file too large: exceeds maximum of {} MB",
                            state.config.max_upload_size_mb
                        )));
                    }
                }
                debug!(file_name = %filename, size_bytes = bytes.len(), "received file upload");
                file = Some((filename, bytes));
            }
            "guid" | "webhook_url" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("failed to read {field_name}: {e}")))?;
                if field_name == "guid" {
                    guid = Some(value);
                } else {
                    webhook_url = Some(value);
                }
            }
            other => return Err(ServerError::BadRequest(format!("unknown field: {other}"))),
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ServerError::BadRequest("field 'file' is required".into()))?;
    let guid = guid.ok_or_else(|| ServerError::BadRequest("field 'guid' is required".into()))?;

    let submitted = state
        .service
        .submit(Upload {
            filename,
            bytes: Bytes::from(bytes),
            guid,
            webhook_url,
            correlation_id: Some(correlation_id),
        })
        .await?;
    Ok(Json(submitted.into()))
}

/// Current status of a task and, once terminal, its result.
#[utoipa::path(
    get,
    path = "/ocr/tasks/{task_id}",
    tag = "ocr",
    params(
        ("task_id" = String, Path, description = "Id returned by POST /ocr")
    ),
    responses(
        (status = 200, description = "Task status", body = TaskStatusResponse),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn get_task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ServerError> {
    let view = state.service.status(&task_id).await?;
    Ok(Json(view.into()))
}

/// Newest tasks first, optionally filtered by status.
#[utoipa::path(
    get,
    path = "/ocr/tasks",
    tag = "ocr",
    params(ListTasksQuery),
    responses(
        (status = 200, description = "Tasks listed", body = [TaskSummaryResponse]),
        (status = 400, description = "Unknown status filter"),
    )
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskSummaryResponse>>, ServerError> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            raw.trim()
                .to_ascii_uppercase()
                .parse::<TaskStatus>()
                .map_err(|_| ServerError::BadRequest(format!("unknown status filter: {raw}")))
        })
        .transpose()?;
    let tasks = state
        .service
        .list(status, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(tasks.into_iter().map(TaskSummaryResponse::from).collect()))
}

/// Fail a task that no worker has picked up yet.
///
/// A claimed task always runs to completion, so cancelling it is a conflict.
#[utoipa::path(
    post,
    path = "/ocr/tasks/{task_id}/cancel",
    tag = "ocr",
    params(
        ("task_id" = String, Path, description = "Id returned by POST /ocr")
    ),
    responses(
        (status = 200, description = "Task cancelled", body = TaskStatusResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task already claimed or finished"),
    )
)]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ServerError> {
    let view = state.service.cancel(&task_id, Some(correlation_id)).await?;
    Ok(Json(view.into()))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
