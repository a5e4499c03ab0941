//! Submission and status operations.
//!
//! [`OcrService`] is what the HTTP layer calls.  Submission validates the
//! upload, stores the payload, creates the task in `QUEUED` and enqueues a
//! [`ProcessMessage`]; it never waits for OCR.  The read side is a plain
//! snapshot of the task store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{self, Broker, PROCESS_QUEUE, WEBHOOK_QUEUE};
use crate::error::CoreError;
use crate::payload::PayloadStore;
use crate::store::TaskStore;
use crate::types::{NewTask, OcrResult, Task, TaskStatus};
use crate::webhook::DeliveryAttempt;
use crate::worker::ProcessMessage;

/// Error recorded on a task cancelled before any worker claimed it.
pub const CANCELLED_ERROR: &str = "cancelled";

/// Largest page [`OcrService::list`] returns.
pub const MAX_LIST_LIMIT: u32 = 500;

/// What uploads are accepted.
#[derive(Debug, Clone)]
pub struct SubmissionPolicy {
    /// Lower-case file extensions without the dot.
    pub allowed_formats: Vec<String>,
    pub max_upload_bytes: usize,
}

impl Default for SubmissionPolicy {
    fn default() -> Self {
        Self {
            allowed_formats: ["pdf", "png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl SubmissionPolicy {
    /// The lower-case extension of `filename` if it is allow-listed.
    pub fn file_type(&self, filename: &str) -> Result<String, SubmitError> {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !extension.is_empty() && self.allowed_formats.iter().any(|f| *f == extension) {
            Ok(extension)
        } else {
            Err(SubmitError::UnsupportedFormat {
                extension,
                allowed: self.allowed_formats.join(", "),
            })
        }
    }
}

/// Submission failures.  Everything except `Core` is the client's fault and
/// leaves no task behind.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unsupported file format '{extension}', allowed formats: {allowed}")]
    UnsupportedFormat { extension: String, allowed: String },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// One upload as received by the HTTP layer.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Bytes,
    pub guid: String,
    pub webhook_url: Option<String>,
    pub correlation_id: Option<String>,
}

/// Returned as soon as the task is queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submitted {
    pub task_id: String,
    pub guid: String,
    pub filename: String,
    /// Always `"queued"`.
    pub status: String,
}

/// Read-only snapshot of one task; `result` is `null` until terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<OcrResult>,
}

impl From<Task> for StatusView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            status: task.status,
            result: task.result,
        }
    }
}

/// Listing entry; omits the result body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub guid: String,
    pub filename: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            guid: task.guid,
            filename: task.filename,
            status: task.status,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub process: u64,
    pub webhooks: u64,
}

pub struct OcrService<S> {
    store: Arc<S>,
    broker: Arc<dyn Broker>,
    payloads: PayloadStore,
    policy: SubmissionPolicy,
}

impl<S: TaskStore> OcrService<S> {
    pub fn new(
        store: Arc<S>,
        broker: Arc<dyn Broker>,
        payloads: PayloadStore,
        policy: SubmissionPolicy,
    ) -> Self {
        Self {
            store,
            broker,
            payloads,
            policy,
        }
    }

    pub fn policy(&self) -> &SubmissionPolicy {
        &self.policy
    }

    /// Validate, persist and enqueue one upload.
    pub async fn submit(&self, upload: Upload) -> Result<Submitted, SubmitError> {
        let file_type = self.policy.file_type(&upload.filename)?;
        if upload.bytes.is_empty() {
            return Err(SubmitError::Validation("uploaded file is empty".into()));
        }
        if upload.bytes.len() > self.policy.max_upload_bytes {
            return Err(SubmitError::Validation(format!(
                "file exceeds the maximum upload size of {} bytes",
                self.policy.max_upload_bytes
            )));
        }
        let guid = upload.guid.trim();
        if guid.is_empty() {
            return Err(SubmitError::Validation("guid must not be empty".into()));
        }
        let webhook_url = match upload.webhook_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(url) => Some(validate_webhook_url(url)?),
        };

        let task_id = Uuid::new_v4().to_string();
        let payload_ref = self
            .payloads
            .put(&task_id, &upload.filename, &upload.bytes)
            .await?;

        let task = self
            .store
            .insert_task(NewTask {
                task_id: task_id.clone(),
                guid: guid.to_owned(),
                filename: upload.filename.clone(),
                file_type,
                payload_ref: payload_ref.clone(),
                webhook_url,
            })
            .await;
        if let Err(e) = task {
            self.discard_payload(&payload_ref).await;
            return Err(e.into());
        }

        let message = ProcessMessage {
            task_id: task_id.clone(),
            correlation_id: upload.correlation_id,
        };
        if let Err(e) = broker::publish(self.broker.as_ref(), PROCESS_QUEUE, &message, Duration::ZERO).await {
            // The caller never learns this task id, so the row goes too.
            warn!(%task_id, error = %e, "failed to enqueue task");
            if let Err(delete_err) = self.store.delete_queued(&task_id).await {
                warn!(%task_id, error = %delete_err, "failed to delete unqueued task");
            }
            self.discard_payload(&payload_ref).await;
            return Err(e.into());
        }

        info!(%task_id, %guid, filename = %upload.filename, size_bytes = upload.bytes.len(), "task queued");
        Ok(Submitted {
            task_id,
            guid: guid.to_owned(),
            filename: upload.filename,
            status: "queued".into(),
        })
    }

    pub async fn status(&self, task_id: &str) -> Result<StatusView, CoreError> {
        self.store
            .get_task(task_id)
            .await?
            .map(StatusView::from)
            .ok_or_else(|| CoreError::TaskNotFound {
                task_id: task_id.to_owned(),
            })
    }

    /// Newest first; `limit` is clamped to `1..=MAX_LIST_LIMIT`.
    pub async fn list(&self, status: Option<TaskStatus>, limit: u32) -> Result<Vec<TaskSummary>, CoreError> {
        let tasks = self
            .store
            .list_tasks(status, limit.clamp(1, MAX_LIST_LIMIT))
            .await?;
        Ok(tasks.into_iter().map(TaskSummary::from).collect())
    }

    /// Fail a task that no worker has claimed yet.  Once claimed, the task
    /// runs to completion and this returns [`CoreError::InvalidTransition`].
    pub async fn cancel(&self, task_id: &str, correlation_id: Option<String>) -> Result<StatusView, CoreError> {
        let Some(task) = self.store.cancel_queued(task_id, CANCELLED_ERROR).await? else {
            return Err(match self.store.get_task(task_id).await? {
                Some(task) => CoreError::InvalidTransition {
                    task_id: task_id.to_owned(),
                    from: task.status,
                    to: TaskStatus::Failure,
                },
                None => CoreError::TaskNotFound {
                    task_id: task_id.to_owned(),
                },
            });
        };
        info!(%task_id, "task cancelled");

        // The worker that later picks up the process message sees a terminal
        // task and only repairs the webhook enqueue if this step failed.
        if task.webhook_url.is_some() {
            let attempt = DeliveryAttempt::first(task_id, correlation_id);
            broker::publish(self.broker.as_ref(), WEBHOOK_QUEUE, &attempt, Duration::ZERO).await?;
        }
        self.store.mark_webhook_enqueued(task_id).await?;
        if let Some(payload_ref) = task.payload_ref.as_deref() {
            self.discard_payload(payload_ref).await;
            self.store.clear_payload_ref(task_id).await?;
        }

        Ok(StatusView {
            task_id: task.task_id,
            status: task.status,
            result: task.result,
        })
    }

    pub async fn queue_depths(&self) -> Result<QueueDepths, CoreError> {
        Ok(QueueDepths {
            process: self.broker.depth(PROCESS_QUEUE).await?,
            webhooks: self.broker.depth(WEBHOOK_QUEUE).await?,
        })
    }

    async fn discard_payload(&self, payload_ref: &str) {
        if let Err(e) = self.payloads.remove(payload_ref).await {
            warn!(%payload_ref, error = %e, "failed to remove payload");
        }
    }
}

/// Accept only absolute `http`/`https` URLs with a host.
pub fn validate_webhook_url(raw: &str) -> Result<String, SubmitError> {
    let url = Url::parse(raw)
        .map_err(|e| SubmitError::Validation(format!("invalid webhook_url '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(SubmitError::Validation(format!(
            "webhook_url must be an http or https URL, got '{raw}'"
        )));
    }
    Ok(url.to_string())
}
