//! SQLite implementation of [`TaskStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature.  Migrations are run automatically
//! on startup via [`SqliteStore::connect`]; the same pool also backs the
//! durable queue in [`crate::broker::sqlite`].
//!
//! # Queries
//!
//! The `sqlx::query` (runtime-verified) form is used so that no
//! `DATABASE_URL` environment variable is needed at compile time.
//! Every status change is a single `UPDATE … WHERE status = …` statement,
//! which SQLite executes atomically.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::warn;

use super::{ClaimOutcome, TaskStore};
use crate::error::CoreError;
use crate::types::{NewTask, OcrResult, Task, TaskStatus};

macro_rules! task_columns {
    () => {
        "id, guid, filename, file_type, status, payload_ref, webhook_url, result_text, \
         result_confidence, result_error, claimed_by, claim_expires_at, webhook_enqueued, \
         created_at, updated_at"
    };
}

const SELECT_TASK: &str = concat!("SELECT ", task_columns!(), " FROM ocr_tasks WHERE id = ?1");

const CLAIM_TASK: &str = concat!(
    "UPDATE ocr_tasks SET status = 'PROCESSING', claimed_by = ?1, claim_expires_at = ?2, \
     updated_at = ?3 \
     WHERE id = ?4 AND (status = 'QUEUED' OR (status = 'PROCESSING' AND claim_expires_at < ?5)) \
     RETURNING ",
    task_columns!()
);

const CANCEL_QUEUED: &str = concat!(
    "UPDATE ocr_tasks SET status = 'FAILURE', result_text = '', result_confidence = 0.0, \
     result_error = ?1, updated_at = ?2 \
     WHERE id = ?3 AND status = 'QUEUED' \
     RETURNING ",
    task_columns!()
);

const LIST_ALL: &str = concat!(
    "SELECT ",
    task_columns!(),
    " FROM ocr_tasks ORDER BY created_at DESC LIMIT ?1"
);

const LIST_BY_STATUS: &str = concat!(
    "SELECT ",
    task_columns!(),
    " FROM ocr_tasks WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
);

/// SQLite-backed task store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g. `"sqlite://ocrq.db"`
    /// or `"sqlite::memory:"` for tests.  An in-memory database is pinned to a
    /// single long-lived connection, otherwise every pooled connection would
    /// see its own empty database.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = pool_options.connect_with(options).await?;
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool, shared with [`crate::broker::SqliteBroker`].
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_row(&self, task_id: &str) -> Result<Option<TaskRow>, CoreError> {
        let row = sqlx::query_as::<_, TaskRow>(SELECT_TASK)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: NewTask) -> Result<Task, CoreError> {
        let now = timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO ocr_tasks (id, guid, filename, file_type, status, payload_ref, \
             webhook_url, webhook_enqueued, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'QUEUED', ?5, ?6, 0, ?7, ?7)",
        )
        .bind(&task.task_id)
        .bind(&task.guid)
        .bind(&task.filename)
        .bind(&task.file_type)
        .bind(&task.payload_ref)
        .bind(&task.webhook_url)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_task(&task.task_id)
            .await?
            .ok_or(CoreError::TaskNotFound {
                task_id: task.task_id,
            })
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        self.fetch_row(task_id).await?.map(Task::try_from).transpose()
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
    ) -> Result<Vec<Task>, CoreError> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, TaskRow>(LIST_BY_STATUS)
                .bind(status.as_ref())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query_as::<_, TaskRow>(LIST_ALL)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
        };
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn claim_task(
        &self,
        task_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, CoreError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_at = now_ms.saturating_add(duration_millis(lease));

        let claimed = sqlx::query_as::<_, TaskRow>(CLAIM_TASK)
            .bind(worker_id)
            .bind(expires_at)
            .bind(timestamp(now))
            .bind(task_id)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(Task::try_from(row)?));
        }

        let Some(row) = self.fetch_row(task_id).await? else {
            return Ok(ClaimOutcome::Missing);
        };
        let remaining_ms = row
            .claim_expires_at
            .map(|at| at.saturating_sub(now_ms).max(0))
            .unwrap_or(0);
        let claimed_by = row.claimed_by.clone().unwrap_or_default();
        let task = Task::try_from(row)?;
        if task.status.is_terminal() {
            Ok(ClaimOutcome::Terminal(task))
        } else {
            Ok(ClaimOutcome::Held {
                claimed_by,
                retry_in: Duration::from_millis(remaining_ms as u64),
            })
        }
    }

    async fn complete_task(
        &self,
        task_id: &str,
        worker_id: &str,
        status: TaskStatus,
        result: &OcrResult,
    ) -> Result<bool, CoreError> {
        if !TaskStatus::Processing.can_transition_to(status) {
            return Err(CoreError::InvalidTransition {
                task_id: task_id.to_owned(),
                from: TaskStatus::Processing,
                to: status,
            });
        }
        let outcome = sqlx::query(
            "UPDATE ocr_tasks SET status = ?1, result_text = ?2, result_confidence = ?3, \
             result_error = ?4, claimed_by = NULL, claim_expires_at = NULL, updated_at = ?5 \
             WHERE id = ?6 AND status = 'PROCESSING' AND claimed_by = ?7",
        )
        .bind(status.as_ref())
        .bind(&result.text)
        .bind(result.confidence)
        .bind(&result.error)
        .bind(timestamp(Utc::now()))
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn cancel_queued(&self, task_id: &str, reason: &str) -> Result<Option<Task>, CoreError> {
        let row = sqlx::query_as::<_, TaskRow>(CANCEL_QUEUED)
            .bind(crate::types::bound_error(reason))
            .bind(timestamp(Utc::now()))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn delete_queued(&self, task_id: &str) -> Result<bool, CoreError> {
        let outcome = sqlx::query("DELETE FROM ocr_tasks WHERE id = ?1 AND status = 'QUEUED'")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn mark_webhook_enqueued(&self, task_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE ocr_tasks SET webhook_enqueued = 1, updated_at = ?1 WHERE id = ?2")
            .bind(timestamp(Utc::now()))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_payload_ref(&self, task_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE ocr_tasks SET payload_ref = NULL, updated_at = ?1 WHERE id = ?2")
            .bind(timestamp(Utc::now()))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────────

/// A raw row in the `ocr_tasks` table.
#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    guid: String,
    filename: String,
    file_type: String,
    status: String,
    payload_ref: Option<String>,
    webhook_url: Option<String>,
    result_text: Option<String>,
    result_confidence: Option<f64>,
    result_error: Option<String>,
    claimed_by: Option<String>,
    claim_expires_at: Option<i64>,
    webhook_enqueued: bool,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status).map_err(|_| {
            CoreError::Corrupt(format!("task {} has unknown status '{}'", row.id, row.status))
        })?;
        let result = status.is_terminal().then(|| OcrResult {
            text: row.result_text.unwrap_or_default(),
            confidence: row.result_confidence.unwrap_or(0.0),
            error: row.result_error.unwrap_or_default(),
        });
        Ok(Task {
            created_at: parse_timestamp(&row.id, "created_at", &row.created_at),
            updated_at: parse_timestamp(&row.id, "updated_at", &row.updated_at),
            task_id: row.id,
            guid: row.guid,
            filename: row.filename,
            file_type: row.file_type,
            status,
            payload_ref: row.payload_ref,
            webhook_url: row.webhook_url,
            result,
            claimed_by: row.claimed_by,
            webhook_enqueued: row.webhook_enqueued,
        })
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that lexical order equals chronological order.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn parse_timestamp(task_id: &str, column: &str, raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        warn!(task_id, column, raw, error = %e, "failed to parse task timestamp; using now");
        Utc::now()
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────
