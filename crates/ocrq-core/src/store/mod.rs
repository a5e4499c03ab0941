//! Task store abstraction.
//!
//! [`TaskStore`] is the single source of truth for task state.  Every status
//! change is a compare-and-set against the current row so that two workers
//! racing on a redelivered message cannot both claim or both complete the
//! same task.  The default implementation is [`sqlite::SqliteStore`].
//!
//! All trait methods use `impl Future` in their signatures so no extra
//! `async-trait` crate is required; consumers are generic over the store.

pub mod sqlite;

use std::future::Future;
use std::time::Duration;

use crate::error::CoreError;
use crate::types::{NewTask, OcrResult, Task, TaskStatus};

pub use sqlite::SqliteStore;

/// Result of a worker trying to take processing rights over a task.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now holds the task; it is `Processing`.
    Claimed(Task),
    /// The task already finished; the message is a redelivery.
    Terminal(Task),
    /// Another worker holds a live claim that expires in `retry_in`.
    Held {
        claimed_by: String,
        retry_in: Duration,
    },
    /// No task with that id exists.
    Missing,
}

pub trait TaskStore: Send + Sync + 'static {
    /// Persist a new task in `Queued` state.
    fn insert_task(&self, task: NewTask) -> impl Future<Output = Result<Task, CoreError>> + Send;

    /// Read-only snapshot of a task.
    fn get_task(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<Option<Task>, CoreError>> + Send;

    /// Newest-first listing, optionally filtered by status.
    fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Task>, CoreError>> + Send;

    /// Atomically move `Queued → Processing` for `worker_id`.
    ///
    /// A `Processing` task whose previous claim expired (the holder crashed)
    /// is re-claimed without a new status transition.
    fn claim_task(
        &self,
        task_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<ClaimOutcome, CoreError>> + Send;

    /// Atomically move `Processing → status` if `worker_id` still holds the
    /// claim.  Returns `false` when the claim was lost.
    fn complete_task(
        &self,
        task_id: &str,
        worker_id: &str,
        status: TaskStatus,
        result: &OcrResult,
    ) -> impl Future<Output = Result<bool, CoreError>> + Send;

    /// Fail a task that no worker has claimed yet.  Returns `None` if the
    /// task is not `Queued`.
    fn cancel_queued(
        &self,
        task_id: &str,
        reason: &str,
    ) -> impl Future<Output = Result<Option<Task>, CoreError>> + Send;

    /// Remove a task no worker has seen yet.  Returns `false` if the task is
    /// missing or no longer `Queued`.
    fn delete_queued(&self, task_id: &str) -> impl Future<Output = Result<bool, CoreError>> + Send;

    /// Record that the terminal-state webhook message has been enqueued.
    fn mark_webhook_enqueued(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;

    /// Drop the payload reference after the stored bytes were removed.
    fn clear_payload_ref(&self, task_id: &str)
    -> impl Future<Output = Result<(), CoreError>> + Send;
}
