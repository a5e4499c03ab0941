//! Worker executor.
//!
//! A [`Worker`] is one sequential consumer of [`PROCESS_QUEUE`]; run several
//! for concurrency.  Per message:
//!
//! 1. claim the task in the store (compare-and-set `QUEUED → PROCESSING`);
//! 2. read the payload and call the [`OcrEngine`] under the processing timeout;
//! 3. write the terminal status and result (compare-and-set on the claim);
//! 4. enqueue the webhook delivery and drop the payload;
//! 5. ack the message.
//!
//! A crash anywhere before step 5 leaves the message leased; it is handed out
//! again once the lease expires and the claim's expiry lets the next worker
//! take over.  A redelivery for a finished task only repairs a missing
//! webhook enqueue.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::broker::{self, Broker, Delivery, PROCESS_QUEUE, WEBHOOK_QUEUE};
use crate::engine::{OcrEngine, OcrOutput};
use crate::error::{CoreError, OcrError};
use crate::payload::PayloadStore;
use crate::store::{ClaimOutcome, TaskStore};
use crate::types::{OcrResult, Task, TaskStatus};
use crate::webhook::DeliveryAttempt;

/// Pause after a broker or store error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Body of a [`PROCESS_QUEUE`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMessage {
    pub task_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recorded as `claimed_by`; must be unique per consumer.
    pub worker_id: String,
    /// Upper bound for one engine call.
    pub processing_timeout: Duration,
    /// Extra lease time on top of `processing_timeout` for store writes and
    /// the webhook enqueue.
    pub lease_grace: Duration,
    pub dequeue_wait: Duration,
}

impl WorkerConfig {
    /// Broker lease and claim lifetime for one task.
    pub fn lease(&self) -> Duration {
        self.processing_timeout + self.lease_grace
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            processing_timeout: Duration::from_secs(300),
            lease_grace: Duration::from_secs(30),
            dequeue_wait: Duration::from_secs(5),
        }
    }
}

/// What [`Worker::process_next`] did with one message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// This worker ran the task to a terminal state.
    Completed { task_id: String, status: TaskStatus },
    /// The task was already terminal (or unknown); nothing was processed.
    Skipped { task_id: String },
    /// Another worker holds a live claim; the message was released for later.
    Deferred { task_id: String },
    /// The message body could not be decoded and was dropped.
    Discarded { message_id: String },
    /// The claim expired and was taken over before the result was written.
    LostClaim { task_id: String },
}

pub struct Worker<S> {
    store: Arc<S>,
    broker: Arc<dyn Broker>,
    payloads: PayloadStore,
    engine: Arc<dyn OcrEngine>,
    config: WorkerConfig,
}

impl<S: TaskStore> Worker<S> {
    pub fn new(
        store: Arc<S>,
        broker: Arc<dyn Broker>,
        payloads: PayloadStore,
        engine: Arc<dyn OcrEngine>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            payloads,
            engine,
            config,
        }
    }

    /// Consume until `shutdown` flips to `true`.  A task in progress is
    /// finished before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.config.worker_id, "worker started");
        while !*shutdown.borrow_and_update() {
            if let Err(e) = self.process_next().await {
                error!(worker_id = %self.config.worker_id, error = %e, "worker iteration failed");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
            }
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    /// Take at most one process message and handle it.  Returns `Ok(None)`
    /// when the queue stayed empty for `dequeue_wait`.
    ///
    /// An `Err` means a store or broker call failed; the message is left
    /// leased and will be redelivered.
    pub async fn process_next(&self) -> Result<Option<ProcessOutcome>, CoreError> {
        let Some(delivery) = self
            .broker
            .dequeue(PROCESS_QUEUE, self.config.lease(), self.config.dequeue_wait)
            .await?
        else {
            return Ok(None);
        };

        let message: ProcessMessage = match serde_json::from_str(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(message_id = %delivery.message_id, error = %e, "discarding undecodable process message");
                self.broker.ack(&delivery).await?;
                return Ok(Some(ProcessOutcome::Discarded {
                    message_id: delivery.message_id,
                }));
            }
        };

        let span = info_span!(
            "process_task",
            task_id = %message.task_id,
            worker_id = %self.config.worker_id,
            correlation_id = message.correlation_id.as_deref().unwrap_or(""),
            delivery = delivery.delivery_count,
        );
        self.handle(&delivery, message).instrument(span).await.map(Some)
    }

    async fn handle(
        &self,
        delivery: &Delivery,
        message: ProcessMessage,
    ) -> Result<ProcessOutcome, CoreError> {
        let ProcessMessage {
            task_id,
            correlation_id,
        } = message;

        let task = match self
            .store
            .claim_task(&task_id, &self.config.worker_id, self.config.lease())
            .await?
        {
            ClaimOutcome::Claimed(task) => task,
            ClaimOutcome::Terminal(task) => {
                debug!(status = %task.status, "task already finished, redelivery ignored");
                if !task.webhook_enqueued {
                    self.notify(&task, correlation_id).await?;
                }
                self.cleanup(&task).await;
                self.broker.ack(delivery).await?;
                return Ok(ProcessOutcome::Skipped { task_id });
            }
            ClaimOutcome::Held {
                claimed_by,
                retry_in,
            } => {
                debug!(%claimed_by, retry_in_ms = retry_in.as_millis() as u64, "task held by another worker");
                self.broker.release(delivery, retry_in).await?;
                return Ok(ProcessOutcome::Deferred { task_id });
            }
            ClaimOutcome::Missing => {
                warn!("process message for unknown task dropped");
                self.broker.ack(delivery).await?;
                return Ok(ProcessOutcome::Skipped { task_id });
            }
        };

        info!(file_type = %task.file_type, "task claimed");
        let (status, result) = match self.load_and_recognize(&task).await {
            Ok(output) => {
                let result = OcrResult::success(&output.text, output.confidence);
                info!(confidence = result.confidence, "ocr succeeded");
                (TaskStatus::Success, result)
            }
            Err(e) => {
                warn!(error = %e, "ocr failed");
                (TaskStatus::Failure, OcrResult::failure(e.to_string()))
            }
        };

        if !self
            .store
            .complete_task(&task_id, &self.config.worker_id, status, &result)
            .await?
        {
            warn!("claim lost before the result was recorded, discarding result");
            self.broker.ack(delivery).await?;
            return Ok(ProcessOutcome::LostClaim { task_id });
        }

        self.notify(&task, correlation_id).await?;
        self.cleanup(&task).await;
        if !self.broker.ack(delivery).await? {
            debug!("process message lease expired before ack");
        }
        info!(%status, "task completed");
        Ok(ProcessOutcome::Completed { task_id, status })
    }

    async fn load_and_recognize(&self, task: &Task) -> Result<OcrOutput, OcrError> {
        let Some(payload_ref) = task.payload_ref.as_deref() else {
            return Err(OcrError::UnsupportedContent("payload is no longer available".into()));
        };
        let file = self
            .payloads
            .get(payload_ref)
            .await
            .map_err(|e| OcrError::UnsupportedContent(format!("payload unreadable: {e}")))?;
        self.recognize(file, &task.file_type).await
    }

    /// Run the engine on its own task so a panic or a hang cannot take the
    /// worker with it.  On timeout the engine task is aborted.
    async fn recognize(&self, file: Bytes, file_type: &str) -> Result<OcrOutput, OcrError> {
        let engine = Arc::clone(&self.engine);
        let file_type = file_type.to_owned();
        let mut handle = tokio::spawn(async move { engine.run_ocr(file, &file_type).await });

        match tokio::time::timeout(self.config.processing_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => Err(OcrError::Engine(format!(
                "ocr engine panicked: {}",
                panic_message(join_error.into_panic())
            ))),
            Ok(Err(_)) => Err(OcrError::Engine("ocr engine task was cancelled".into())),
            Err(_) => {
                handle.abort();
                Err(OcrError::Timeout(self.config.processing_timeout))
            }
        }
    }

    /// Enqueue the webhook delivery for a terminal task and record it.
    async fn notify(&self, task: &Task, correlation_id: Option<String>) -> Result<(), CoreError> {
        if task.webhook_url.is_some() {
            let attempt = DeliveryAttempt::first(task.task_id.clone(), correlation_id);
            broker::publish(self.broker.as_ref(), WEBHOOK_QUEUE, &attempt, Duration::ZERO).await?;
            debug!("webhook delivery enqueued");
        }
        self.store.mark_webhook_enqueued(&task.task_id).await
    }

    /// Best effort: a leftover payload is only wasted disk.
    async fn cleanup(&self, task: &Task) {
        let Some(payload_ref) = task.payload_ref.as_deref() else {
            return;
        };
        if let Err(e) = self.payloads.remove(payload_ref).await {
            warn!(error = %e, "failed to remove payload");
            return;
        }
        if let Err(e) = self.store.clear_payload_ref(&task.task_id).await {
            warn!(error = %e, "failed to clear payload reference");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
