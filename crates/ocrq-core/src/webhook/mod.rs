//! Webhook delivery.
//!
//! When a task reaches a terminal state one [`DeliveryAttempt`] is placed on
//! [`WEBHOOK_QUEUE`].  A [`Dispatcher`] takes it, loads the task and POSTs a
//! [`WebhookPayload`] through its [`WebhookTransport`].  A failed attempt is
//! re-enqueued with the delay from [`RetryPolicy::next_delay`] until the
//! policy runs out, after which the failure is reported through `tracing`
//! and [`DeliveryMetrics`] only.  Delivery never touches the task's status.

pub mod retry;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::broker::{self, Broker, Delivery, WEBHOOK_QUEUE};
use crate::error::CoreError;
use crate::store::TaskStore;
use crate::types::{Task, TaskStatus};

pub use retry::{InvalidPolicy, RetryPolicy};
pub use transport::{DeliveryError, ReqwestTransport, WebhookTransport};

/// Pause after a broker or store error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// JSON body POSTed to the client's `webhook_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub task_id: String,
    pub guid: String,
    /// Base64 of the recognised UTF-8 text; empty on failure.
    pub text: String,
    pub status: TaskStatus,
    pub confidence: f64,
    pub error: String,
}

impl WebhookPayload {
    /// Returns `None` unless the task is terminal.
    pub fn from_task(task: &Task) -> Option<Self> {
        if !task.status.is_terminal() {
            return None;
        }
        let result = task.result.as_ref()?;
        Some(Self {
            task_id: task.task_id.clone(),
            guid: task.guid.clone(),
            text: result.text.clone(),
            status: task.status,
            confidence: result.confidence,
            error: result.error.clone(),
        })
    }
}

/// Queue message describing the next delivery attempt for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub task_id: String,
    /// 1-indexed number of the attempt this message triggers.
    pub attempt_number: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl DeliveryAttempt {
    pub fn first(task_id: impl Into<String>, correlation_id: Option<String>) -> Self {
        Self {
            task_id: task_id.into(),
            attempt_number: 1,
            last_error: None,
            next_retry_at: None,
            correlation_id,
        }
    }

    /// The attempt that follows this one after `error`, due in `delay`.
    pub fn next(&self, error: &DeliveryError, delay: Duration) -> Self {
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        Self {
            task_id: self.task_id.clone(),
            attempt_number: self.attempt_number.saturating_add(1),
            last_error: Some(error.to_string()),
            next_retry_at: due,
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Process-wide delivery counters, shared by all dispatchers and reported on
/// `/health`.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    delivered: AtomicU64,
    retried: AtomicU64,
    permanently_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub retried: u64,
    pub permanently_failed: u64,
}

impl DeliveryMetrics {
    pub fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub policy: RetryPolicy,
    /// Broker lease per attempt; must exceed the transport timeout.
    pub lease: Duration,
    pub dequeue_wait: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            lease: Duration::from_secs(40),
            dequeue_wait: Duration::from_secs(5),
        }
    }
}

/// What [`Dispatcher::process_next`] did with one message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The endpoint answered 2xx.
    Delivered { task_id: String, attempt: u32 },
    /// The attempt failed and the next one was enqueued after `delay`.
    RetryScheduled {
        task_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// The last permitted attempt failed.
    Exhausted { task_id: String, attempts: u32 },
    /// Nothing to deliver: the task is gone, has no webhook or is not terminal.
    Skipped { task_id: String },
    /// The message body could not be decoded.
    Discarded { message_id: String },
}

pub struct Dispatcher<S> {
    store: Arc<S>,
    broker: Arc<dyn Broker>,
    transport: Arc<dyn WebhookTransport>,
    metrics: Arc<DeliveryMetrics>,
    config: DispatcherConfig,
}

impl<S: TaskStore> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        broker: Arc<dyn Broker>,
        transport: Arc<dyn WebhookTransport>,
        metrics: Arc<DeliveryMetrics>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            broker,
            transport,
            metrics,
            config,
        }
    }

    /// Consume until `shutdown` flips to `true`.  The message in hand is
    /// finished before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("webhook dispatcher started");
        while !*shutdown.borrow_and_update() {
            if let Err(e) = self.process_next().await {
                error!(error = %e, "webhook dispatcher iteration failed");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
            }
        }
        info!("webhook dispatcher stopped");
    }

    /// Take at most one delivery message and handle it.  Returns `Ok(None)`
    /// when the queue stayed empty for `dequeue_wait`.
    pub async fn process_next(&self) -> Result<Option<DeliveryOutcome>, CoreError> {
        let Some(delivery) = self
            .broker
            .dequeue(WEBHOOK_QUEUE, self.config.lease, self.config.dequeue_wait)
            .await?
        else {
            return Ok(None);
        };

        let attempt: DeliveryAttempt = match serde_json::from_str(&delivery.body) {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(message_id = %delivery.message_id, error = %e, "discarding undecodable webhook message");
                self.broker.ack(&delivery).await?;
                return Ok(Some(DeliveryOutcome::Discarded {
                    message_id: delivery.message_id,
                }));
            }
        };

        let span = info_span!(
            "deliver_webhook",
            task_id = %attempt.task_id,
            attempt = attempt.attempt_number,
            correlation_id = attempt.correlation_id.as_deref().unwrap_or(""),
        );
        self.deliver(&delivery, attempt).instrument(span).await.map(Some)
    }

    async fn deliver(
        &self,
        delivery: &Delivery,
        attempt: DeliveryAttempt,
    ) -> Result<DeliveryOutcome, CoreError> {
        let task = self.store.get_task(&attempt.task_id).await?;
        let target = task.as_ref().and_then(|task| {
            let url = task.webhook_url.clone()?;
            Some((url, WebhookPayload::from_task(task)?))
        });
        let Some((url, payload)) = target else {
            warn!("no deliverable webhook for task, dropping attempt");
            self.broker.ack(delivery).await?;
            return Ok(DeliveryOutcome::Skipped {
                task_id: attempt.task_id,
            });
        };

        let outcome = match self.transport.post(&url, &payload).await {
            Ok(status) => {
                self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                info!(status, "webhook delivered");
                DeliveryOutcome::Delivered {
                    task_id: attempt.task_id,
                    attempt: attempt.attempt_number,
                }
            }
            Err(e) if self.config.policy.should_retry(attempt.attempt_number) => {
                let delay = self.config.policy.next_delay(attempt.attempt_number);
                let next = attempt.next(&e, delay);
                broker::publish(self.broker.as_ref(), WEBHOOK_QUEUE, &next, delay).await?;
                self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %e,
                    max_attempts = self.config.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "webhook delivery failed, will retry"
                );
                DeliveryOutcome::RetryScheduled {
                    task_id: attempt.task_id,
                    attempt: attempt.attempt_number,
                    delay,
                }
            }
            Err(e) => {
                self.metrics.permanently_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    error = %e,
                    url = %url,
                    attempts = attempt.attempt_number,
                    "webhook delivery permanently failed"
                );
                DeliveryOutcome::Exhausted {
                    task_id: attempt.task_id,
                    attempts: attempt.attempt_number,
                }
            }
        };

        if !self.broker.ack(delivery).await? {
            // The lease ran out mid-request; the message will come round
            // again and the endpoint may see a duplicate.
            debug!("webhook message lease expired before ack");
        }
        Ok(outcome)
    }
}
