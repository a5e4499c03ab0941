//! Queue broker abstraction.
//!
//! A [`Broker`] provides at-least-once delivery with visibility leases:
//!
//! - [`Broker::enqueue`] persists a message until it is acknowledged;
//! - [`Broker::dequeue`] hands a message to exactly one consumer and hides it
//!   from everyone else for the duration of the lease;
//! - [`Broker::ack`] removes it, but only while the caller's lease is current;
//! - a lease that expires without an ack makes the message redeliverable.
//!
//! Consumers must therefore tolerate the same message more than once.  The
//! broker is injected (as `Arc<dyn Broker>`) into both the submission side and
//! the workers; there is no process-wide queue.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::CoreError;

pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

/// Queue carrying [`crate::worker::ProcessMessage`]s.
pub const PROCESS_QUEUE: &str = "ocr.process";
/// Queue carrying [`crate::webhook::DeliveryAttempt`]s.
pub const WEBHOOK_QUEUE: &str = "ocr.webhooks";

/// A leased message handed to one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub queue: String,
    /// Identifies this particular lease; stale leases cannot ack.
    pub lease_id: String,
    pub body: String,
    /// How many times the message has been handed out, this one included.
    pub delivery_count: u32,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Durably store `body` on `queue`; it becomes visible after `delay`.
    /// Returns the message id.
    async fn enqueue(&self, queue: &str, body: String, delay: Duration)
    -> Result<String, CoreError>;

    /// Lease the oldest visible message on `queue` for `lease`, waiting up to
    /// `wait` for one to appear.
    async fn dequeue(
        &self,
        queue: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>, CoreError>;

    /// Remove the message.  Returns `false` if the lease is no longer current
    /// (it expired and the message was handed to someone else).
    async fn ack(&self, delivery: &Delivery) -> Result<bool, CoreError>;

    /// Give the message back without processing it; it becomes visible again
    /// after `delay`.  Returns `false` if the lease is no longer current.
    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<bool, CoreError>;

    /// Number of messages on `queue`, leased or not.
    async fn depth(&self, queue: &str) -> Result<u64, CoreError>;
}

/// Serialize `message` as JSON and enqueue it.
pub async fn publish<T: Serialize + Sync>(
    broker: &dyn Broker,
    queue: &str,
    message: &T,
    delay: Duration,
) -> Result<String, CoreError> {
    let body = serde_json::to_string(message)?;
    broker.enqueue(queue, body, delay).await
}
