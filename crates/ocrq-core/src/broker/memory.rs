//! In-process [`Broker`] for tests and single-binary deployments.
//!
//! Messages live in a `std::sync::Mutex<HashMap>`; the lock is never held
//! across an `.await`.  Waiting consumers park on a [`Notify`] and wake on
//! every enqueue/release or when the next delayed message becomes visible.
//! Nothing survives a restart, so production deployments use
//! [`super::SqliteBroker`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Broker, Delivery};
use crate::error::CoreError;

#[derive(Debug)]
struct Entry {
    id: String,
    seq: u64,
    body: String,
    visible_at: Instant,
    lease_id: Option<String>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Vec<Entry>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease the next visible message, or report when the earliest hidden
    /// one becomes visible.
    fn try_take(&self, queue: &str, lease: Duration) -> Result<Delivery, Option<Instant>> {
        let now = Instant::now();
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = queues.get_mut(queue) else {
            return Err(None);
        };

        let ready = entries
            .iter_mut()
            .filter(|e| e.visible_at <= now)
            .min_by_key(|e| (e.visible_at, e.seq));
        match ready {
            Some(entry) => {
                let lease_id = Uuid::new_v4().to_string();
                entry.lease_id = Some(lease_id.clone());
                entry.visible_at = now + lease;
                entry.delivery_count += 1;
                Ok(Delivery {
                    message_id: entry.id.clone(),
                    queue: queue.to_owned(),
                    lease_id,
                    body: entry.body.clone(),
                    delivery_count: entry.delivery_count,
                })
            }
            None => Err(entries.iter().map(|e| e.visible_at).min()),
        }
    }

    fn with_leased<R>(&self, delivery: &Delivery, f: impl FnOnce(&mut Vec<Entry>, usize) -> R) -> Option<R> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let entries = queues.get_mut(&delivery.queue)?;
        let idx = entries.iter().position(|e| {
            e.id == delivery.message_id && e.lease_id.as_deref() == Some(delivery.lease_id.as_str())
        })?;
        Some(f(entries, idx))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, queue: &str, body: String, delay: Duration) -> Result<String, CoreError> {
        let id = Uuid::new_v4().to_string();
        let entry = Entry {
            id: id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            body,
            visible_at: Instant::now() + delay,
            lease_id: None,
            delivery_count: 0,
        };
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue.to_owned())
            .or_default()
            .push(entry);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>, CoreError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so an enqueue racing with the
            // check still wakes us.
            let notified = self.notify.notified();
            let next_visible = match self.try_take(queue, lease) {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next_visible) => next_visible,
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, CoreError> {
        Ok(self
            .with_leased(delivery, |entries, idx| {
                entries.remove(idx);
            })
            .is_some())
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<bool, CoreError> {
        let released = self
            .with_leased(delivery, |entries, idx| {
                let entry = &mut entries[idx];
                entry.lease_id = None;
                entry.visible_at = Instant::now() + delay;
            })
            .is_some();
        if released {
            self.notify.notify_waiters();
        }
        Ok(released)
    }

    async fn depth(&self, queue: &str) -> Result<u64, CoreError> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Ok(queues.get(queue).map_or(0, |e| e.len() as u64))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
