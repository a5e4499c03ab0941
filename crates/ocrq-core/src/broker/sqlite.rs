//! Durable [`Broker`] on the `queue_messages` table.
//!
//! Shares the [`crate::store::SqliteStore`] pool so a single database file
//! holds both task state and pending messages; several worker processes can
//! consume the same file.  Leasing is one `UPDATE … RETURNING` statement, so
//! two consumers can never lease the same message at once.  `dequeue` polls
//! at `poll_interval` until a message appears or the wait runs out.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{Broker, Delivery};
use crate::error::CoreError;
use crate::store::sqlite::{duration_millis, timestamp};

/// Default interval between polls while a consumer waits for a message.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct SqliteBroker {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl SqliteBroker {
    /// `pool` must come from [`crate::store::SqliteStore::connect`], which
    /// applies the queue migration.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn try_lease(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>, CoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let lease_id = Uuid::new_v4().to_string();
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "UPDATE queue_messages \
             SET lease_id = ?1, visible_at = ?2, delivery_count = delivery_count + 1 \
             WHERE id = (SELECT id FROM queue_messages \
                         WHERE queue = ?3 AND visible_at <= ?4 \
                         ORDER BY visible_at, rowid LIMIT 1) \
             RETURNING id, body, delivery_count",
        )
        .bind(&lease_id)
        .bind(now_ms.saturating_add(duration_millis(lease)))
        .bind(queue)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(message_id, body, delivery_count)| Delivery {
            message_id,
            queue: queue.to_owned(),
            lease_id,
            body,
            delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
        }))
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn enqueue(&self, queue: &str, body: String, delay: Duration) -> Result<String, CoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO queue_messages (id, queue, body, visible_at, lease_id, delivery_count, enqueued_at) \
             VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5)",
        )
        .bind(&id)
        .bind(queue)
        .bind(&body)
        .bind(now.timestamp_millis().saturating_add(duration_millis(delay)))
        .bind(timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>, CoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_lease(queue, lease).await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, CoreError> {
        let outcome = sqlx::query("DELETE FROM queue_messages WHERE id = ?1 AND lease_id = ?2")
            .bind(&delivery.message_id)
            .bind(&delivery.lease_id)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<bool, CoreError> {
        let visible_at = Utc::now()
            .timestamp_millis()
            .saturating_add(duration_millis(delay));
        let outcome = sqlx::query(
            "UPDATE queue_messages SET lease_id = NULL, visible_at = ?1 \
             WHERE id = ?2 AND lease_id = ?3",
        )
        .bind(visible_at)
        .bind(&delivery.message_id)
        .bind(&delivery.lease_id)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn depth(&self, queue: &str) -> Result<u64, CoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue = ?1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
