use ocrq_core::api::QueueDepths;
use ocrq_core::webhook::DeliveryStats;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub webhooks: WebhookStatsResponse,
    /// `null` when the queue could not be read.
    pub queues: Option<QueueDepthsResponse>,
}

/// Delivery counters of the dispatchers running in this process.
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookStatsResponse {
    pub delivered: u64,
    pub retried: u64,
    pub permanently_failed: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueDepthsResponse {
    pub process: u64,
    pub webhooks: u64,
}

impl From<DeliveryStats> for WebhookStatsResponse {
    fn from(stats: DeliveryStats) -> Self {
        Self {
            delivered: stats.delivered,
            retried: stats.retried,
            permanently_failed: stats.permanently_failed,
        }
    }
}

impl From<QueueDepths> for QueueDepthsResponse {
    fn from(depths: QueueDepths) -> Self {
        Self {
            process: depths.process,
            webhooks: depths.webhooks,
        }
    }
}
