//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use ocrq_core::api::OcrService;
use ocrq_core::store::SqliteStore;
use ocrq_core::webhook::DeliveryMetrics;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Submission, status, listing and cancellation.
    pub service: Arc<OcrService<SqliteStore>>,
    /// Webhook counters of the dispatchers running in this process.
    pub metrics: Arc<DeliveryMetrics>,
}
