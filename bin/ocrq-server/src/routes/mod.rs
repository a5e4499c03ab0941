//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request correlation id and span)
//! - Optional OpenAPI document (disable with `OCRQ_ENABLE_DOCS=false`)
//! - Health route
//! - OCR submission / status routes

pub mod doc;
mod health;
mod ocr;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router, middleware};

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Room for the multipart framing and the text fields on top of the file.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .merge(ocr::router());

    if state.config.enable_docs {
        let api_doc = doc::get_docs();
        app = app.route("/api-docs/openapi.json", get(move || async move { Json(api_doc) }));
    }

    let body_limit = state
        .config
        .max_upload_bytes()
        .saturating_add(MULTIPART_OVERHEAD);

    app
        // The last layer added is the outermost.
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors::cors_layer(&state))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}
