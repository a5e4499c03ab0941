//! Per-request span and correlation id.
//!
//! The id comes from the `x-correlation-id` request header when it is a
//! plausible token, otherwise a fresh UUID is generated.  It is stored as a
//! [`CorrelationId`] request extension (handlers forward it into queue
//! messages) and echoed on the response.  Bodies are not buffered: uploads
//! can be large.

use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

pub static X_CORRELATION_ID: &str = "x-correlation-id";

const MAX_CORRELATION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

pub async fn trace_middleware(mut req: Request<Body>, next: Next) -> Response {
    let start_time = Instant::now();

    let correlation_id = req
        .headers()
        .get(X_CORRELATION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| is_valid_correlation_id(s))
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = info_span!(
        "http_request",
        correlation_id = %correlation_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    async move {
        info!("→ request started");
        req.extensions_mut()
            .insert(CorrelationId(correlation_id.clone()));

        let mut response = next.run(req).await;

        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response.headers_mut().insert(X_CORRELATION_ID, value);
        }
        info!(
            status = response.status().as_u16(),
            latency_ms = start_time.elapsed().as_millis() as u64,
            "← response finished"
        );
        response
    }
    .instrument(span)
    .await
}

fn is_valid_correlation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CORRELATION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}
