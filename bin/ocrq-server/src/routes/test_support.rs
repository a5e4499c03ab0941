//! Router fixtures: in-memory store and broker, temp payload dir, and helpers
//! to build requests and read JSON responses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use bytes::Bytes;
use http_body_util::BodyExt;
use ocrq_core::api::OcrService;
use ocrq_core::broker::MemoryBroker;
use ocrq_core::engine::{OcrEngine, OcrOutput};
use ocrq_core::payload::PayloadStore;
use ocrq_core::store::SqliteStore;
use ocrq_core::webhook::DeliveryMetrics;
use ocrq_core::worker::{Worker, WorkerConfig};
use ocrq_core::OcrError;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::config::Config;
use crate::routes;
use crate::state::AppState;

const BOUNDARY: &str = "ocrq-test-boundary";

pub struct TestApp {
    pub state: Arc<AppState>,
    router: Router,
    store: Arc<SqliteStore>,
    broker: Arc<MemoryBroker>,
    payloads: PayloadStore,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let broker = Arc::new(MemoryBroker::new());
        let payloads = PayloadStore::new(dir.path());
        let service = OcrService::new(
            Arc::clone(&store),
            broker.clone(),
            payloads.clone(),
            config.submission_policy(),
        );
        let state = Arc::new(AppState {
            config: Arc::new(config),
            service: Arc::new(service),
            metrics: Arc::new(DeliveryMetrics::default()),
        });
        Self {
            router: routes::build(Arc::clone(&state)),
            state,
            store,
            broker,
            payloads,
            _dir: dir,
        }
    }

    pub fn worker(&self, engine: Arc<dyn OcrEngine>) -> Worker<SqliteStore> {
        Worker::new(
            Arc::clone(&self.store),
            self.broker.clone(),
            self.payloads.clone(),
            engine,
            WorkerConfig {
                dequeue_wait: Duration::from_millis(100),
                ..WorkerConfig::default()
            },
        )
    }

    /// Run one request through the full middleware stack.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }
}

/// Engine that always returns the same text.
pub struct FixedEngine {
    text: &'static str,
    confidence: f64,
}

impl FixedEngine {
    pub fn new(text: &'static str, confidence: f64) -> Arc<dyn OcrEngine> {
        Arc::new(Self { text, confidence })
    }
}

#[async_trait]
impl OcrEngine for FixedEngine {
    async fn run_ocr(&self, _file: Bytes, _file_type: &str) -> Result<OcrOutput, OcrError> {
        Ok(OcrOutput {
            text: self.text.to_owned(),
            confidence: self.confidence,
        })
    }
}

/// One multipart/form-data part.
pub struct Part<'a> {
    name: &'a str,
    filename: Option<&'a str>,
    content: &'a [u8],
}

impl<'a> Part<'a> {
    pub fn file(name: &'a str, filename: &'a str, content: &'a [u8]) -> Self {
        Self {
            name,
            filename: Some(filename),
            content,
        }
    }

    pub fn text(name: &'a str, value: &'a str) -> Self {
        Self {
            name,
            filename: None,
            content: value.as_bytes(),
        }
    }
}

/// `POST /ocr` with the given parts.
pub fn multipart(parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part.filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    part.name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name).as_bytes(),
            ),
        }
        body.extend_from_slice(part.content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/ocr")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}
