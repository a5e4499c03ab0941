//! Outbound HTTP for webhook delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

use super::WebhookPayload;

/// Why a single delivery attempt failed.  Every variant is retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The endpoint answered with a non-2xx status.
    #[error("endpoint returned HTTP {status}")]
    Status { status: u16 },

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    /// Anything else reqwest reports (TLS, redirect loop, bad URL, …).
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout
        } else if e.is_connect() {
            DeliveryError::Connection(e.to_string())
        } else {
            DeliveryError::Request(e.to_string())
        }
    }
}

#[async_trait]
pub trait WebhookTransport: Send + Sync + 'static {
    /// POST `payload` as JSON to `url`.  `Ok` carries the 2xx status code.
    async fn post(&self, url: &str, payload: &WebhookPayload) -> Result<u16, DeliveryError>;
}

/// [`WebhookTransport`] over a shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// `timeout` bounds the whole request.  `allow_insecure` disables TLS
    /// certificate verification, for endpoints with self-signed certificates.
    pub fn new(timeout: Duration, allow_insecure: bool) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("ocrq/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .danger_accept_invalid_certs(allow_insecure)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post(&self, url: &str, payload: &WebhookPayload) -> Result<u16, DeliveryError> {
        let response = self.client.post(url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(DeliveryError::Status {
                status: status.as_u16(),
            })
        }
    }
}
