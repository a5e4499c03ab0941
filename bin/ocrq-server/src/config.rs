//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use ocrq_core::api::SubmissionPolicy;
use ocrq_core::webhook::{DispatcherConfig, RetryPolicy};
use ocrq_core::worker::WorkerConfig;

/// Runtime configuration for ocrq-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.  Only the worker role needs
/// `OCRQ_ENGINE_CMD`.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// SQLite URL holding both the task table and the queue
    /// (default: `"sqlite://ocrq.db"`).
    pub database_url: String,

    /// Directory uploads are stored in until their task finishes.
    pub payload_dir: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// When set, logs are also written to a daily-rotated file in this directory.
    pub log_dir: Option<String>,

    /// Accepted upload extensions, lower-case, without the dot.
    pub allowed_formats: Vec<String>,

    pub max_upload_size_mb: usize,

    /// Concurrent OCR consumers started by the worker role.
    pub workers: usize,

    /// Concurrent webhook consumers started by the worker role.
    pub dispatchers: usize,

    pub processing_timeout_secs: u64,

    pub webhook_timeout_secs: u64,
    pub webhook_max_attempts: u32,
    pub webhook_base_delay_ms: u64,
    pub webhook_backoff_factor: f64,
    pub webhook_max_delay_ms: u64,

    /// Accept invalid TLS certificates on webhook endpoints.
    pub allow_insecure_webhooks: bool,

    /// External OCR command line, e.g. `"/usr/local/bin/ocr-cli --lang fas"`.
    pub engine_cmd: Option<String>,

    /// Comma-separated CORS origins; unset means any origin.
    pub cors_allowed_origins: Option<String>,

    /// Serve the OpenAPI document at `/api-docs/openapi.json`.
    pub enable_docs: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());
        let log_level = lookup("OCRQ_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| "info".to_owned());

        Self {
            bind_address: env_or("OCRQ_BIND", "0.0.0.0:8000"),
            database_url: env_or("OCRQ_DATABASE_URL", "sqlite://ocrq.db"),
            payload_dir: env_or("OCRQ_PAYLOAD_DIR", "./payloads"),
            log_level,
            log_json: parse_bool(lookup("OCRQ_LOG_JSON"), false),
            log_dir: non_empty(lookup("OCRQ_LOG_DIR")),
            allowed_formats: parse_list(&env_or(
                "OCRQ_ALLOWED_FORMATS",
                "pdf,png,jpg,jpeg,tif,tiff,bmp,webp",
            )),
            max_upload_size_mb: parse_env(lookup("OCRQ_MAX_UPLOAD_SIZE_MB"), 50),
            workers: parse_env(lookup("OCRQ_WORKERS"), 2),
            dispatchers: parse_env(lookup("OCRQ_DISPATCHERS"), 1),
            processing_timeout_secs: parse_env(lookup("OCRQ_PROCESSING_TIMEOUT_SECS"), 300),
            webhook_timeout_secs: parse_env(lookup("OCRQ_WEBHOOK_TIMEOUT_SECS"), 10),
            webhook_max_attempts: parse_env(lookup("OCRQ_WEBHOOK_MAX_ATTEMPTS"), 5),
            webhook_base_delay_ms: parse_env(lookup("OCRQ_WEBHOOK_BASE_DELAY_MS"), 5_000),
            webhook_backoff_factor: parse_env(lookup("OCRQ_WEBHOOK_BACKOFF_FACTOR"), 2.0),
            webhook_max_delay_ms: parse_env(lookup("OCRQ_WEBHOOK_MAX_DELAY_MS"), 600_000),
            allow_insecure_webhooks: parse_bool(lookup("OCRQ_ALLOW_INSECURE_WEBHOOKS"), false),
            engine_cmd: non_empty(lookup("OCRQ_ENGINE_CMD")),
            cors_allowed_origins: non_empty(lookup("OCRQ_CORS_ORIGINS")),
            enable_docs: parse_bool(lookup("OCRQ_ENABLE_DOCS"), true),
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn submission_policy(&self) -> SubmissionPolicy {
        SubmissionPolicy {
            allowed_formats: self.allowed_formats.clone(),
            max_upload_bytes: self.max_upload_bytes(),
        }
    }

    /// A fresh config per consumer; each gets its own worker id.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            processing_timeout: Duration::from_secs(self.processing_timeout_secs),
            ..WorkerConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.webhook_max_attempts,
            base_delay: Duration::from_millis(self.webhook_base_delay_ms),
            backoff_factor: self.webhook_backoff_factor,
            max_delay: Duration::from_millis(self.webhook_max_delay_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            policy: self.retry_policy(),
            lease: self.webhook_timeout() + Duration::from_secs(30),
            ..DispatcherConfig::default()
        }
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse_env<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `"PDF, .png,,jpg"` → `["pdf", "png", "jpg"]`.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
