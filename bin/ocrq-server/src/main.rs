//! ocrq-server – entry point.
//!
//! Startup order:
//! 1. Parse the command line and configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the SQLite database (tasks + durable queue) and run migrations.
//! 4. Start workers and webhook dispatchers (roles `worker` and `all`).
//! 5. Serve the HTTP API with graceful shutdown (roles `api` and `all`).
//! 6. Signal the background loops to stop and wait for them to drain.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use ocrq_core::api::OcrService;
use ocrq_core::broker::{Broker, SqliteBroker};
use ocrq_core::engine::{CommandEngine, OcrEngine};
use ocrq_core::payload::PayloadStore;
use ocrq_core::store::SqliteStore;
use ocrq_core::webhook::{DeliveryMetrics, Dispatcher, ReqwestTransport, WebhookTransport};
use ocrq_core::worker::Worker;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "ocrq-server")]
#[command(about = "Queued OCR processing with webhook delivery")]
#[command(version)]
struct Cli {
    /// Which parts of the service this process runs
    #[arg(long, value_enum, default_value_t = Role::All)]
    role: Role,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    /// HTTP submission and status API only
    Api,
    /// OCR workers and webhook dispatchers only
    Worker,
    /// Both, in one process
    All,
}

impl Role {
    fn serves_http(self) -> bool {
        matches!(self, Role::Api | Role::All)
    }

    fn runs_workers(self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = init_tracing(&cfg)?;
    info!(version = env!("CARGO_PKG_VERSION"), role = ?cli.role, "ocrq-server starting");

    // ── 3. Storage ─────────────────────────────────────────────────────────────
    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);
    info!(database_url = %cfg.database_url, "database ready");

    let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::new(store.pool().clone()));

    tokio::fs::create_dir_all(&cfg.payload_dir)
        .await
        .with_context(|| format!("failed to create payload directory {}", cfg.payload_dir))?;
    let payloads = PayloadStore::new(&cfg.payload_dir);

    let metrics = Arc::new(DeliveryMetrics::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    // ── 4. Workers and dispatchers ─────────────────────────────────────────────
    if cli.role.runs_workers() {
        let Some(engine_cmd) = cfg.engine_cmd.as_deref() else {
            bail!("OCRQ_ENGINE_CMD must be set to run workers");
        };
        let engine: Arc<dyn OcrEngine> = Arc::new(
            CommandEngine::from_command_line(engine_cmd).context("OCRQ_ENGINE_CMD is empty")?,
        );

        let dispatcher_cfg = cfg.dispatcher_config();
        dispatcher_cfg.policy.validate()?;
        let transport: Arc<dyn WebhookTransport> = Arc::new(ReqwestTransport::new(
            cfg.webhook_timeout(),
            cfg.allow_insecure_webhooks,
        )?);
        if cfg.allow_insecure_webhooks {
            warn!("TLS certificate verification is disabled for webhook delivery");
        }

        for _ in 0..cfg.workers {
            let worker = Worker::new(
                Arc::clone(&store),
                Arc::clone(&broker),
                payloads.clone(),
                Arc::clone(&engine),
                cfg.worker_config(),
            );
            background.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }
        for _ in 0..cfg.dispatchers {
            let dispatcher = Dispatcher::new(
                Arc::clone(&store),
                Arc::clone(&broker),
                Arc::clone(&transport),
                Arc::clone(&metrics),
                dispatcher_cfg.clone(),
            );
            background.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));
        }
        info!(
            workers = cfg.workers,
            dispatchers = cfg.dispatchers,
            engine = %engine_cmd,
            "background consumers started"
        );
    }

    // ── 5. HTTP server with graceful shutdown ──────────────────────────────────
    if cli.role.serves_http() {
        let service = OcrService::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            payloads.clone(),
            cfg.submission_policy(),
        );
        let state = Arc::new(AppState {
            config: Arc::new(cfg.clone()),
            service: Arc::new(service),
            metrics: Arc::clone(&metrics),
        });

        let app = routes::build(state);
        let addr: SocketAddr = cfg.bind_address.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    // ── 6. Drain background consumers ──────────────────────────────────────────
    // Each loop finishes the message in hand before it exits.
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "background consumer ended abnormally");
        }
    }

    info!("ocrq-server stopped");
    Ok(())
}

/// Console output (JSON with `OCRQ_LOG_JSON=true`) plus an optional
/// daily-rotated JSON file under `OCRQ_LOG_DIR`.  The returned guard must be
/// held until exit so buffered file output is flushed.
fn init_tracing(cfg: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
        Ok(f) => f,
        Err(e) => {
            eprintln!(
                "WARN: OCRQ_LOG='{}' is not a valid tracing filter ({}); \
                 falling back to 'info'",
                cfg.log_level, e
            );
            tracing_subscriber::EnvFilter::new("info")
        }
    };

    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);
    let console = if cfg.log_json {
        console.json().boxed()
    } else {
        console.boxed()
    };

    let (file_layer, guard) = match cfg.log_dir.as_deref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {dir}"))?;
            let appender = tracing_appender::rolling::daily(dir, "ocrq-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
