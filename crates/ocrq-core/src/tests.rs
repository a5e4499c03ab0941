//! End-to-end scenarios across submission, worker and dispatcher, with a
//! scripted engine and a scripted webhook endpoint.  Most run on an in-memory
//! SQLite store and the in-memory broker; the concurrency scenarios use a
//! file-backed database with the pooled store and the durable broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tracing_test::traced_test;

use crate::api::{OcrService, SubmissionPolicy, SubmitError, Upload};
use crate::broker::{self, Broker, Delivery, MemoryBroker, PROCESS_QUEUE, SqliteBroker, WEBHOOK_QUEUE};
use crate::engine::{OcrEngine, OcrOutput};
use crate::error::{CoreError, OcrError};
use crate::payload::PayloadStore;
use crate::store::{SqliteStore, TaskStore};
use crate::types::{OcrResult, TaskStatus};
use crate::webhook::{
    DeliveryError, DeliveryMetrics, DeliveryOutcome, Dispatcher, DispatcherConfig, RetryPolicy,
    WebhookPayload, WebhookTransport,
};
use crate::worker::{ProcessMessage, ProcessOutcome, Worker, WorkerConfig};

const HOOK: &str = "http://client.test/hook";

// ── Fakes ─────────────────────────────────────────────────────────────────────

enum Behaviour {
    Text(&'static str, f64),
    /// Answers `"hello"` after the given pause.
    Slow(Duration),
    Fail(OcrError),
    Hang,
    Panic,
}

struct FakeEngine {
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl FakeEngine {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for FakeEngine {
    async fn run_ocr(&self, file: Bytes, file_type: &str) -> Result<OcrOutput, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(!file.is_empty(), "engine must receive the stored upload");
        assert_eq!(file_type, "pdf");
        match &self.behaviour {
            Behaviour::Text(text, confidence) => Ok(OcrOutput {
                text: (*text).to_owned(),
                confidence: *confidence,
            }),
            Behaviour::Slow(pause) => {
                tokio::time::sleep(*pause).await;
                Ok(OcrOutput {
                    text: "hello".into(),
                    confidence: 0.95,
                })
            }
            Behaviour::Fail(e) => Err(e.clone()),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(OcrOutput {
                    text: "too late".into(),
                    confidence: 1.0,
                })
            }
            Behaviour::Panic => panic!("model weights missing"),
        }
    }
}

/// Answers from `script` in order, then 200 forever.
#[derive(Default)]
struct FakeEndpoint {
    script: Mutex<VecDeque<Result<u16, DeliveryError>>>,
    always_fail: bool,
    received: Mutex<Vec<(String, WebhookPayload)>>,
}

impl FakeEndpoint {
    fn scripted(script: Vec<Result<u16, DeliveryError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            always_fail: true,
            ..Default::default()
        })
    }

    fn received(&self) -> Vec<(String, WebhookPayload)> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTransport for FakeEndpoint {
    async fn post(&self, url: &str, payload: &WebhookPayload) -> Result<u16, DeliveryError> {
        self.received
            .lock()
            .unwrap()
            .push((url.to_owned(), payload.clone()));
        if self.always_fail {
            return Err(DeliveryError::Status { status: 500 });
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(200))
    }
}

/// A broker whose queue is unreachable.
struct UnavailableBroker;

#[async_trait]
impl Broker for UnavailableBroker {
    async fn enqueue(&self, _queue: &str, _body: String, _delay: Duration) -> Result<String, CoreError> {
        Err(CoreError::Io(std::io::Error::other("broker unavailable")))
    }

    async fn dequeue(
        &self,
        _queue: &str,
        _lease: Duration,
        _wait: Duration,
    ) -> Result<Option<Delivery>, CoreError> {
        Ok(None)
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<bool, CoreError> {
        Ok(false)
    }

    async fn release(&self, _delivery: &Delivery, _delay: Duration) -> Result<bool, CoreError> {
        Ok(false)
    }

    async fn depth(&self, _queue: &str) -> Result<u64, CoreError> {
        Ok(0)
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    store: Arc<SqliteStore>,
    broker: Arc<dyn Broker>,
    payloads: PayloadStore,
    service: OcrService<SqliteStore>,
    engine: Arc<FakeEngine>,
    endpoint: Arc<FakeEndpoint>,
    metrics: Arc<DeliveryMetrics>,
    _dir: TempDir,
}

impl Harness {
    async fn new(behaviour: Behaviour, endpoint: Arc<FakeEndpoint>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        Self::assemble(dir, store, Arc::new(MemoryBroker::new()), behaviour, endpoint)
    }

    /// Database file in the temp dir: pooled connections and the
    /// [`SqliteBroker`], as deployed.
    async fn durable(behaviour: Behaviour, endpoint: Arc<FakeEndpoint>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ocrq.db").display());
        let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
        let broker = SqliteBroker::new(store.pool().clone())
            .with_poll_interval(Duration::from_millis(20));
        Self::assemble(dir, store, Arc::new(broker), behaviour, endpoint)
    }

    fn assemble(
        dir: TempDir,
        store: Arc<SqliteStore>,
        broker: Arc<dyn Broker>,
        behaviour: Behaviour,
        endpoint: Arc<FakeEndpoint>,
    ) -> Self {
        let payloads = PayloadStore::new(dir.path());
        let service = OcrService::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            payloads.clone(),
            SubmissionPolicy::default(),
        );
        Self {
            store,
            broker,
            payloads,
            service,
            engine: FakeEngine::new(behaviour),
            endpoint,
            metrics: Arc::new(DeliveryMetrics::default()),
            _dir: dir,
        }
    }

    fn worker(&self) -> Worker<SqliteStore> {
        self.worker_with(WorkerConfig {
            processing_timeout: Duration::from_secs(5),
            lease_grace: Duration::from_secs(1),
            dequeue_wait: Duration::from_millis(100),
            ..Default::default()
        })
    }

    fn worker_with(&self, config: WorkerConfig) -> Worker<SqliteStore> {
        Worker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            self.payloads.clone(),
            self.engine.clone(),
            config,
        )
    }

    fn dispatcher(&self, max_attempts: u32) -> Dispatcher<SqliteStore> {
        Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            self.endpoint.clone(),
            Arc::clone(&self.metrics),
            DispatcherConfig {
                policy: RetryPolicy {
                    max_attempts,
                    base_delay: Duration::from_millis(10),
                    backoff_factor: 2.0,
                    max_delay: Duration::from_secs(1),
                },
                lease: Duration::from_secs(5),
                dequeue_wait: Duration::from_secs(2),
            },
        )
    }

    async fn submit(&self, filename: &str, webhook_url: Option<&str>) -> Result<String, SubmitError> {
        let submitted = self
            .service
            .submit(Upload {
                filename: filename.to_owned(),
                bytes: Bytes::from_static(b"%PDF-1.7 fake document"),
                guid: "client-guid-1".to_owned(),
                webhook_url: webhook_url.map(str::to_owned),
                correlation_id: Some("corr-1".to_owned()),
            })
            .await?;
        assert_eq!(submitted.status, "queued");
        Ok(submitted.task_id)
    }

    async fn depth(&self, queue: &str) -> u64 {
        self.broker.depth(queue).await.unwrap()
    }
}

fn success(text: &'static str, confidence: f64) -> Behaviour {
    Behaviour::Text(text, confidence)
}

// ── Happy path ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pdf_is_recognised_and_webhook_text_decodes() {
    let h = Harness::new(success("hello", 0.95), FakeEndpoint::scripted(vec![])).await;
    let task_id = h.submit("scan.pdf", Some(HOOK)).await.unwrap();

    let queued = h.service.status(&task_id).await.unwrap();
    assert_eq!(queued.status, TaskStatus::Queued);
    assert!(queued.result.is_none());

    let outcome = h.worker().process_next().await.unwrap();
    assert_eq!(
        outcome,
        Some(ProcessOutcome::Completed {
            task_id: task_id.clone(),
            status: TaskStatus::Success,
        })
    );
    assert_eq!(h.depth(PROCESS_QUEUE).await, 0);

    let view = h.service.status(&task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Success);
    let result = view.result.expect("terminal task carries a result");
    assert_eq!(result.confidence, 0.95);
    assert_eq!(result.decoded_text().unwrap(), b"hello");

    let delivered = h.dispatcher(3).process_next().await.unwrap();
    assert!(matches!(delivered, Some(DeliveryOutcome::Delivered { attempt: 1, .. })));
    let received = h.endpoint.received();
    assert_eq!(received.len(), 1);
    let (url, payload) = &received[0];
    assert_eq!(url, HOOK);
    assert_eq!(payload.task_id, task_id);
    assert_eq!(payload.guid, "client-guid-1");
    assert_eq!(payload.status, TaskStatus::Success);
    assert_eq!(
        OcrResult {
            text: payload.text.clone(),
            confidence: payload.confidence,
            error: payload.error.clone(),
        }
        .decoded_text()
        .unwrap(),
        b"hello"
    );
    assert_eq!(h.metrics.snapshot().delivered, 1);

    // Payload is dropped once the task is terminal.
    let task = h.store.get_task(&task_id).await.unwrap().unwrap();
    assert!(task.payload_ref.is_none());
    assert!(task.webhook_enqueued);
}

#[tokio::test]
async fn task_without_webhook_completes_silently() {
    let h = Harness::new(success("x", 0.5), FakeEndpoint::scripted(vec![])).await;
    let task_id = h.submit("scan.pdf", None).await.unwrap();

    h.worker().process_next().await.unwrap();
    assert_eq!(h.service.status(&task_id).await.unwrap().status, TaskStatus::Success);
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 0);
}

// ── Failures during processing ────────────────────────────────────────────────

#[tokio::test]
async fn engine_error_fails_task_with_one_webhook() {
    let h = Harness::new(
        Behaviour::Fail(OcrError::Engine("model crashed".into())),
        FakeEndpoint::scripted(vec![]),
    )
    .await;
    let task_id = h.submit("scan.pdf", Some(HOOK)).await.unwrap();

    let outcome = h.worker().process_next().await.unwrap();
    assert!(matches!(
        outcome,
        Some(ProcessOutcome::Completed { status: TaskStatus::Failure, .. })
    ));
    let result = h.service.status(&task_id).await.unwrap().result.unwrap();
    assert!(result.error.contains("model crashed"), "{}", result.error);
    assert!(result.text.is_empty());

    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 1);
    h.dispatcher(3).process_next().await.unwrap();
    let received = h.endpoint.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1.status, TaskStatus::Failure);
    assert!(!received[0].1.error.is_empty());
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 0);
}

#[tokio::test]
async fn engine_timeout_fails_task() {
    let h = Harness::new(Behaviour::Hang, FakeEndpoint::scripted(vec![])).await;
    let task_id = h.submit("scan.pdf", None).await.unwrap();

    let worker = h.worker_with(WorkerConfig {
        processing_timeout: Duration::from_millis(50),
        lease_grace: Duration::from_secs(1),
        dequeue_wait: Duration::from_millis(100),
        ..Default::default()
    });
    let outcome = tokio::time::timeout(Duration::from_secs(5), worker.process_next())
        .await
        .expect("timeout must bound the engine call")
        .unwrap();
    assert!(matches!(
        outcome,
        Some(ProcessOutcome::Completed { status: TaskStatus::Failure, .. })
    ));
    let result = h.service.status(&task_id).await.unwrap().result.unwrap();
    assert!(result.error.contains("timed out"), "{}", result.error);
}

#[tokio::test]
async fn engine_panic_fails_task_without_killing_worker() {
    let h = Harness::new(Behaviour::Panic, FakeEndpoint::scripted(vec![])).await;
    let first = h.submit("a.pdf", None).await.unwrap();
    let second = h.submit("b.pdf", None).await.unwrap();

    let worker = h.worker();
    worker.process_next().await.unwrap();
    worker.process_next().await.unwrap();

    for task_id in [first, second] {
        let view = h.service.status(&task_id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failure);
        assert!(view.result.unwrap().error.contains("model weights missing"));
    }
}

// ── Redelivery and recovery ───────────────────────────────────────────────────

#[tokio::test]
async fn redelivered_message_for_terminal_task_is_a_noop() {
    let h = Harness::new(success("hello", 0.9), FakeEndpoint::scripted(vec![])).await;
    let task_id = h.submit("scan.pdf", Some(HOOK)).await.unwrap();
    let worker = h.worker();
    worker.process_next().await.unwrap();
    let before = h.store.get_task(&task_id).await.unwrap().unwrap();

    let duplicate = ProcessMessage {
        task_id: task_id.clone(),
        correlation_id: None,
    };
    broker::publish(h.broker.as_ref(), PROCESS_QUEUE, &duplicate, Duration::ZERO)
        .await
        .unwrap();
    let outcome = worker.process_next().await.unwrap();

    assert_eq!(outcome, Some(ProcessOutcome::Skipped { task_id: task_id.clone() }));
    assert_eq!(h.engine.calls(), 1);
    assert_eq!(h.store.get_task(&task_id).await.unwrap().unwrap(), before);
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 1, "no second webhook");
    assert_eq!(h.depth(PROCESS_QUEUE).await, 0);
}

#[tokio::test]
async fn redelivery_repairs_missing_webhook_enqueue() {
    let h = Harness::new(success("hello", 0.9), FakeEndpoint::scripted(vec![])).await;
    let task_id = h.submit("scan.pdf", Some(HOOK)).await.unwrap();

    // A worker that crashed between the terminal write and the webhook
    // enqueue, leaving its process message leased.
    h.broker
        .dequeue(PROCESS_QUEUE, Duration::from_millis(20), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    h.store
        .claim_task(&task_id, "crashed", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(
        h.store
            .complete_task(&task_id, "crashed", TaskStatus::Success, &OcrResult::success("hello", 0.9))
            .await
            .unwrap()
    );

    let outcome = h.worker().process_next().await.unwrap();
    assert_eq!(outcome, Some(ProcessOutcome::Skipped { task_id: task_id.clone() }));
    assert_eq!(h.engine.calls(), 0);
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 1);
    let task = h.store.get_task(&task_id).await.unwrap().unwrap();
    assert!(task.webhook_enqueued);
    assert!(task.payload_ref.is_none());
}

#[tokio::test]
async fn live_claim_defers_the_message() {
    let h = Harness::new(success("hello", 0.9), FakeEndpoint::scripted(vec![])).await;
    let task_id = h.submit("scan.pdf", None).await.unwrap();
    h.store
        .claim_task(&task_id, "other-worker", Duration::from_secs(60))
        .await
        .unwrap();

    let outcome = h.worker().process_next().await.unwrap();
    assert_eq!(outcome, Some(ProcessOutcome::Deferred { task_id: task_id.clone() }));
    assert_eq!(h.engine.calls(), 0);
    assert_eq!(h.depth(PROCESS_QUEUE).await, 1, "message kept for later");
    assert_eq!(
        h.service.status(&task_id).await.unwrap().status,
        TaskStatus::Processing
    );
}

#[tokio::test]
async fn expired_claim_is_taken_over() {
    let h = Harness::new(success("recovered", 0.8), FakeEndpoint::scripted(vec![])).await;
    let task_id = h.submit("scan.pdf", None).await.unwrap();
    h.store
        .claim_task(&task_id, "crashed", Duration::from_millis(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = h.worker().process_next().await.unwrap();
    assert_eq!(
        outcome,
        Some(ProcessOutcome::Completed {
            task_id: task_id.clone(),
            status: TaskStatus::Success,
        })
    );
    let task = h.store.get_task(&task_id).await.unwrap().unwrap();
    assert_ne!(task.claimed_by.as_deref(), Some("crashed"));
}

#[tokio::test]
async fn undecodable_and_orphan_messages_are_dropped() {
    let h = Harness::new(success("x", 1.0), FakeEndpoint::scripted(vec![])).await;
    h.broker
        .enqueue(PROCESS_QUEUE, "not json".into(), Duration::ZERO)
        .await
        .unwrap();
    let worker = h.worker();
    assert!(matches!(
        worker.process_next().await.unwrap(),
        Some(ProcessOutcome::Discarded { .. })
    ));

    let orphan = ProcessMessage {
        task_id: "no-such-task".into(),
        correlation_id: None,
    };
    broker::publish(h.broker.as_ref(), PROCESS_QUEUE, &orphan, Duration::ZERO)
        .await
        .unwrap();
    assert!(matches!(
        worker.process_next().await.unwrap(),
        Some(ProcessOutcome::Skipped { .. })
    ));
    assert_eq!(h.depth(PROCESS_QUEUE).await, 0);
    assert_eq!(worker.process_next().await.unwrap(), None);
}

// ── Concurrent consumers on the durable backend ───────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_messages_race_to_a_single_completion() {
    let h = Harness::durable(
        Behaviour::Slow(Duration::from_millis(300)),
        FakeEndpoint::scripted(vec![]),
    )
    .await;
    let task_id = h.submit("scan.pdf", Some(HOOK)).await.unwrap();
    // At-least-once delivery: a second copy of the process message.
    let duplicate = ProcessMessage {
        task_id: task_id.clone(),
        correlation_id: None,
    };
    broker::publish(h.broker.as_ref(), PROCESS_QUEUE, &duplicate, Duration::ZERO)
        .await
        .unwrap();

    let (first, second) = (h.worker(), h.worker());
    let (a, b) = tokio::join!(first.process_next(), second.process_next());
    let outcomes = [a.unwrap(), b.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, Some(ProcessOutcome::Completed { status: TaskStatus::Success, .. })))
        .count();
    assert_eq!(completed, 1, "{outcomes:?}");
    assert!(
        outcomes
            .iter()
            .any(|o| matches!(o, Some(ProcessOutcome::Deferred { .. }))),
        "{outcomes:?}"
    );
    assert_eq!(h.engine.calls(), 1);
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 1);
    assert_eq!(h.depth(PROCESS_QUEUE).await, 1, "deferred copy waits for the claim");

    let delivered = h.dispatcher(3).process_next().await.unwrap();
    assert!(matches!(delivered, Some(DeliveryOutcome::Delivered { attempt: 1, .. })));
    assert_eq!(h.endpoint.received().len(), 1);
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 0);
    assert_eq!(h.service.status(&task_id).await.unwrap().status, TaskStatus::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn durable_broker_retries_failed_webhooks() {
    let h = Harness::durable(
        success("hello", 0.95),
        FakeEndpoint::scripted(vec![Err(DeliveryError::Status { status: 503 })]),
    )
    .await;
    h.submit("scan.pdf", Some(HOOK)).await.unwrap();
    h.worker().process_next().await.unwrap();

    let dispatcher = h.dispatcher(3);
    let first = dispatcher.process_next().await.unwrap();
    assert!(matches!(first, Some(DeliveryOutcome::RetryScheduled { attempt: 1, .. })));
    let second = dispatcher.process_next().await.unwrap();
    assert!(matches!(second, Some(DeliveryOutcome::Delivered { attempt: 2, .. })));
    assert_eq!(h.endpoint.received().len(), 2);
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 0);
}

// ── Webhook retry ─────────────────────────────────────────────────────────────

#[tokio::test]
#[traced_test]
async fn failing_endpoint_exhausts_retries_without_touching_task() {
    let h = Harness::new(success("hello", 0.95), FakeEndpoint::failing()).await;
    let task_id = h.submit("scan.pdf", Some(HOOK)).await.unwrap();
    h.worker().process_next().await.unwrap();

    let dispatcher = h.dispatcher(3);
    let mut delays = Vec::new();
    let exhausted = loop {
        match dispatcher.process_next().await.unwrap() {
            Some(DeliveryOutcome::RetryScheduled { delay, .. }) => delays.push(delay),
            Some(other) => break other,
            None => panic!("retry was not re-enqueued"),
        }
    };

    assert_eq!(
        exhausted,
        DeliveryOutcome::Exhausted {
            task_id: task_id.clone(),
            attempts: 3,
        }
    );
    assert_eq!(delays, vec![Duration::from_millis(10), Duration::from_millis(20)]);
    assert_eq!(h.endpoint.received().len(), 3);
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 0);

    let view = h.service.status(&task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Success);
    assert_eq!(view.result.unwrap().confidence, 0.95);

    let stats = h.metrics.snapshot();
    assert_eq!((stats.delivered, stats.retried, stats.permanently_failed), (0, 2, 1));
    assert!(logs_contain("webhook delivery permanently failed"));
}

#[tokio::test]
async fn retry_stops_at_first_success() {
    let h = Harness::new(
        success("hello", 0.95),
        FakeEndpoint::scripted(vec![Err(DeliveryError::Status { status: 500 }), Ok(204)]),
    )
    .await;
    h.submit("scan.pdf", Some(HOOK)).await.unwrap();
    h.worker().process_next().await.unwrap();

    let dispatcher = h.dispatcher(5);
    assert!(matches!(
        dispatcher.process_next().await.unwrap(),
        Some(DeliveryOutcome::RetryScheduled { attempt: 1, .. })
    ));
    assert!(matches!(
        dispatcher.process_next().await.unwrap(),
        Some(DeliveryOutcome::Delivered { attempt: 2, .. })
    ));
    assert_eq!(h.endpoint.received().len(), 2);
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 0);
    assert_eq!(h.metrics.snapshot().delivered, 1);
}

// ── Submission and cancellation ───────────────────────────────────────────────

#[tokio::test]
async fn unsupported_format_creates_no_task() {
    let h = Harness::new(success("x", 1.0), FakeEndpoint::scripted(vec![])).await;
    let err = h.submit("setup.exe", Some(HOOK)).await.unwrap_err();
    assert!(matches!(err, SubmitError::UnsupportedFormat { .. }));

    let bad_hook = h.submit("scan.pdf", Some("ftp://client.test/x")).await.unwrap_err();
    assert!(matches!(bad_hook, SubmitError::Validation(_)));

    assert!(h.store.list_tasks(None, 10).await.unwrap().is_empty());
    assert_eq!(h.depth(PROCESS_QUEUE).await, 0);
    assert_eq!(std::fs::read_dir(h.payloads.root()).unwrap().count(), 0);
}

#[tokio::test]
async fn failed_enqueue_leaves_no_task_or_payload() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let h = Harness::assemble(
        dir,
        store,
        Arc::new(UnavailableBroker),
        success("hello", 0.95),
        FakeEndpoint::scripted(vec![]),
    );

    let err = h.submit("scan.pdf", Some(HOOK)).await.unwrap_err();
    assert!(matches!(err, SubmitError::Core(CoreError::Io(_))), "{err:?}");
    assert!(h.store.list_tasks(None, 10).await.unwrap().is_empty());
    let leftovers = std::fs::read_dir(h.payloads.root()).unwrap().count();
    assert_eq!(leftovers, 0, "payload must be removed");
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let h = Harness::new(success("x", 1.0), FakeEndpoint::scripted(vec![])).await;
    assert!(matches!(
        h.service.status("missing").await,
        Err(CoreError::TaskNotFound { .. })
    ));
    assert!(matches!(
        h.service.cancel("missing", None).await,
        Err(CoreError::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn cancel_before_claim_fails_task_and_notifies() {
    let h = Harness::new(success("x", 1.0), FakeEndpoint::scripted(vec![])).await;
    let task_id = h.submit("scan.pdf", Some(HOOK)).await.unwrap();

    let view = h.service.cancel(&task_id, None).await.unwrap();
    assert_eq!(view.status, TaskStatus::Failure);
    assert_eq!(view.result.unwrap().error, "cancelled");
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 1);

    // The pending process message is now a no-op.
    assert_eq!(
        h.worker().process_next().await.unwrap(),
        Some(ProcessOutcome::Skipped { task_id: task_id.clone() })
    );
    assert_eq!(h.engine.calls(), 0);
    assert_eq!(h.depth(WEBHOOK_QUEUE).await, 1);

    assert!(matches!(
        h.service.cancel(&task_id, None).await,
        Err(CoreError::InvalidTransition { from: TaskStatus::Failure, .. })
    ));
}

#[tokio::test]
async fn cancel_after_claim_is_rejected() {
    let h = Harness::new(success("x", 1.0), FakeEndpoint::scripted(vec![])).await;
    let task_id = h.submit("scan.pdf", None).await.unwrap();
    h.store
        .claim_task(&task_id, "busy", Duration::from_secs(60))
        .await
        .unwrap();

    assert!(matches!(
        h.service.cancel(&task_id, None).await,
        Err(CoreError::InvalidTransition { from: TaskStatus::Processing, .. })
    ));
    assert_eq!(
        h.service.status(&task_id).await.unwrap().status,
        TaskStatus::Processing
    );
}

#[tokio::test]
async fn listing_is_newest_first_and_filterable() {
    let h = Harness::new(success("x", 1.0), FakeEndpoint::scripted(vec![])).await;
    let first = h.submit("a.pdf", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.submit("b.pdf", None).await.unwrap();
    h.service.cancel(&first, None).await.unwrap();

    let all = h.service.list(None, 10).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, vec![second.as_str(), first.as_str()]);

    let queued = h.service.list(Some(TaskStatus::Queued), 10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].task_id, second);

    let depths = h.service.queue_depths().await.unwrap();
    assert_eq!(depths.process, 2);
}
