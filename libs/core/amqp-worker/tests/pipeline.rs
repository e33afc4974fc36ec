//! End-to-end tests of the consume pipeline on the in-memory broker.

use amqp_worker::broker::{Acker, Delivery, Settlement};
use amqp_worker::{
    async_trait, AckPolicy, BrokerError, Channel, Disposition, HandlerError, IncomingMessage,
    JsonSchema, MemoryChannel, QueueOptions, Request, Response, Settings, StatusCode, Worker,
    WorkerError, WorkerHandle, WorkerState,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use validator::Validate;

const WAIT: Duration = Duration::from_secs(5);

fn settings() -> Settings {
    Settings::new("svc", vec!["orders".into()], "amqp://localhost").unwrap()
}

async fn bind(worker: impl Worker + 'static, channel: &MemoryChannel) -> WorkerHandle {
    let handle = WorkerHandle::new(Arc::new(worker), &settings());
    handle.consume(Arc::new(channel.clone())).await.unwrap();
    handle
}

async fn settlements(channel: &MemoryChannel, count: usize) -> Vec<Settlement> {
    tokio::time::timeout(WAIT, channel.wait_for_settlements(count))
        .await
        .expect("settlements not recorded in time")
}

fn request(correlation_id: &str) -> IncomingMessage {
    IncomingMessage::new(b"{}".to_vec())
        .with_correlation_id(correlation_id)
        .with_reply_to("replies")
}

/// Replies with the correlation id it saw, after meeting a second invocation.
struct Rendezvous {
    barrier: Barrier,
}

#[async_trait]
impl Worker for Rendezvous {
    fn basename(&self) -> &str {
        "orders"
    }

    async fn process_request(&self, request: Request<'_>) -> Result<Option<Response>, HandlerError> {
        self.barrier.wait().await;
        let seen = request.correlation_id().unwrap_or_default().to_string();
        Ok(Some(Response::ok(json!({ "seen": seen }))?))
    }
}

#[tokio::test]
async fn test_overlapping_invocations_keep_their_own_context() {
    let channel = MemoryChannel::new();
    let _handle = bind(Rendezvous { barrier: Barrier::new(2) }, &channel).await;

    channel.deliver("svc:orders", request("c-1")).unwrap();
    channel.deliver("svc:orders", request("c-2")).unwrap();

    // both handlers are parked on the barrier at the same time, so they overlap
    let published = tokio::time::timeout(WAIT, channel.wait_for_published(2))
        .await
        .expect("handlers did not run concurrently");

    for reply in &published {
        let body: Value = serde_json::from_slice(&reply.message.body).unwrap();
        let correlation_id = reply.message.correlation_id.clone().unwrap();
        assert_eq!(body["seen"], correlation_id.as_str());
        assert_eq!(reply.routing_key, "replies");
    }
    let mut ids: Vec<_> = published
        .iter()
        .filter_map(|p| p.message.correlation_id.clone())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["c-1", "c-2"]);
}

/// Records the highest number of overlapping handlers.
struct Gauge {
    limit: Option<usize>,
    current: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for Gauge {
    fn basename(&self) -> &str {
        "orders"
    }

    fn max_concurrency(&self) -> Option<usize> {
        self.limit
    }

    async fn process_request(&self, _request: Request<'_>) -> Result<Option<Response>, HandlerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[tokio::test]
async fn test_max_concurrency_one_is_serial() {
    let channel = MemoryChannel::new();
    let peak = Arc::new(AtomicUsize::new(0));
    let worker = Gauge {
        limit: Some(1),
        current: AtomicUsize::new(0),
        peak: Arc::clone(&peak),
    };
    let _handle = bind(worker, &channel).await;

    for _ in 0..4 {
        channel.deliver("svc:orders", IncomingMessage::new(b"{}".to_vec())).unwrap();
    }
    let settled = settlements(&channel, 4).await;

    assert!(settled.iter().all(|s| s.disposition == Disposition::Acked));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    // serial handling settles in delivery order
    let tags: Vec<u64> = settled.iter().map(|s| s.delivery_tag).collect();
    let mut sorted = tags.clone();
    sorted.sort();
    assert_eq!(tags, sorted);
}

#[tokio::test]
async fn test_handlers_overlap_by_default() {
    let channel = MemoryChannel::new();
    let peak = Arc::new(AtomicUsize::new(0));
    let worker = Gauge {
        limit: None,
        current: AtomicUsize::new(0),
        peak: Arc::clone(&peak),
    };
    let _handle = bind(worker, &channel).await;

    for _ in 0..4 {
        channel.deliver("svc:orders", IncomingMessage::new(b"{}".to_vec())).unwrap();
    }
    settlements(&channel, 4).await;
    assert!(peak.load(Ordering::SeqCst) > 1);
}

/// Fails every first delivery; succeeds on redelivery unless `always_fail`.
struct Flaky {
    policy: AckPolicy,
    always_fail: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for Flaky {
    fn basename(&self) -> &str {
        "orders"
    }

    fn ack_policy(&self) -> AckPolicy {
        self.policy
    }

    async fn process_request(&self, request: Request<'_>) -> Result<Option<Response>, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail || !request.is_redelivered() {
            return Err(eyre::eyre!("downstream unavailable").into());
        }
        Ok(None)
    }
}

#[tokio::test]
async fn test_requeued_message_is_redelivered_and_acked() {
    let channel = MemoryChannel::new().with_redelivery();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Flaky {
        policy: AckPolicy::requeue(),
        always_fail: false,
        calls: Arc::clone(&calls),
    };
    let _handle = bind(worker, &channel).await;

    channel.deliver("svc:orders", IncomingMessage::new(b"{}".to_vec())).unwrap();
    let settled = settlements(&channel, 2).await;

    let dispositions: Vec<_> = settled.iter().map(|s| s.disposition).collect();
    assert_eq!(dispositions, vec![Disposition::Requeued, Disposition::Acked]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reject_on_redelivered_stops_the_loop() {
    let channel = MemoryChannel::new().with_redelivery();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Flaky {
        policy: AckPolicy::requeue().with_reject_on_redelivered(true),
        always_fail: true,
        calls: Arc::clone(&calls),
    };
    let _handle = bind(worker, &channel).await;

    channel.deliver("svc:orders", IncomingMessage::new(b"{}".to_vec())).unwrap();
    let settled = settlements(&channel, 2).await;

    let dispositions: Vec<_> = settled.iter().map(|s| s.disposition).collect();
    assert_eq!(dispositions, vec![Disposition::Requeued, Disposition::Rejected]);

    // nothing is redelivered after the rejection
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.settlements().len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failure_without_requeue_is_rejected() {
    let channel = MemoryChannel::new().with_redelivery();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Flaky {
        policy: AckPolicy::default(),
        always_fail: true,
        calls: Arc::clone(&calls),
    };
    let _handle = bind(worker, &channel).await;

    channel.deliver("svc:orders", IncomingMessage::new(b"{}".to_vec())).unwrap();
    let settled = settlements(&channel, 1).await;
    assert_eq!(settled[0].disposition, Disposition::Rejected);
}

#[tokio::test]
async fn test_processed_message_is_acked_without_handler() {
    let channel = MemoryChannel::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Flaky {
        policy: AckPolicy::requeue().with_ignore_processed(true),
        always_fail: true,
        calls: Arc::clone(&calls),
    };
    let _handle = bind(worker, &channel).await;

    channel
        .deliver("svc:orders", IncomingMessage::new(b"{}".to_vec()).processed())
        .unwrap();
    let settled = settlements(&channel, 1).await;

    assert_eq!(settled[0].disposition, Disposition::Acked);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[derive(Debug, Deserialize, Validate)]
struct NewOrder {
    #[validate(length(min = 1))]
    sku: String,
    #[validate(range(min = 1))]
    quantity: u32,
}

/// Validates the body and answers 201 or 400.
struct Orders;

#[async_trait]
impl Worker for Orders {
    fn basename(&self) -> &str {
        "orders"
    }

    async fn process_request(&self, request: Request<'_>) -> Result<Option<Response>, HandlerError> {
        let mut serializer = request.serializer(JsonSchema::<NewOrder>::new());
        if let Err(err) = serializer.ensure_valid() {
            let data = json!({ "errors": err.errors() });
            return Ok(Some(Response::from_error(
                StatusCode::BAD_REQUEST,
                &err,
                None,
                Some(data),
                false,
            )?));
        }
        let order = serializer.into_validated_data()?.ok_or("validated data missing")?;
        let data = json!({ "sku": order.sku, "quantity": order.quantity });
        Ok(Some(Response::new(StatusCode::CREATED, None, Some(data))?))
    }
}

#[tokio::test]
async fn test_invalid_payload_gets_bad_request_reply() {
    let channel = MemoryChannel::new();
    let _handle = bind(Orders, &channel).await;

    let message = IncomingMessage::new(br#"{"sku":"","quantity":0}"#.to_vec())
        .with_correlation_id("c-bad")
        .with_reply_to("replies");
    channel.deliver("svc:orders", message).unwrap();

    let published = tokio::time::timeout(WAIT, channel.wait_for_published(1)).await.unwrap();
    let reply = &published[0].message;
    assert_eq!(reply.headers["status"], 400);
    assert_eq!(reply.correlation_id.as_deref(), Some("c-bad"));

    let body: Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(body["invalid"], "Bad Request");
    assert_eq!(body["errors"]["sku"][0]["code"], "length");

    // a validation failure is a handled outcome, the delivery is acked
    assert_eq!(settlements(&channel, 1).await[0].disposition, Disposition::Acked);
}

#[tokio::test]
async fn test_valid_payload_gets_created_reply() {
    let channel = MemoryChannel::new();
    let _handle = bind(Orders, &channel).await;

    let message = IncomingMessage::new(br#"{"sku":"A-1","quantity":3}"#.to_vec())
        .with_correlation_id("c-ok")
        .with_reply_to("replies");
    channel.deliver("svc:orders", message).unwrap();

    let published = tokio::time::timeout(WAIT, channel.wait_for_published(1)).await.unwrap();
    let reply = &published[0].message;
    assert_eq!(reply.headers["status"], 201);
    assert_eq!(reply.content_type.as_deref(), Some("application/json"));
    let body: Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(body, json!({"sku": "A-1", "quantity": 3}));
}

/// Acker that always succeeds and remembers nothing.
struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_publish_failure_is_reported_after_ack() {
    let channel = MemoryChannel::new();
    let handle = bind(Orders, &channel).await;
    channel.close();

    let message = IncomingMessage::new(br#"{"sku":"A-1","quantity":1}"#.to_vec())
        .with_correlation_id("c-1")
        .with_reply_to("replies");
    let err = handle
        .handle_delivery(Delivery::new(message, Box::new(NoopAcker)))
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::Publish { ref routing_key, .. } if routing_key == "replies"));
    assert!(channel.published().is_empty());
}

#[tokio::test]
async fn test_consume_twice_is_illegal() {
    let channel = MemoryChannel::new();
    let handle = bind(Orders, &channel).await;
    assert_eq!(handle.state(), WorkerState::Consuming);

    let err = handle.consume(Arc::new(channel.clone())).await.unwrap_err();
    assert!(matches!(err, WorkerError::IllegalState(_)));
    assert_eq!(handle.state(), WorkerState::Consuming);
}

/// Declares its queue with caller-chosen options.
struct Declaring(QueueOptions);

#[async_trait]
impl Worker for Declaring {
    fn basename(&self) -> &str {
        "orders"
    }

    fn queue_options(&self) -> QueueOptions {
        self.0.clone()
    }

    async fn process_request(&self, _request: Request<'_>) -> Result<Option<Response>, HandlerError> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_queue_is_declared_with_static_policy() {
    let channel = MemoryChannel::new();
    let options = QueueOptions::durable().with_argument("x-max-priority", 10);
    let handle = bind(Declaring(options.clone()), &channel).await;

    assert_eq!(handle.queue_name(), "svc:orders");
    assert_eq!(channel.queue_options("svc:orders"), Some(options));
}

#[tokio::test]
async fn test_declaration_mismatch_fails_the_worker() {
    let channel = MemoryChannel::new();
    channel
        .declare_queue("svc:orders", &QueueOptions::durable())
        .await
        .unwrap();

    let handle = WorkerHandle::new(Arc::new(Declaring(QueueOptions::default())), &settings());
    let err = handle.consume(Arc::new(channel.clone())).await.unwrap_err();

    assert!(matches!(err, WorkerError::Declaration { ref queue, .. } if queue == "svc:orders"));
    assert_eq!(handle.state(), WorkerState::Failed);
}

#[tokio::test]
async fn test_declaration_timeout() {
    let channel = MemoryChannel::new().with_declare_delay(Duration::from_millis(500));
    let options = QueueOptions::default().with_timeout(Duration::from_millis(20));

    let handle = WorkerHandle::new(Arc::new(Declaring(options)), &settings());
    let err = handle.consume(Arc::new(channel.clone())).await.unwrap_err();

    match err {
        WorkerError::Declaration { reason, .. } => assert!(reason.contains("timed out")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handle.state(), WorkerState::Failed);
}
