//! Worker contract and the per-queue consume pipeline.
//!
//! This module provides:
//! - `Worker` trait implemented by application handlers
//! - `AckPolicy` describing how failed deliveries are settled
//! - `MessageContext`, the invocation-scoped view of one delivery
//! - `WorkerHandle`, which owns a worker's lifecycle and its consume loop
//!
//! # Concurrency
//!
//! Every delivery is handled on its own task with its own `MessageContext`,
//! so handlers of one worker run concurrently by default. A worker returning
//! `Some(n)` from [`Worker::max_concurrency`] is limited to `n` in-flight
//! handlers; `Some(1)` gives strictly serial processing.

use crate::broker::{
    Acker, Channel, Delivery, DeliveryStream, IncomingMessage, OutgoingMessage, QueueOptions,
    DEFAULT_EXCHANGE,
};
use crate::error::{HandlerError, WorkerError};
use crate::metrics::WorkerMetrics;
use crate::request::Request;
use crate::response::Response;
use crate::settings::Settings;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;
use strum::{AsRefStr, Display};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Content type of every published reply
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Disposition {
    /// Positively acknowledged
    Acked,
    /// Rejected without requeue
    Rejected,
    /// Rejected and put back on the queue
    Requeued,
}

/// Acknowledgment policy of a worker.
///
/// Success always acks. On handler failure:
/// - `reject_on_redelivered` and the message is a redelivery: rejected
/// - otherwise `requeue`: requeued
/// - otherwise: rejected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckPolicy {
    /// Requeue the message when the handler fails
    pub requeue: bool,

    /// Reject, never requeue, a failing message that was already redelivered
    pub reject_on_redelivered: bool,

    /// Ack without invoking the handler when the message is already processed
    pub ignore_processed: bool,
}

impl AckPolicy {
    /// Policy that requeues failed messages
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            ..Default::default()
        }
    }

    pub fn with_reject_on_redelivered(mut self, reject: bool) -> Self {
        self.reject_on_redelivered = reject;
        self
    }

    pub fn with_ignore_processed(mut self, ignore: bool) -> Self {
        self.ignore_processed = ignore;
        self
    }

    /// Disposition of a delivery whose handler failed.
    pub fn failure_disposition(&self, redelivered: bool) -> Disposition {
        if self.reject_on_redelivered && redelivered {
            Disposition::Rejected
        } else if self.requeue {
            Disposition::Requeued
        } else {
            Disposition::Rejected
        }
    }
}

/// A queue consumer implemented by the application.
///
/// One instance lives for the whole process and may serve several deliveries
/// at once; anything specific to a delivery is reached through the
/// [`Request`], never stored on the worker.
///
/// # Example
///
/// ```rust,ignore
/// struct Ping;
///
/// #[async_trait]
/// impl Worker for Ping {
///     fn basename(&self) -> &str {
///         "ping"
///     }
///
///     async fn process_request(&self, _request: Request<'_>) -> Result<Option<Response>, HandlerError> {
///         Ok(Some(Response::ok(json!({"pong": true}))?))
///     }
/// }
/// ```
#[async_trait]
pub trait Worker: Send + Sync {
    /// Queue suffix; the queue is `{service_name}:{basename}`.
    fn basename(&self) -> &str;

    /// Static queue declaration policy
    fn queue_options(&self) -> QueueOptions {
        QueueOptions::default()
    }

    /// How deliveries are settled
    fn ack_policy(&self) -> AckPolicy {
        AckPolicy::default()
    }

    /// Upper bound of in-flight handlers; `None` is unbounded.
    fn max_concurrency(&self) -> Option<usize> {
        None
    }

    /// Handle one request. A returned `Response` is published to the
    /// request's `reply_to`; without one it is dropped and the message still acked.
    async fn process_request(&self, request: Request<'_>) -> Result<Option<Response>, HandlerError>;
}

/// Everything known about one in-flight delivery.
///
/// Created per delivery and dropped when its handling completes.
#[derive(Debug, Clone)]
pub struct MessageContext {
    exchange: String,
    message: IncomingMessage,
}

impl MessageContext {
    pub fn new(exchange: impl Into<String>, message: IncomingMessage) -> Self {
        Self {
            exchange: exchange.into(),
            message,
        }
    }

    /// Exchange replies are published on
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn message(&self) -> &IncomingMessage {
        &self.message
    }

    /// Handler-facing view of the message
    pub fn request(&self) -> Request<'_> {
        Request::new(&self.exchange, &self.message)
    }
}

/// Lifecycle of a [`WorkerHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    /// Not yet bound to a channel
    Unbound,
    /// Queue declaration in progress
    Declaring,
    /// Consume loop registered
    Consuming,
    /// Declaration or consumer registration failed; terminal
    Failed,
}

/// Runs deliveries of one queue through a worker.
struct Dispatcher {
    worker: Arc<dyn Worker>,
    queue_name: String,
    channel: Arc<dyn Channel>,
    metrics: WorkerMetrics,
}

impl Dispatcher {
    fn new(worker: Arc<dyn Worker>, queue_name: String, channel: Arc<dyn Channel>) -> Self {
        let metrics = WorkerMetrics::new(&queue_name);
        Self {
            worker,
            queue_name,
            channel,
            metrics,
        }
    }

    async fn dispatch(&self, delivery: Delivery) -> Result<Disposition, WorkerError> {
        let Delivery { message, acker } = delivery;
        let context = MessageContext::new(DEFAULT_EXCHANGE, message);
        let delivery_tag = context.message().delivery_tag;
        let policy = self.worker.ack_policy();
        self.metrics.message_received();

        if policy.ignore_processed && context.message().processed {
            self.settle(acker.as_ref(), delivery_tag, Disposition::Acked).await?;
            debug!("Message already processed, acked without handling");
            return Ok(Disposition::Acked);
        }

        let start = Instant::now();
        let result = self.worker.process_request(context.request()).await;
        self.metrics.handler_duration(start.elapsed());

        match result {
            Ok(response) => {
                self.settle(acker.as_ref(), delivery_tag, Disposition::Acked).await?;
                match response {
                    Some(response) if context.message().reply_to.is_some() => {
                        self.publish_response(&context, response).await?;
                    }
                    Some(response) => warn!(
                        queue = %self.queue_name,
                        status = response.status(),
                        "Message has no reply_to, response dropped"
                    ),
                    None => {}
                }
                debug!("Successfully processed request");
                Ok(Disposition::Acked)
            }
            Err(source) => {
                let disposition = policy.failure_disposition(context.message().redelivered);
                self.settle(acker.as_ref(), delivery_tag, disposition).await?;
                Err(WorkerError::Handler {
                    disposition,
                    source,
                })
            }
        }
    }

    async fn settle(
        &self,
        acker: &dyn Acker,
        delivery_tag: u64,
        disposition: Disposition,
    ) -> Result<(), WorkerError> {
        let result = match disposition {
            Disposition::Acked => acker.ack().await,
            Disposition::Rejected => acker.reject(false).await,
            Disposition::Requeued => acker.reject(true).await,
        };
        result.map_err(|e| WorkerError::Acknowledgement {
            delivery_tag,
            reason: e.to_string(),
        })?;
        self.metrics.message_settled(disposition);
        Ok(())
    }

    async fn publish_response(
        &self,
        context: &MessageContext,
        response: Response,
    ) -> Result<(), WorkerError> {
        let message = context.message();
        let routing_key = message.reply_to.clone().ok_or_else(|| {
            WorkerError::InvalidHandlerResult("cannot reply to a message without reply_to".to_string())
        })?;

        let body = response.body()?;
        let (headers, _) = response.into_parts();
        let outgoing = OutgoingMessage {
            headers,
            body,
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            correlation_id: message.correlation_id.clone(),
            ..Default::default()
        };

        self.channel
            .publish(context.exchange(), &routing_key, outgoing)
            .await
            .map_err(|e| WorkerError::Publish {
                routing_key: routing_key.clone(),
                reason: e.to_string(),
            })?;

        self.metrics.response_published();
        debug!(routing_key = %routing_key, "Published response");
        Ok(())
    }
}

/// A worker bound (or about to be bound) to a channel.
pub struct WorkerHandle {
    worker: Arc<dyn Worker>,
    queue_name: String,
    consumer_tag: String,
    state: Mutex<WorkerState>,
    dispatcher: OnceLock<Arc<Dispatcher>>,
    consume_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn new(worker: Arc<dyn Worker>, settings: &Settings) -> Self {
        let queue_name = settings.queue_name(worker.basename());
        let consumer_tag = format!("{}_{}", queue_name, settings.service_hash_key);
        Self {
            worker,
            queue_name,
            consumer_tag,
            state: Mutex::new(WorkerState::Unbound),
            dispatcher: OnceLock::new(),
            consume_task: Mutex::new(None),
        }
    }

    /// `{service_name}:{basename}`
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn basename(&self) -> &str {
        self.worker.basename()
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    /// Declare the worker's queue with its static policy.
    ///
    /// Bounded by the queue options' timeout. Any failure is fatal for this
    /// worker and is not retried.
    pub async fn declare_queue(&self, channel: &dyn Channel) -> Result<(), WorkerError> {
        let options = self.worker.queue_options();
        let declare = channel.declare_queue(&self.queue_name, &options);

        let result = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, declare).await.map_err(|_| {
                WorkerError::Declaration {
                    queue: self.queue_name.clone(),
                    reason: format!("timed out after {timeout:?}"),
                }
            })?,
            None => declare.await,
        };

        result.map_err(|e| WorkerError::Declaration {
            queue: self.queue_name.clone(),
            reason: e.to_string(),
        })
    }

    /// Bind to `channel`, declare the queue and start the consume loop.
    ///
    /// A handle consumes at most once; later calls fail with `IllegalState`.
    #[instrument(skip_all, fields(queue = %self.queue_name))]
    pub async fn consume(&self, channel: Arc<dyn Channel>) -> Result<(), WorkerError> {
        {
            let mut state = lock(&self.state);
            if *state != WorkerState::Unbound {
                return Err(WorkerError::illegal_state(format!(
                    "worker '{}' is already bound ({})",
                    self.queue_name, *state
                )));
            }
            *state = WorkerState::Declaring;
        }

        if let Err(e) = self.declare_queue(channel.as_ref()).await {
            self.set_state(WorkerState::Failed);
            return Err(e);
        }

        let deliveries = match channel.consume(&self.queue_name, &self.consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.set_state(WorkerState::Failed);
                return Err(e.into());
            }
        };

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.worker),
            self.queue_name.clone(),
            channel,
        ));
        if self.dispatcher.set(Arc::clone(&dispatcher)).is_err() {
            self.set_state(WorkerState::Failed);
            return Err(WorkerError::illegal_state(format!(
                "worker '{}' already has a dispatcher",
                self.queue_name
            )));
        }

        let limit = self
            .worker
            .max_concurrency()
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        let task = tokio::spawn(consume_loop(dispatcher, deliveries, limit).in_current_span());
        *lock(&self.consume_task) = Some(task);

        self.set_state(WorkerState::Consuming);
        info!(
            consumer_tag = %self.consumer_tag,
            max_concurrency = ?self.worker.max_concurrency(),
            "Worker consuming"
        );
        Ok(())
    }

    /// Run one delivery through the pipeline on the bound channel.
    ///
    /// The consume loop calls this for every delivery; it is public so a
    /// delivery obtained elsewhere can be pushed through the same path.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<Disposition, WorkerError> {
        self.bound()?.dispatch(delivery).await
    }

    /// Publish `response` as the reply to the message in `context`.
    pub async fn publish_response(
        &self,
        context: &MessageContext,
        response: Response,
    ) -> Result<(), WorkerError> {
        self.bound()?.publish_response(context, response).await
    }

    /// Stop the consume loop. In-flight handlers run to completion.
    pub(crate) fn abort(&self) {
        if let Some(task) = lock(&self.consume_task).take() {
            task.abort();
        }
    }

    fn bound(&self) -> Result<&Arc<Dispatcher>, WorkerError> {
        self.dispatcher.get().ok_or_else(|| {
            WorkerError::illegal_state(format!("worker '{}' is not bound to a channel", self.queue_name))
        })
    }

    fn set_state(&self, state: WorkerState) {
        *lock(&self.state) = state;
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("queue_name", &self.queue_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn consume_loop(
    dispatcher: Arc<Dispatcher>,
    mut deliveries: DeliveryStream,
    limit: Option<Arc<Semaphore>>,
) {
    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(error = %e, "Failed to receive delivery");
                continue;
            }
        };

        let permit = match &limit {
            Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };

        let span = tracing::info_span!(
            "delivery",
            delivery_tag = delivery.message.delivery_tag,
            correlation_id = delivery.message.correlation_id.as_deref().unwrap_or_default(),
            redelivered = delivery.message.redelivered,
        );
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(
            async move {
                let _permit = permit;
                match dispatcher.dispatch(delivery).await {
                    Ok(disposition) => debug!(disposition = %disposition, "Delivery settled"),
                    Err(WorkerError::Handler {
                        disposition,
                        source,
                    }) => error!(disposition = %disposition, error = %source, "Handler failed"),
                    Err(e) => error!(error = %e, "Failed to process delivery"),
                }
            }
            .instrument(span),
        );
    }

    warn!("Delivery stream ended, worker stopped consuming");
}
