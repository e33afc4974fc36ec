//! In-process broker.
//!
//! Behaves like a single RabbitMQ channel closely enough for the pipeline:
//! - declaring an existing queue with different options is refused
//! - publishing on the default exchange routes to the queue named by the routing key
//! - every publish and settlement is recorded for inspection
//! - `close()` makes publishes and declarations fail like a closed channel

use super::{
    Acker, Channel, Delivery, DeliveryStream, IncomingMessage, OutgoingMessage, QueueOptions,
    DEFAULT_EXCHANGE,
};
use crate::error::BrokerError;
use crate::worker::Disposition;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// A recorded settlement of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub queue: String,
    pub delivery_tag: u64,
    pub disposition: Disposition,
}

/// A recorded publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutgoingMessage,
}

struct QueueState {
    options: QueueOptions,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    published: Vec<Published>,
    settlements: Vec<Settlement>,
    next_tag: u64,
    closed: bool,
    declare_delay: Option<Duration>,
    redeliver_requeued: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a message onto a declared queue, assigning a delivery tag.
    fn enqueue(self: &Arc<Self>, queue: &str, mut message: IncomingMessage) -> Result<u64, BrokerError> {
        let mut state = self.lock();
        let sender = state
            .queues
            .get(queue)
            .map(|queue_state| queue_state.sender.clone())
            .ok_or_else(|| BrokerError::Publish(format!("NOT_FOUND - no queue '{queue}'")))?;

        let tag = state.next_tag + 1;
        message.delivery_tag = tag;
        if message.routing_key.is_empty() {
            message.routing_key = queue.to_string();
        }

        let acker = MemoryAcker {
            shared: Arc::clone(self),
            queue: queue.to_string(),
            message: message.clone(),
            settled: AtomicBool::new(false),
        };
        sender
            .send(Delivery::new(message, Box::new(acker)))
            .map_err(|_| BrokerError::Publish(format!("queue '{queue}' is gone")))?;
        state.next_tag = tag;
        Ok(tag)
    }
}

/// In-memory [`Channel`] implementation.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    shared: Arc<Shared>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-enqueue requeued messages with `redelivered` set, as a broker would.
    pub fn with_redelivery(self) -> Self {
        self.shared.lock().redeliver_requeued = true;
        self
    }

    /// Delay every queue declaration (exercises declare timeouts).
    pub fn with_declare_delay(self, delay: Duration) -> Self {
        self.shared.lock().declare_delay = Some(delay);
        self
    }

    /// Close the channel: later publishes and declarations fail.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.changed.notify_waiters();
    }

    /// Deliver a message to a declared queue. Returns its delivery tag.
    pub fn deliver(&self, queue: &str, message: IncomingMessage) -> Result<u64, BrokerError> {
        let tag = self.shared.enqueue(queue, message)?;
        debug!(queue = %queue, delivery_tag = tag, "Delivered message");
        Ok(tag)
    }

    /// Options a queue was declared with
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.shared.lock().queues.get(queue).map(|q| q.options.clone())
    }

    /// Names of all declared queues
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Everything published so far, in order
    pub fn published(&self) -> Vec<Published> {
        self.shared.lock().published.clone()
    }

    /// Every settlement so far, in order
    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.lock().settlements.clone()
    }

    /// Wait until at least `count` settlements were recorded.
    pub async fn wait_for_settlements(&self, count: usize) -> Vec<Settlement> {
        loop {
            let changed = self.shared.changed.notified();
            let settlements = self.settlements();
            if settlements.len() >= count {
                return settlements;
            }
            changed.await;
        }
    }

    /// Wait until at least `count` publishes were recorded.
    pub async fn wait_for_published(&self, count: usize) -> Vec<Published> {
        loop {
            let changed = self.shared.changed.notified();
            let published = self.published();
            if published.len() >= count {
                return published;
            }
            changed.await;
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let delay = self.shared.lock().declare_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.lock();
        if state.closed {
            return Err(BrokerError::Declare("channel is closed".to_string()));
        }

        let existing = state.queues.get(name).map(|queue| queue.options.clone());
        match existing {
            Some(existing) if !options.passive && existing.conflicts_with(options) => {
                Err(BrokerError::Declare(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{name}'"
                )))
            }
            Some(_) => Ok(()),
            None if options.passive => {
                Err(BrokerError::Declare(format!("NOT_FOUND - no queue '{name}'")))
            }
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options: options.clone(),
                        sender,
                        receiver: Some(receiver),
                    },
                );
                Ok(())
            }
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let receiver = {
            let mut state = self.shared.lock();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::Consume(format!("NOT_FOUND - no queue '{queue}'")))?;
            queue_state.receiver.take().ok_or_else(|| {
                BrokerError::Consume(format!("queue '{queue}' already has a consumer"))
            })?
        };

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer registered");
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        });
        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BrokerError> {
        let routed = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(BrokerError::Publish("channel is closed".to_string()));
            }
            state.published.push(Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
            });
            exchange == DEFAULT_EXCHANGE && state.queues.contains_key(routing_key)
        };

        if routed {
            let incoming = IncomingMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                headers: message.headers,
                body: message.body,
                content_type: message.content_type,
                correlation_id: message.correlation_id,
                reply_to: message.reply_to,
                message_id: message.message_id,
                ..Default::default()
            };
            self.shared.enqueue(routing_key, incoming)?;
        }

        self.shared.changed.notify_waiters();
        Ok(())
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    message: IncomingMessage,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, disposition: Disposition) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Acknowledge(format!(
                "PRECONDITION_FAILED - delivery {} already settled",
                self.message.delivery_tag
            )));
        }

        let redeliver = {
            let mut state = self.shared.lock();
            state.settlements.push(Settlement {
                queue: self.queue.clone(),
                delivery_tag: self.message.delivery_tag,
                disposition,
            });
            disposition == Disposition::Requeued && state.redeliver_requeued
        };

        if redeliver {
            let mut message = self.message.clone();
            message.redelivered = true;
            self.shared.enqueue(&self.queue, message)?;
        }

        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(Disposition::Acked)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(if requeue {
            Disposition::Requeued
        } else {
            Disposition::Rejected
        })
    }
}
