//! Broker abstraction.
//!
//! The pipeline never talks to a client library directly. It depends on the
//! [`Channel`] trait for declare/consume/publish and on a per-delivery
//! [`Acker`] for settlement, so the same worker code runs against:
//! - [`AmqpChannel`]: RabbitMQ via `lapin` (feature `amqp`)
//! - [`MemoryChannel`]: in-process broker for tests and local runs

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpChannel;
pub use memory::{MemoryChannel, Published, Settlement};

use crate::error::BrokerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// Message headers: string keys, JSON-compatible values.
pub type Headers = serde_json::Map<String, serde_json::Value>;

/// Stream of deliveries produced by [`Channel::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Name of the default (nameless direct) exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,

    /// Restrict to the declaring connection
    pub exclusive: bool,

    /// Delete when the last consumer goes away
    pub auto_delete: bool,

    /// Only check that the queue exists
    pub passive: bool,

    /// Extra `x-*` arguments
    pub arguments: Headers,

    /// Upper bound for the declare round-trip (None = wait indefinitely)
    pub timeout: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: false,
            exclusive: false,
            auto_delete: false,
            passive: false,
            arguments: Headers::new(),
            timeout: None,
        }
    }
}

impl QueueOptions {
    /// Durable queue, the common case for work queues
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Set the declare timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add an `x-*` argument
    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// True when a queue declared with `other` would be rejected as a mismatch.
    pub(crate) fn conflicts_with(&self, other: &QueueOptions) -> bool {
        self.durable != other.durable
            || self.exclusive != other.exclusive
            || self.auto_delete != other.auto_delete
            || self.arguments != other.arguments
    }
}

/// Inbound message as seen by the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    /// Broker marked this as a redelivery
    pub redelivered: bool,
    /// Broker-side delivery tracking already settled this message
    pub processed: bool,
}

impl IncomingMessage {
    /// Message with a body and nothing else set
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }

    pub fn processed(mut self) -> Self {
        self.processed = true;
        self
    }
}

/// Outbound message handed to [`Channel::publish`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub headers: Headers,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
}

/// Settles a single delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    /// Positive acknowledgment
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgment; `requeue` puts the message back on the queue
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message plus the handle that settles it.
pub struct Delivery {
    pub message: IncomingMessage,
    pub acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: IncomingMessage, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Broker channel shared by every worker of the process.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare (or passively check) a queue.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    /// Start consuming from a queue with manual acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// Publish on `exchange` with `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BrokerError>;
}
