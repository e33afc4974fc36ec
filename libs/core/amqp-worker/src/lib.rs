//! AMQP Worker Framework
//!
//! Consume requests from per-worker AMQP queues and reply to them.
//!
//! ## Features
//!
//! - **Worker contract**: implement [`Worker`] and return an optional [`Response`]
//! - **Acknowledgment policy**: [`AckPolicy`] decides ack / reject / requeue on failure
//! - **Validation**: [`Serializer`] + [`JsonSchema`] turn a raw body into typed data
//!   or structured errors, rendered as a 400 reply with [`Response::from_error`]
//! - **Runtime**: [`Runtime`] resolves configured worker names through a
//!   [`WorkerRegistry`] and binds them to one shared channel
//! - **Producer**: [`Producer`] publishes requests and awaits correlated replies
//! - **Prometheus metrics**: see [`metrics`]
//!
//! ## Message flow
//!
//! ```text
//! broker ──> consume loop ──> MessageContext ──> Worker::process_request
//!                                                   │
//!                   ack / reject / requeue  <───────┤
//!                   publish Response to reply_to <──┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use amqp_worker::{Runtime, Settings, StartupPolicy, WorkerRegistry};
//! use core_config::FromEnv;
//!
//! let settings = Arc::new(Settings::from_env()?);
//! let registry = WorkerRegistry::new().with_worker("orders", |s| OrdersWorker::new(s.clone()))?;
//!
//! let runtime = Runtime::connect(settings, &registry, StartupPolicy::FailFast).await?;
//! runtime.wait_for_shutdown().await?;
//! ```

mod api_error;
pub mod broker;
mod error;
pub mod metrics;
mod producer;
mod registry;
mod request;
mod response;
mod runtime;
mod serializer;
mod settings;
mod worker;

// Re-export main types
pub use api_error::{ApiError, ApiException};
pub use broker::{Channel, Headers, IncomingMessage, MemoryChannel, OutgoingMessage, QueueOptions};
pub use error::{BrokerError, HandlerError, WorkerError};
pub use metrics::{init_metrics, WorkerMetrics};
pub use producer::{Producer, Reply};
pub use registry::WorkerRegistry;
pub use request::Request;
pub use response::{Response, STATUS_HEADER};
pub use runtime::{Runtime, StartupPolicy, WorkerFailure};
pub use serializer::{JsonSchema, PayloadSchema, Serializer, ValidationError, NON_FIELD_ERRORS};
pub use settings::{ConnectionOptions, Settings};
pub use worker::{
    AckPolicy, Disposition, MessageContext, Worker, WorkerHandle, WorkerState, JSON_CONTENT_TYPE,
};

#[cfg(feature = "amqp")]
pub use broker::AmqpChannel;

// Handlers implement `Worker` with `#[async_trait]`
pub use async_trait::async_trait;
pub use http::StatusCode;
