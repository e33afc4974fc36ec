//! Error types for the worker pipeline.
//!
//! Errors fall into three groups:
//! - **Recoverable**: [`ValidationError`](crate::ValidationError), turned into an
//!   error [`Response`](crate::Response) by handlers
//! - **Broker**: declaration / publish / acknowledgment failures, never retried
//!   by the pipeline
//! - **Programming**: `InvalidArgument`, `IllegalState`, `InvalidHandlerResult`;
//!   always fatal, meant to be caught by tests

use crate::serializer::ValidationError;
use crate::worker::Disposition;
use thiserror::Error;

/// Error returned by a worker's request handler.
///
/// Boxed so handlers can `?` any error type, `eyre::Report` included.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reported by a broker implementation, already classified.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection could not be established or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Queue declaration rejected by the broker
    #[error("declare error: {0}")]
    Declare(String),

    /// Consumer registration failed
    #[error("consume error: {0}")]
    Consume(String),

    /// Publish rejected (e.g. channel closed)
    #[error("publish error: {0}")]
    Publish(String),

    /// Ack / reject could not be delivered
    #[error("acknowledge error: {0}")]
    Acknowledge(String),
}

#[cfg(feature = "amqp")]
impl BrokerError {
    pub(crate) fn connection(error: impl std::fmt::Display) -> Self {
        Self::Connection(error.to_string())
    }
}

/// Errors produced by the worker pipeline.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A constructor or operation received an argument it cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was called in a state that does not permit it
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A handler produced a result the pipeline cannot honour
    #[error("invalid handler result: {0}")]
    InvalidHandlerResult(String),

    /// Queue declaration failed or timed out; fatal for that worker
    #[error("failed to declare queue '{queue}': {reason}")]
    Declaration { queue: String, reason: String },

    /// Response publish failed; not retried
    #[error("failed to publish to '{routing_key}': {reason}")]
    Publish { routing_key: String, reason: String },

    /// Ack / reject of a delivery failed
    #[error("failed to settle delivery {delivery_tag}: {reason}")]
    Acknowledgement { delivery_tag: u64, reason: String },

    /// Other broker failures (connection, consumer registration)
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Payload failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The handler failed; the delivery was settled with `disposition` first
    #[error("handler failed, message {disposition}: {source}")]
    Handler {
        disposition: Disposition,
        #[source]
        source: HandlerError,
    },

    /// Worker name not present in the registry
    #[error("unknown worker '{0}'")]
    UnknownWorker(String),

    /// A worker could not be started by the runtime
    #[error("worker '{worker}' failed to start: {source}")]
    Startup {
        worker: String,
        #[source]
        source: Box<WorkerError>,
    },

    /// Awaited reply did not arrive in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Settings could not be loaded
    #[error(transparent)]
    Config(#[from] core_config::ConfigError),

    /// JSON encoding/decoding failure outside of validation
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkerError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// True for errors that indicate a bug in calling code rather than a runtime condition.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            WorkerError::InvalidArgument(_)
                | WorkerError::IllegalState(_)
                | WorkerError::InvalidHandlerResult(_)
                | WorkerError::UnknownWorker(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_programming_errors() {
        assert!(WorkerError::invalid_argument("x").is_programming_error());
        assert!(WorkerError::illegal_state("x").is_programming_error());
        assert!(WorkerError::InvalidHandlerResult("x".into()).is_programming_error());

        let declare = WorkerError::Declaration {
            queue: "svc:orders".into(),
            reason: "PRECONDITION_FAILED".into(),
        };
        assert!(!declare.is_programming_error());
        assert!(declare.to_string().contains("svc:orders"));
    }

    #[test]
    fn test_handler_error_keeps_source() {
        let err = WorkerError::Handler {
            disposition: Disposition::Requeued,
            source: "boom".into(),
        };
        assert_eq!(err.to_string(), "handler failed, message requeued: boom");
        assert!(std::error::Error::source(&err).is_some());
    }
}
