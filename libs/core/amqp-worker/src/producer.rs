//! Request producer
//!
//! Client half of request/response: publishes JSON requests to a worker's
//! queue and, for [`Producer::call`], waits for the correlated reply.
//!
//! # Example
//!
//! ```rust,ignore
//! let producer = Producer::new(runtime.channel(), settings.clone());
//!
//! // Fire and forget
//! let correlation_id = producer.publish("orders", &order, None).await?;
//!
//! // Request / reply
//! let reply = producer.call("orders", &order, None, Duration::from_secs(5)).await?;
//! assert_eq!(reply.status, 201);
//! ```

use crate::broker::{Channel, DeliveryStream, Headers, IncomingMessage, OutgoingMessage, QueueOptions, DEFAULT_EXCHANGE};
use crate::error::WorkerError;
use crate::response::STATUS_HEADER;
use crate::settings::Settings;
use crate::worker::JSON_CONTENT_TYPE;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<IncomingMessage>>>>;

/// A reply received by [`Producer::call`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Value of the `status` header
    pub status: u16,
    pub headers: Headers,
    pub data: Value,
    pub correlation_id: String,
}

impl Reply {
    fn from_message(message: IncomingMessage) -> Result<Self, WorkerError> {
        let status = message
            .headers
            .get(STATUS_HEADER)
            .and_then(Value::as_u64)
            .and_then(|status| u16::try_from(status).ok())
            .ok_or_else(|| WorkerError::invalid_argument("reply carries no numeric status header"))?;
        let data = if message.body.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(&message.body)?
        };
        Ok(Self {
            status,
            headers: message.headers,
            data,
            correlation_id: message.correlation_id.unwrap_or_default(),
        })
    }

    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

struct ReplyQueue {
    name: String,
    pending: Pending,
    listener: JoinHandle<()>,
}

impl Drop for ReplyQueue {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Publishes requests to worker queues of this service.
pub struct Producer {
    channel: Arc<dyn Channel>,
    settings: Arc<Settings>,
    reply_queue: OnceCell<ReplyQueue>,
}

impl Producer {
    pub fn new(channel: Arc<dyn Channel>, settings: Arc<Settings>) -> Self {
        Self {
            channel,
            settings,
            reply_queue: OnceCell::new(),
        }
    }

    /// Publish a JSON request to the `basename` worker without waiting for a reply.
    ///
    /// Returns the generated correlation id.
    pub async fn publish<P: Serialize + ?Sized>(
        &self,
        basename: &str,
        payload: &P,
        headers: Option<Headers>,
    ) -> Result<String, WorkerError> {
        let correlation_id = Uuid::new_v4().to_string();
        self.send(basename, payload, headers, &correlation_id, None).await?;
        Ok(correlation_id)
    }

    /// Publish a JSON request and wait up to `timeout` for its reply.
    pub async fn call<P: Serialize + ?Sized>(
        &self,
        basename: &str,
        payload: &P,
        headers: Option<Headers>,
        timeout: Duration,
    ) -> Result<Reply, WorkerError> {
        let reply_queue = self.reply_queue.get_or_try_init(|| self.open_reply_queue()).await?;

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&reply_queue.pending).insert(correlation_id.clone(), tx);

        let sent = self
            .send(basename, payload, headers, &correlation_id, Some(&reply_queue.name))
            .await;
        if let Err(e) = sent {
            lock(&reply_queue.pending).remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Reply::from_message(message),
            Ok(Err(_)) => Err(WorkerError::illegal_state("reply listener stopped")),
            Err(_) => {
                lock(&reply_queue.pending).remove(&correlation_id);
                Err(WorkerError::Timeout(format!(
                    "no reply from '{}' within {timeout:?} (correlation_id {correlation_id})",
                    self.settings.queue_name(basename)
                )))
            }
        }
    }

    async fn send<P: Serialize + ?Sized>(
        &self,
        basename: &str,
        payload: &P,
        headers: Option<Headers>,
        correlation_id: &str,
        reply_to: Option<&str>,
    ) -> Result<(), WorkerError> {
        let queue = self.settings.queue_name(basename);
        let message = OutgoingMessage {
            headers: headers.unwrap_or_default(),
            body: serde_json::to_vec(payload)?,
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            correlation_id: Some(correlation_id.to_string()),
            reply_to: reply_to.map(str::to_string),
            message_id: Some(Uuid::now_v7().to_string()),
        };

        self.channel
            .publish(DEFAULT_EXCHANGE, &queue, message)
            .await
            .map_err(|e| WorkerError::Publish {
                routing_key: queue.clone(),
                reason: e.to_string(),
            })?;

        debug!(queue = %queue, correlation_id = %correlation_id, "Published request");
        Ok(())
    }

    async fn open_reply_queue(&self) -> Result<ReplyQueue, WorkerError> {
        let name = format!(
            "{}:reply.{}",
            self.settings.service_name,
            Uuid::new_v4().simple()
        );
        let options = QueueOptions {
            exclusive: true,
            auto_delete: true,
            ..Default::default()
        };
        self.channel
            .declare_queue(&name, &options)
            .await
            .map_err(|e| WorkerError::Declaration {
                queue: name.clone(),
                reason: e.to_string(),
            })?;

        let consumer_tag = format!("{name}_{}", self.settings.service_hash_key);
        let deliveries = self.channel.consume(&name, &consumer_tag).await?;

        let pending: Pending = Arc::default();
        let listener = tokio::spawn(route_replies(deliveries, Arc::clone(&pending)));
        debug!(queue = %name, "Reply queue ready");

        Ok(ReplyQueue {
            name,
            pending,
            listener,
        })
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("service", &self.settings.service_name)
            .field("reply_queue", &self.reply_queue.get().map(|q| q.name.as_str()))
            .finish_non_exhaustive()
    }
}

async fn route_replies(mut deliveries: DeliveryStream, pending: Pending) {
    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(error = %e, "Failed to receive reply");
                continue;
            }
        };

        if let Err(e) = delivery.acker.ack().await {
            warn!(error = %e, "Failed to ack reply");
        }

        let message = delivery.message;
        let waiter = message
            .correlation_id
            .as_ref()
            .and_then(|id| lock(&pending).remove(id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => debug!(
                correlation_id = ?message.correlation_id,
                "Dropping reply with unknown correlation id"
            ),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryChannel;
    use serde_json::json;

    fn producer(channel: &MemoryChannel) -> Producer {
        let settings = Settings::new("svc", vec!["orders".into()], "amqp://localhost").unwrap();
        Producer::new(Arc::new(channel.clone()), Arc::new(settings))
    }

    #[tokio::test]
    async fn test_publish_targets_worker_queue() {
        let channel = MemoryChannel::new();
        let correlation_id = producer(&channel)
            .publish("orders", &json!({"sku": "A-1"}), None)
            .await
            .unwrap();

        let published = channel.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, DEFAULT_EXCHANGE);
        assert_eq!(published[0].routing_key, "svc:orders");
        assert_eq!(published[0].message.correlation_id.as_deref(), Some(correlation_id.as_str()));
        assert_eq!(published[0].message.reply_to, None);
        assert_eq!(published[0].message.body, br#"{"sku":"A-1"}"#);
    }

    #[tokio::test]
    async fn test_call_times_out_without_worker() {
        let channel = MemoryChannel::new();
        let producer = producer(&channel);

        let err = producer
            .call("orders", &json!({}), None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)));

        // reply queue is declared once and reused
        let reply_queues: Vec<_> = channel
            .queues()
            .into_iter()
            .filter(|q| q.starts_with("svc:reply."))
            .collect();
        assert_eq!(reply_queues.len(), 1);
        let options = channel.queue_options(&reply_queues[0]).unwrap();
        assert!(options.exclusive && options.auto_delete);
    }

    #[test]
    fn test_reply_requires_status() {
        let message = IncomingMessage::new(b"{}".to_vec());
        assert!(Reply::from_message(message).is_err());

        let message = IncomingMessage::new(br#"{"id":1}"#.to_vec()).with_header("status", 201);
        let reply = Reply::from_message(message).unwrap();
        assert_eq!(reply.status, 201);
        assert!(reply.is_success());
        assert_eq!(reply.data, json!({"id": 1}));
    }
}
