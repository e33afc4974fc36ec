//! Liveness worker

use amqp_worker::{async_trait, HandlerError, Request, Response, Worker};
use serde_json::json;

/// Answers every request with `{pong: true, service}`; requests without
/// `reply_to` are acked silently.
pub struct PingWorker {
    service: String,
}

impl PingWorker {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }
}

#[async_trait]
impl Worker for PingWorker {
    fn basename(&self) -> &str {
        "ping"
    }

    async fn process_request(&self, request: Request<'_>) -> Result<Option<Response>, HandlerError> {
        if request.reply_to().is_none() {
            return Ok(None);
        }
        let data = json!({ "pong": true, "service": self.service });
        Ok(Some(Response::ok(data)?))
    }
}
