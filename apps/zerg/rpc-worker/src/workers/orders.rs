//! Order intake worker

use amqp_worker::{
    async_trait, AckPolicy, ApiError, ApiException, HandlerError, JsonSchema, QueueOptions,
    Request, Response, StatusCode, Worker,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// SKU prefix of products that can no longer be ordered
const DISCONTINUED_PREFIX: &str = "LEGACY-";

/// Order request payload
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewOrder {
    #[validate(length(min = 1, max = 64))]
    pub sku: String,

    #[validate(range(min = 1, max = 1000))]
    pub quantity: u32,

    #[validate(email)]
    pub customer_email: String,
}

/// Validates order requests and answers with the created order.
///
/// Replies:
/// - 201 with `{id, sku, quantity}` on success
/// - 400 `{invalid: "Bad Request", errors: {..}}` when the payload is invalid
/// - 422 `{discontinued: ..}` for discontinued SKUs
pub struct OrdersWorker {
    debug: bool,
}

impl OrdersWorker {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }
}

#[async_trait]
impl Worker for OrdersWorker {
    fn basename(&self) -> &str {
        "orders"
    }

    fn queue_options(&self) -> QueueOptions {
        QueueOptions::durable()
    }

    fn ack_policy(&self) -> AckPolicy {
        AckPolicy::requeue().with_reject_on_redelivered(true)
    }

    #[instrument(skip_all, fields(correlation_id = ?request.correlation_id()))]
    async fn process_request(&self, request: Request<'_>) -> Result<Option<Response>, HandlerError> {
        let mut serializer = request.serializer(JsonSchema::<NewOrder>::new());
        if let Err(err) = serializer.ensure_valid() {
            warn!(errors = %err.errors(), "Rejected invalid order");
            let data = json!({ "errors": err.errors() });
            let response =
                Response::from_error(err.status_code(), &err, None, Some(data), self.debug)?;
            return Ok(Some(response));
        }

        let order = serializer
            .into_validated_data()?
            .ok_or("validated order missing")?;

        if order.sku.starts_with(DISCONTINUED_PREFIX) {
            let err = ApiException::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "discontinued",
                format!("{} is no longer available", order.sku),
            );
            return Ok(Some(Response::from_error(
                err.status_code(),
                &err,
                None,
                None,
                self.debug,
            )?));
        }

        let id = Uuid::now_v7();
        info!(order_id = %id, sku = %order.sku, quantity = order.quantity, "Order accepted");

        let data = json!({
            "id": id,
            "sku": order.sku,
            "quantity": order.quantity,
        });
        Ok(Some(Response::new(StatusCode::CREATED, None, Some(data))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_worker::IncomingMessage;
    use serde_json::Value;

    async fn handle(worker: &OrdersWorker, body: Value) -> Response {
        let message = IncomingMessage::new(serde_json::to_vec(&body).unwrap()).with_reply_to("replies");
        let request = Request::new("", &message);
        worker.process_request(request).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_valid_order_is_created() {
        let response = handle(
            &OrdersWorker::new(false),
            json!({"sku": "A-1", "quantity": 2, "customer_email": "ada@example.com"}),
        )
        .await;

        assert_eq!(response.status(), 201);
        assert_eq!(response.data()["sku"], "A-1");
        assert!(response.data()["id"].is_string());
    }

    #[tokio::test]
    async fn test_invalid_order_is_bad_request() {
        let response = handle(
            &OrdersWorker::new(false),
            json!({"sku": "A-1", "quantity": 0, "customer_email": "not-an-email"}),
        )
        .await;

        assert_eq!(response.status(), 400);
        assert_eq!(response.data()["invalid"], "Bad Request");
        assert!(response.data()["errors"]["quantity"].is_array());
        assert!(response.data()["errors"]["customer_email"].is_array());
        assert!(!response.data().contains_key("traceback"));
    }

    #[tokio::test]
    async fn test_debug_adds_traceback() {
        let response = handle(&OrdersWorker::new(true), json!({"sku": ""})).await;
        assert_eq!(response.status(), 400);
        assert!(response.data()["traceback"].is_string());
    }

    #[tokio::test]
    async fn test_discontinued_sku() {
        let response = handle(
            &OrdersWorker::new(false),
            json!({"sku": "LEGACY-9", "quantity": 1, "customer_email": "ada@example.com"}),
        )
        .await;

        assert_eq!(response.status(), 422);
        assert_eq!(response.data()["discontinued"], "LEGACY-9 is no longer available");
    }

    #[test]
    fn test_failed_orders_are_retried_once() {
        let policy = OrdersWorker::new(false).ack_policy();
        assert!(policy.requeue);
        assert!(policy.reject_on_redelivered);
    }
}
