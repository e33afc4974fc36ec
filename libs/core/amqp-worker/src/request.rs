//! Read-only view over an inbound message.

use crate::broker::{Headers, IncomingMessage};
use crate::serializer::{PayloadSchema, Serializer};

/// What a handler sees of the message it is processing.
///
/// Borrowed from the invocation's [`MessageContext`](crate::MessageContext);
/// it cannot outlive the handler call.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    exchange: &'a str,
    message: &'a IncomingMessage,
}

impl<'a> Request<'a> {
    pub fn new(exchange: &'a str, message: &'a IncomingMessage) -> Self {
        Self { exchange, message }
    }

    /// Exchange replies are published on
    pub fn exchange(&self) -> &'a str {
        self.exchange
    }

    pub fn headers(&self) -> &'a Headers {
        &self.message.headers
    }

    pub fn body(&self) -> &'a [u8] {
        &self.message.body
    }

    pub fn correlation_id(&self) -> Option<&'a str> {
        self.message.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&'a str> {
        self.message.reply_to.as_deref()
    }

    pub fn message_id(&self) -> Option<&'a str> {
        self.message.message_id.as_deref()
    }

    pub fn is_redelivered(&self) -> bool {
        self.message.redelivered
    }

    /// Serializer over this request's body.
    pub fn serializer<S: PayloadSchema>(&self, schema: S) -> Serializer<S> {
        Serializer::new(self.body().to_vec(), schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors_delegate_to_message() {
        let message = IncomingMessage::new(br#"{"id":1}"#.to_vec())
            .with_correlation_id("c-9")
            .with_reply_to("replies")
            .with_header("locale", "en");
        let request = Request::new("", &message);

        assert_eq!(request.body(), br#"{"id":1}"#);
        assert_eq!(request.headers()["locale"], "en");
        assert_eq!(request.correlation_id(), Some("c-9"));
        assert_eq!(request.reply_to(), Some("replies"));
        assert_eq!(request.message_id(), None);
        assert_eq!(request.exchange(), "");
        assert!(!request.is_redelivered());
    }
}
