//! RabbitMQ channel over `lapin`.

use super::{
    Acker, Channel, Delivery, DeliveryStream, Headers, IncomingMessage, OutgoingMessage,
    QueueOptions,
};
use crate::error::BrokerError;
use crate::settings::Settings;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use serde_json::Value;
use std::str::FromStr;
use tracing::{info, instrument};

/// A single `lapin` channel on its own connection.
pub struct AmqpChannel {
    // Held so the connection lives as long as the channel
    _connection: Connection,
    channel: lapin::Channel,
}

impl AmqpChannel {
    /// Connect using the broker URL and connection options from `settings`.
    #[instrument(skip(settings), fields(connection_name = %settings.connection.connection_name))]
    pub async fn connect(settings: &Settings) -> Result<Self, BrokerError> {
        let mut uri = AMQPUri::from_str(&settings.broker_url).map_err(BrokerError::Connection)?;
        uri.query.heartbeat = Some(
            u16::try_from(settings.connection.heartbeat_interval.as_secs()).unwrap_or(u16::MAX),
        );
        uri.query.connection_timeout =
            Some(u64::try_from(settings.connection.timeout.as_millis()).unwrap_or(u64::MAX));

        let properties = ConnectionProperties::default()
            .with_connection_name(settings.connection.connection_name.clone().into());

        let connection = Connection::connect_uri(uri, properties)
            .await
            .map_err(BrokerError::connection)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::connection)?;

        info!(channel_id = channel.id(), "Connected to broker");
        Ok(Self {
            _connection: connection,
            channel,
        })
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let declare_options = QueueDeclareOptions {
            passive: options.passive,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        self.channel
            .queue_declare(name, declare_options, to_field_table(&options.arguments))
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Declare(e.to_string()))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(into_delivery)
                .map_err(|e| BrokerError::Consume(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default().with_headers(to_field_table(&message.headers));
        if let Some(content_type) = message.content_type {
            properties = properties.with_content_type(content_type.into());
        }
        if let Some(correlation_id) = message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = message.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        if let Some(message_id) = message.message_id {
            properties = properties.with_message_id(message_id.into());
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let message = IncomingMessage {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        headers: properties.headers().as_ref().map(from_field_table).unwrap_or_default(),
        body: delivery.data.clone(),
        content_type: properties.content_type().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: properties.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
        message_id: properties.message_id().as_ref().map(|s| s.as_str().to_string()),
        redelivered: delivery.redelivered,
        // RabbitMQ has no broker-side processed marker
        processed: false,
    };
    Delivery::new(message, Box::new(LapinAcker(delivery.acker)))
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => AMQPValue::FieldTable(to_field_table(map)),
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Value::from(*f),
        AMQPValue::Double(f) => Value::from(*f),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(from_field_table(table)),
        AMQPValue::ByteArray(bytes) => Value::String(String::from_utf8_lossy(bytes.as_slice()).into_owned()),
        AMQPValue::DecimalValue(decimal) => {
            let scaled = f64::from(decimal.value) / 10f64.powi(i32::from(decimal.scale));
            Value::from(scaled)
        }
        AMQPValue::Void => Value::Null,
    }
}
