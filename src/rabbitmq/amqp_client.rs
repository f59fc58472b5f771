// src/rabbitmq/amqp_client.rs
//
// The protocol engine seam. The wire codec and frame multiplexing belong to the engine;
// everything above this file only sees `Engine`, `EngineChannel` and `EngineEvent`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures_lite::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind as LapinExchangeKind,
};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::address::Address;
use super::topology::{Binding, Exchange, ExchangeKind, Queue, QueueInfo};
use crate::message::{DeliveryMode, Delivery, Envelope, HeaderValue, PublishFlags};

/// Events an engine reports after a successful handshake.
#[derive(Debug)]
pub enum EngineEvent {
    Delivery { consumer_tag: String, delivery: Delivery },
    /// Unrecoverable transport error.
    Error(String),
    /// The peer closed the connection.
    Closed,
    /// The peer cancelled a consumer, for instance because its queue was deleted.
    ConsumerCancelled { consumer_tag: String },
}

pub type EventSink = mpsc::UnboundedSender<EngineEvent>;

/// Peer outcome of a single publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// A mandatory message could not be routed.
    Returned { reply_code: u16, reply_text: String },
    /// Confirm mode is off and the message was routable (or not mandatory).
    NotRequested,
}

pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation, String>>;

/// Opens connections. Engine failures are reported as the peer's reason text.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Perform the handshake and open the logical channel. Asynchronous events for the new
    /// connection are pushed into `events` until it is closed.
    async fn connect(
        &self,
        address: &Address,
        events: EventSink,
    ) -> Result<Box<dyn EngineChannel>, String>;
}

/// One open channel on one open connection.
#[async_trait]
pub trait EngineChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), String>;

    async fn declare_queue(&self, queue: &Queue) -> Result<QueueInfo, String>;

    async fn bind_queue(&self, binding: &Binding) -> Result<(), String>;

    async fn set_qos(&self, prefetch_count: u16) -> Result<(), String>;

    async fn enable_confirm(&self) -> Result<(), String>;

    /// Enqueue a publish. The returned future resolves to the peer outcome.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        flags: PublishFlags,
    ) -> Result<ConfirmFuture, String>;

    /// Start consuming. Deliveries arrive as `EngineEvent::Delivery` tagged with `consumer_tag`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<(), String>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), String>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), String>;

    async fn close(&self) -> Result<(), String>;
}

/// Engine backed by a real broker connection through `lapin`.
#[derive(Clone, Debug, Default)]
pub struct LapinEngine;

impl LapinEngine {
    pub fn new() -> Self {
        LapinEngine
    }
}

#[async_trait]
impl Engine for LapinEngine {
    async fn connect(
        &self,
        address: &Address,
        events: EventSink,
    ) -> Result<Box<dyn EngineChannel>, String> {
        info!("Connecting to RabbitMQ at {}", address);

        let connection = Connection::connect(address.as_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| e.to_string())?;

        let error_sink = events.clone();
        connection.on_error(move |err| {
            let event = if is_peer_close(&err) {
                info!("RabbitMQ closed the connection: {}", err);
                EngineEvent::Closed
            } else {
                error!("RabbitMQ connection error: {}", err);
                EngineEvent::Error(err.to_string())
            };
            let _ = error_sink.send(event);
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| format!("Failed to create channel: {}", e))?;

        debug!(channel_id = channel.id(), "Channel created");

        Ok(Box::new(LapinChannel {
            connection,
            channel,
            events,
        }))
    }
}

/// lapin reports a server-side Connection.Close through `on_error`. A clean close
/// (reply 200) shows up as the connection turning `Closed`, an administrative one as
/// CONNECTION_FORCED (320). Anything else is a failure.
fn is_peer_close(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed) => true,
        lapin::Error::ProtocolError(amqp_error) => amqp_error.get_id() == CONNECTION_FORCED,
        _ => false,
    }
}

const CONNECTION_FORCED: u16 = 320;

struct LapinChannel {
    connection: Connection,
    channel: Channel,
    events: EventSink,
}

#[async_trait]
impl EngineChannel for LapinChannel {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), String> {
        self.channel
            .exchange_declare(
                &exchange.name,
                to_lapin_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| e.to_string())
    }

    async fn declare_queue(&self, queue: &Queue) -> Result<QueueInfo, String> {
        let declared = self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| e.to_string())?;

        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), String> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| e.to_string())
    }

    async fn set_qos(&self, prefetch_count: u16) -> Result<(), String> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| e.to_string())
    }

    async fn enable_confirm(&self) -> Result<(), String> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| e.to_string())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        flags: PublishFlags,
    ) -> Result<ConfirmFuture, String> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: flags.mandatory,
                    ..BasicPublishOptions::default()
                },
                envelope.body(),
                to_properties(envelope),
            )
            .await
            .map_err(|e| e.to_string())?;

        Ok(Box::pin(async move {
            match confirm.await.map_err(|e| e.to_string())? {
                LapinConfirmation::Ack(Some(returned)) | LapinConfirmation::Nack(Some(returned)) => {
                    Ok(Confirmation::Returned {
                        reply_code: returned.reply_code,
                        reply_text: returned.reply_text.as_str().to_string(),
                    })
                }
                LapinConfirmation::Ack(None) => Ok(Confirmation::Ack),
                LapinConfirmation::Nack(None) => Ok(Confirmation::Nack),
                LapinConfirmation::NotRequested => Ok(Confirmation::NotRequested),
            }
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<(), String> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| e.to_string())?;

        let sink = self.events.clone();
        let consumer_tag = consumer_tag.to_string();

        tokio::spawn(async move {
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let delivery = from_lapin_delivery(delivery);
                        let event = EngineEvent::Delivery {
                            consumer_tag: consumer_tag.clone(),
                            delivery,
                        };
                        if sink.send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving message: {}", e);
                        let _ = sink.send(EngineEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            // The stream ends when the broker cancels the consumer or the channel goes away.
            debug!(consumer_tag = %consumer_tag, "Consumer stream ended");
            let _ = sink.send(EngineEvent::ConsumerCancelled { consumer_tag });
        });

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), String> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| e.to_string())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), String> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| e.to_string())
    }

    async fn close(&self) -> Result<(), String> {
        info!("Closing RabbitMQ connection gracefully");
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| e.to_string())
    }
}

fn to_lapin_kind(kind: ExchangeKind) -> LapinExchangeKind {
    match kind {
        ExchangeKind::Direct => LapinExchangeKind::Direct,
        ExchangeKind::Fanout => LapinExchangeKind::Fanout,
        ExchangeKind::Topic => LapinExchangeKind::Topic,
        ExchangeKind::Headers => LapinExchangeKind::Headers,
    }
}

fn to_properties(envelope: &Envelope) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_delivery_mode(envelope.delivery_mode().as_u8())
        .with_message_id(uuid::Uuid::new_v4().to_string().into())
        .with_timestamp(chrono::Utc::now().timestamp() as u64);

    if let Some(priority) = envelope.priority() {
        properties = properties.with_priority(priority);
    }
    if let Some(content_type) = envelope.content_type() {
        properties = properties.with_content_type(content_type.to_string().into());
    }
    if !envelope.headers().is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in envelope.headers() {
            headers.insert(ShortString::from(key.clone()), to_amqp_value(value));
        }
        properties = properties.with_headers(headers);
    }

    properties
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::Str(v) => AMQPValue::LongString(v.clone().into()),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    Some(match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(*v as i64),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(*v as i64),
        AMQPValue::ShortInt(v) => HeaderValue::Int(*v as i64),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(*v as i64),
        AMQPValue::LongInt(v) => HeaderValue::Int(*v as i64),
        AMQPValue::LongUInt(v) => HeaderValue::Int(*v as i64),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Timestamp(v) => HeaderValue::Int(*v as i64),
        AMQPValue::Float(v) => HeaderValue::Float(*v as f64),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::ShortString(v) => HeaderValue::Str(v.as_str().to_string()),
        AMQPValue::LongString(v) => HeaderValue::Str(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        // Arrays, nested tables and raw bytes are not scalar headers.
        _ => return None,
    })
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;

    let mut builder = Envelope::builder(delivery.data.clone());
    if let Some(mode) = (*properties.delivery_mode()).and_then(DeliveryMode::from_u8) {
        builder = builder.delivery_mode(mode);
    }
    if let Some(priority) = *properties.priority() {
        builder = builder.priority(priority);
    }
    if let Some(content_type) = properties.content_type() {
        builder = builder.content_type(content_type.as_str());
    }
    if let Some(headers) = properties.headers() {
        let scalars: BTreeMap<_, _> = headers
            .inner()
            .iter()
            .filter_map(|(k, v)| from_amqp_value(v).map(|v| (k.as_str().to_string(), v)))
            .collect();
        for (key, value) in scalars {
            builder = builder.header(key, value);
        }
    }

    // The broker is the authority on priority; keep the message even if it is out of range.
    let message = match builder.build() {
        Ok(message) => message,
        Err(_) => Envelope::new(delivery.data.clone()),
    };

    Delivery {
        message,
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
    }
}
