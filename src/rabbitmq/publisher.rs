use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::address::Address;
use super::amqp_client::Engine;
use super::channel_manager::ChannelContext;
use super::connection::{ConnectionEvents, ConnectionState, TransportHandle};
use super::errors::{Error, PublishError, TransportError};
use super::lock;
use super::topology::{Exchange, ExchangeKind, TopologyDeclarator};
use crate::message::{DeliveryMode, Envelope, EnvelopeBuilder, PublishFlags};

fn default_exchange() -> String {
    "amq_facade_exchange".to_string()
}

fn default_routing_key() -> String {
    "facade.message".to_string()
}

/// Where and how a [`Publisher`] publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default)]
    pub exchange_kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    /// Wait for the peer to confirm every publish.
    #[serde(default)]
    pub confirm: bool,
    /// Fail publishes that no queue is bound for.
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            exchange: default_exchange(),
            exchange_kind: ExchangeKind::Direct,
            durable: false,
            routing_key: default_routing_key(),
            confirm: false,
            mandatory: false,
            content_type: None,
            delivery_mode: DeliveryMode::Transient,
            priority: None,
        }
    }
}

impl PublisherConfig {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        PublisherConfig {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            ..PublisherConfig::default()
        }
    }
}

/// Publishes to one exchange with one routing key.
pub struct Publisher {
    config: PublisherConfig,
    transport: TransportHandle,
    // Channel on which the exchange was last declared.
    topology_ready_on: Mutex<Option<String>>,
    published: AtomicU64,
}

impl Publisher {
    pub fn new(engine: Arc<dyn Engine>, config: PublisherConfig) -> Self {
        Publisher {
            config,
            transport: TransportHandle::new(engine),
            topology_ready_on: Mutex::new(None),
            published: AtomicU64::new(0),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn ConnectionEvents>) -> Self {
        self.transport = self.transport.with_events(events);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.config.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.config.routing_key
    }

    /// Messages accepted so far. Never decreases.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Open the connection and declare the exchange. A connected publisher returns `Ok`
    /// without doing anything.
    pub async fn connect(&self, address: &str) -> Result<(), Error> {
        if let Some(channel) = self.transport.channel() {
            if self.topology_ready(&channel) {
                info!(exchange = %self.config.exchange, "Publisher already connected");
                return Ok(());
            }
        }

        let channel = match self.transport.channel() {
            Some(channel) if channel.is_ready() => channel,
            _ => {
                let address: Address = address.parse()?;
                self.transport.open(&address).await?
            }
        };

        if self.config.confirm || self.config.mandatory {
            // Returns of unroutable messages are only reported with confirms enabled.
            channel.enable_confirm().await?;
        }

        if !self.config.exchange.is_empty() {
            let exchange = Exchange::new(
                self.config.exchange.clone(),
                self.config.exchange_kind,
                self.config.durable,
            );
            TopologyDeclarator::new(channel.clone())
                .declare_exchange(&exchange)
                .await?;
        }

        *lock(&self.topology_ready_on) = Some(channel.id().to_string());
        info!(
            channel_id = %channel.id(),
            exchange = %self.config.exchange,
            routing_key = %self.config.routing_key,
            "Publisher ready"
        );
        Ok(())
    }

    fn topology_ready(&self, channel: &ChannelContext) -> bool {
        channel.is_ready() && lock(&self.topology_ready_on).as_deref() == Some(channel.id())
    }

    /// Publish `payload` with the configured defaults.
    pub async fn publish(&self, payload: impl Into<Vec<u8>>) -> Result<(), PublishError> {
        let envelope = self.apply_defaults(Envelope::builder(payload)).build()?;
        self.publish_envelope(envelope).await
    }

    /// Publish `value` serialized as JSON.
    pub async fn publish_json<T: Serialize>(&self, value: &T) -> Result<(), PublishError> {
        let envelope = self.apply_defaults(Envelope::json(value)?).build()?;
        self.publish_envelope(envelope).await
    }

    /// Publish a prepared envelope as is. In confirm or mandatory mode this waits for the
    /// peer outcome; only accepted messages are counted.
    pub async fn publish_envelope(&self, envelope: Envelope) -> Result<(), PublishError> {
        let result = self.try_publish(envelope).await;
        match &result {
            Ok(()) => {
                let count = self.published.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(
                    exchange = %self.config.exchange,
                    routing_key = %self.config.routing_key,
                    published = count,
                    "Message published"
                );
            }
            Err(e) => error!(
                exchange = %self.config.exchange,
                routing_key = %self.config.routing_key,
                "Publish failed: {}",
                e
            ),
        }
        result
    }

    async fn try_publish(&self, envelope: Envelope) -> Result<(), PublishError> {
        let channel = self
            .transport
            .channel()
            .filter(ChannelContext::is_ready)
            .ok_or(PublishError::ChannelNotReady)?;
        if !self.topology_ready(&channel) {
            return Err(PublishError::TopologyNotReady);
        }

        let flags = PublishFlags {
            mandatory: self.config.mandatory,
        };
        let publication = channel.publish(
            &self.config.exchange,
            &self.config.routing_key,
            envelope,
            flags,
        )?;

        if self.config.confirm || self.config.mandatory {
            publication.confirmed().await?;
        }
        Ok(())
    }

    fn apply_defaults(&self, builder: EnvelopeBuilder) -> EnvelopeBuilder {
        let mut builder = builder.delivery_mode(self.config.delivery_mode);
        if let Some(content_type) = &self.config.content_type {
            builder = builder.content_type(content_type.clone());
        }
        if let Some(priority) = self.config.priority {
            builder = builder.priority(priority);
        }
        builder
    }

    /// Resolves once the connection is no longer alive.
    pub async fn run(&self) -> ConnectionState {
        self.transport.closed().await
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        lock(&self.topology_ready_on).take();
        self.transport.close().await
    }
}
