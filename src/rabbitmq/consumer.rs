use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::address::Address;
use super::amqp_client::Engine;
use super::channel_manager::{ChannelContext, ConsumerSession};
use super::connection::{ConnectionEvents, ConnectionState, NoEvents, TransportHandle};
use super::errors::{ConsumeError, Error, SettlementError, TransportError};
use super::lock;
use super::topology::{Binding, Exchange, ExchangeKind, Queue, TopologyDeclarator};
use crate::message::Delivery;

type SharedHandler = Arc<Mutex<dyn FnMut(&Delivery, &ChannelContext) + Send>>;

fn default_exchange() -> String {
    "amq_facade_exchange".to_string()
}

fn default_queue() -> String {
    "amq_facade_queue".to_string()
}

fn default_routing_key() -> String {
    "facade.message".to_string()
}

/// What a [`Subscriber`] declares and consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Empty means consume straight from the queue without declaring or binding an exchange.
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default)]
    pub exchange_kind: ExchangeKind,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    /// Applies to both the exchange and the queue.
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub prefetch_count: Option<u16>,
    /// Fixed consumer tag; generated when absent.
    #[serde(default)]
    pub consumer_tag: Option<String>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        SubscriberConfig {
            exchange: default_exchange(),
            exchange_kind: ExchangeKind::Direct,
            queue: default_queue(),
            routing_key: default_routing_key(),
            durable: false,
            prefetch_count: None,
            consumer_tag: None,
        }
    }
}

impl SubscriberConfig {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        SubscriberConfig {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            ..SubscriberConfig::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubscriberState {
    #[default]
    Idle,
    Connecting,
    ExchangeDeclared,
    QueueDeclared,
    Bound,
    Consuming,
    Closed,
    Failed,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriberState::Idle => "idle",
            SubscriberState::Connecting => "connecting",
            SubscriberState::ExchangeDeclared => "exchange declared",
            SubscriberState::QueueDeclared => "queue declared",
            SubscriberState::Bound => "bound",
            SubscriberState::Consuming => "consuming",
            SubscriberState::Closed => "closed",
            SubscriberState::Failed => "failed",
        };
        f.write_str(name)
    }
}

// Tracks connection teardown in the subscriber state before passing events on.
struct SubscriberEvents {
    state: Arc<Mutex<SubscriberState>>,
    inner: Arc<dyn ConnectionEvents>,
}

impl ConnectionEvents for SubscriberEvents {
    fn on_connected(&self) {
        self.inner.on_connected();
    }

    fn on_error(&self, error: &TransportError) {
        *lock(&self.state) = SubscriberState::Failed;
        self.inner.on_error(error);
    }

    fn on_closed(&self) {
        *lock(&self.state) = SubscriberState::Closed;
        self.inner.on_closed();
    }
}

/// Consumes one queue bound to one exchange and hands every delivery to a callback.
pub struct Subscriber {
    config: SubscriberConfig,
    engine: Arc<dyn Engine>,
    transport: TransportHandle,
    state: Arc<Mutex<SubscriberState>>,
    received: Arc<AtomicU64>,
    handler: Option<SharedHandler>,
    session: Mutex<Option<ConsumerSession>>,
}

impl Subscriber {
    pub fn new(engine: Arc<dyn Engine>, config: SubscriberConfig) -> Self {
        let state = Arc::new(Mutex::new(SubscriberState::Idle));
        let transport = TransportHandle::new(engine.clone()).with_events(Arc::new(SubscriberEvents {
            state: state.clone(),
            inner: Arc::new(NoEvents),
        }));

        Subscriber {
            config,
            engine,
            transport,
            state,
            received: Arc::new(AtomicU64::new(0)),
            handler: None,
            session: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn ConnectionEvents>) -> Self {
        self.transport = TransportHandle::new(self.engine.clone()).with_events(Arc::new(SubscriberEvents {
            state: self.state.clone(),
            inner: events,
        }));
        self
    }

    /// Set the delivery callback. It runs on the reactor and must settle each delivery
    /// exactly once through the channel it is given.
    pub fn on_delivery<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Delivery, &ChannelContext) + Send + 'static,
    {
        self.handler = Some(Arc::new(Mutex::new(handler)));
        self
    }

    pub fn exchange(&self) -> &str {
        &self.config.exchange
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.config.routing_key
    }

    pub fn state(&self) -> SubscriberState {
        *lock(&self.state)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Deliveries handed to the callback so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub fn consumer_tag(&self) -> Option<String> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.consumer_tag().to_string())
    }

    /// Channel of the current connect cycle, while connected.
    pub fn channel(&self) -> Option<ChannelContext> {
        self.transport.channel()
    }

    fn set_state(&self, next: SubscriberState) {
        let mut state = lock(&self.state);
        let previous = *state;
        let torn_down = matches!(previous, SubscriberState::Closed | SubscriberState::Failed)
            && self.transport.state().is_terminal();
        if torn_down && next != SubscriberState::Connecting {
            // The connection ended under a running pipeline; only a new connect moves on.
            return;
        }
        if previous != next {
            info!(queue = %self.config.queue, from = %previous, to = %next, "Subscriber state changed");
            *state = next;
        }
    }

    /// Connect, then declare the exchange, declare the queue, bind, apply prefetch and start
    /// consuming. Each step runs only after the previous one succeeded; the first failure
    /// leaves the subscriber Failed and stops the chain.
    pub async fn connect(&self, address: &str) -> Result<(), Error> {
        if self.state() == SubscriberState::Consuming
            && self.channel().is_some_and(|channel| channel.is_ready())
        {
            info!(queue = %self.config.queue, "Subscriber already consuming");
            return Ok(());
        }

        let handler = self.handler.clone().ok_or(ConsumeError::MissingHandler)?;

        self.set_state(SubscriberState::Connecting);
        let result = self.establish(address, handler).await;
        if let Err(e) = &result {
            error!(queue = %self.config.queue, "Subscriber setup failed: {}", e);
            self.set_state(SubscriberState::Failed);
        }
        result
    }

    async fn establish(&self, address: &str, handler: SharedHandler) -> Result<(), Error> {
        // A failed declare leaves the connection up; retry the pipeline on it.
        let channel = match self.transport.channel() {
            Some(channel) if channel.is_ready() => channel,
            _ => {
                let address: Address = address.parse()?;
                self.transport.open(&address).await?
            }
        };
        let declarator = TopologyDeclarator::new(channel.clone());
        let config = &self.config;

        if !config.exchange.is_empty() {
            let exchange = Exchange::new(config.exchange.clone(), config.exchange_kind, config.durable);
            declarator.declare_exchange(&exchange).await?;
            self.set_state(SubscriberState::ExchangeDeclared);
        }

        let queue = declarator
            .declare_queue(&Queue::new(config.queue.clone(), config.durable))
            .await?;
        self.set_state(SubscriberState::QueueDeclared);

        if !config.exchange.is_empty() {
            let binding = Binding::new(config.exchange.clone(), queue.name.clone(), config.routing_key.clone());
            declarator.bind_queue(&binding).await?;
            self.set_state(SubscriberState::Bound);
        }

        if let Some(prefetch_count) = config.prefetch_count {
            channel.set_qos(prefetch_count).await?;
        }

        let received = self.received.clone();
        let mut builder = channel
            .consume(queue.name.clone())
            .on_delivery(move |delivery, channel| {
                received.fetch_add(1, Ordering::AcqRel);
                let mut handler = lock(&handler);
                (&mut *handler)(delivery, channel);
            });
        if let Some(tag) = &config.consumer_tag {
            builder = builder.consumer_tag(tag.clone());
        }

        let session = builder.start().await?;
        info!(
            consumer_tag = %session.consumer_tag(),
            queue = %queue.name,
            "Subscriber consuming"
        );
        *lock(&self.session) = Some(session);
        self.set_state(SubscriberState::Consuming);
        Ok(())
    }

    fn ready_channel(&self) -> Result<ChannelContext, SettlementError> {
        self.transport
            .channel()
            .ok_or(SettlementError::ChannelNotReady)
    }

    pub fn ack(&self, delivery_tag: u64) -> Result<(), SettlementError> {
        self.ready_channel()?.ack(delivery_tag)
    }

    /// Reject and discard.
    pub fn reject(&self, delivery_tag: u64) -> Result<(), SettlementError> {
        self.ready_channel()?.reject(delivery_tag, false)
    }

    /// Reject and hand back to the queue for redelivery.
    pub fn requeue(&self, delivery_tag: u64) -> Result<(), SettlementError> {
        self.ready_channel()?.reject(delivery_tag, true)
    }

    /// Resolves once the connection is no longer alive.
    pub async fn run(&self) -> ConnectionState {
        self.transport.closed().await
    }

    /// Close the connection. `Closed` is reported through the connection events.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.close().await
    }
}
