use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::channel_manager::ChannelContext;
use super::errors::DeclareError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        })
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(format!("unknown exchange kind '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Exchange {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
}

impl Exchange {
    pub fn new(name: impl Into<String>, kind: ExchangeKind, durable: bool) -> Self {
        Exchange {
            name: name.into(),
            kind,
            durable,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Exchange::new(name, ExchangeKind::Direct, false)
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
}

impl Queue {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Queue {
            name: name.into(),
            durable,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Binding {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Result of a queue declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Declaration {
    Exchange(Exchange),
    Queue(Queue),
    Binding(Binding),
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Declaration::Exchange(e) => write!(f, "exchange '{}' ({})", e.name, e.kind),
            Declaration::Queue(q) => write!(f, "queue '{}'", q.name),
            Declaration::Binding(b) => write!(
                f,
                "binding '{}' -> '{}' ({})",
                b.exchange, b.queue, b.routing_key
            ),
        }
    }
}

/// Ordered declarative intent. Re-issued on every connect; nothing is cached between cycles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    declarations: Vec<Declaration>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    pub fn exchange(mut self, exchange: Exchange) -> Self {
        self.declarations.push(Declaration::Exchange(exchange));
        self
    }

    pub fn queue(mut self, queue: Queue) -> Self {
        self.declarations.push(Declaration::Queue(queue));
        self
    }

    pub fn bind(mut self, binding: Binding) -> Self {
        self.declarations.push(Declaration::Binding(binding));
        self
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

/// What a completed [`TopologyDeclarator::declare_all`] run established.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyReport {
    pub completed: usize,
    pub queues: Vec<QueueInfo>,
}

/// Issues declarations on a channel and reports each outcome.
#[derive(Clone)]
pub struct TopologyDeclarator {
    channel: ChannelContext,
}

impl TopologyDeclarator {
    pub fn new(channel: ChannelContext) -> Self {
        TopologyDeclarator { channel }
    }

    pub async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), DeclareError> {
        let result = self.channel.declare_exchange(exchange).await;
        log_outcome(self.channel.id(), &Declaration::Exchange(exchange.clone()), &result);
        result
    }

    pub async fn declare_queue(&self, queue: &Queue) -> Result<QueueInfo, DeclareError> {
        let result = self.channel.declare_queue(queue).await;
        match &result {
            Ok(info) => info!(
                channel_id = %self.channel.id(),
                "Queue '{}' declared with {} messages and {} consumers",
                info.name, info.message_count, info.consumer_count
            ),
            Err(e) => error!(channel_id = %self.channel.id(), "Failed to declare queue '{}': {}", queue.name, e),
        }
        result
    }

    pub async fn bind_queue(&self, binding: &Binding) -> Result<(), DeclareError> {
        let result = self.channel.bind_queue(binding).await;
        log_outcome(self.channel.id(), &Declaration::Binding(binding.clone()), &result);
        result
    }

    /// Declare everything in order. Each step starts only after the previous one succeeded;
    /// the first failure stops the run and nothing after it is attempted.
    pub async fn declare_all(&self, topology: &Topology) -> Result<TopologyReport, DeclareError> {
        let mut report = TopologyReport::default();

        for declaration in topology.declarations() {
            match declaration {
                Declaration::Exchange(exchange) => self.declare_exchange(exchange).await?,
                Declaration::Queue(queue) => report.queues.push(self.declare_queue(queue).await?),
                Declaration::Binding(binding) => self.bind_queue(binding).await?,
            }
            report.completed += 1;
        }

        debug!(channel_id = %self.channel.id(), declarations = report.completed, "Topology ready");
        Ok(report)
    }
}

fn log_outcome(channel_id: &str, declaration: &Declaration, result: &Result<(), DeclareError>) {
    match result {
        Ok(()) => info!(channel_id = %channel_id, "Declared {}", declaration),
        Err(e) => error!(channel_id = %channel_id, "Failed to declare {}: {}", declaration, e),
    }
}
