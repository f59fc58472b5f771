//! In-process broker.
//!
//! Implements the [`Engine`] contract without a network so the publisher and subscriber can
//! be exercised deterministically: exchanges of every kind, queues, bindings, the default
//! exchange, per-channel delivery tags, prefetch, publisher confirms, mandatory returns and
//! requeue. Unacknowledged messages go back to their queue, marked redelivered, when a
//! connection goes away.
//!
//! It also injects the failures a real broker produces: refused or stalled handshakes,
//! severed connections, peer-initiated close, cancelled consumers, nacks and confirms that
//! never arrive.
//!
//! Not modeled: persistence, exclusive or auto-delete queues, header matching (a headers
//! exchange routes to every bound queue) and flow control.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tracing::debug;
use uuid::Uuid;

use super::address::Address;
use super::amqp_client::{ConfirmFuture, Confirmation, Engine, EngineChannel, EngineEvent, EventSink};
use super::lock;
use super::topology::{Binding, Exchange, ExchangeKind, Queue, QueueInfo};
use crate::message::{Delivery, Envelope, PublishFlags};

const NO_ROUTE: u16 = 312;

/// Shared broker state. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    handshakes_resumed: Arc<Notify>,
}

struct BrokerState {
    credentials: (String, String),
    vhosts: HashSet<String>,
    refusal: Option<String>,
    handshakes_paused: bool,
    nack_publishes: bool,
    hold_confirms: bool,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionSlot>,
    next_connection: u64,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    messages: VecDeque<Stored>,
    consumers: Vec<(u64, String)>,
    next_consumer: usize,
}

#[derive(Clone)]
struct Stored {
    envelope: Envelope,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    message: Stored,
}

struct ConnectionSlot {
    events: EventSink,
    next_tag: u64,
    prefetch: Option<u16>,
    confirm: bool,
    unacked: BTreeMap<u64, Unacked>,
    consumer_tags: HashSet<String>,
    held: Vec<(oneshot::Sender<Confirmation>, Confirmation)>,
}

impl ConnectionSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch
            .map_or(true, |limit| self.unacked.len() < limit as usize)
    }
}

impl Default for BrokerState {
    fn default() -> Self {
        let mut exchanges = HashMap::new();
        for (name, kind) in [
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.topic", ExchangeKind::Topic),
            ("amq.headers", ExchangeKind::Headers),
        ] {
            exchanges.insert(
                name.to_string(),
                ExchangeState {
                    kind,
                    durable: true,
                    bindings: Vec::new(),
                },
            );
        }

        BrokerState {
            credentials: ("guest".to_string(), "guest".to_string()),
            vhosts: HashSet::from(["/".to_string()]),
            refusal: None,
            handshakes_paused: false,
            nack_publishes: false,
            hold_confirms: false,
            exchanges,
            queues: HashMap::new(),
            connections: HashMap::new(),
            next_connection: 0,
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    /// Only accept this user and password (default `guest`/`guest`).
    pub fn with_credentials(self, username: &str, password: &str) -> Self {
        lock(&self.state).credentials = (username.to_string(), password.to_string());
        self
    }

    pub fn with_vhost(self, vhost: &str) -> Self {
        lock(&self.state).vhosts.insert(vhost.to_string());
        self
    }

    /// Fail every handshake with `reason` until called again with `None`.
    pub fn refuse_connections(&self, reason: Option<&str>) {
        lock(&self.state).refusal = reason.map(str::to_string);
    }

    /// Stall every handshake until [`resume_handshakes`](Self::resume_handshakes).
    pub fn pause_handshakes(&self) {
        lock(&self.state).handshakes_paused = true;
    }

    pub fn resume_handshakes(&self) {
        lock(&self.state).handshakes_paused = false;
        self.handshakes_resumed.notify_waiters();
    }

    /// Negatively confirm, and drop, every publish made in confirm mode.
    pub fn nack_publishes(&self, nack: bool) {
        lock(&self.state).nack_publishes = nack;
    }

    /// Keep confirms back until [`release_confirms`](Self::release_confirms). A held confirm
    /// whose connection goes away is never answered.
    pub fn hold_confirms(&self, hold: bool) {
        lock(&self.state).hold_confirms = hold;
    }

    pub fn release_confirms(&self) {
        let mut state = lock(&self.state);
        for slot in state.connections.values_mut() {
            for (reply, outcome) in slot.held.drain(..) {
                let _ = reply.send(outcome);
            }
        }
    }

    /// Confirms currently held back.
    pub fn held_confirms(&self) -> usize {
        lock(&self.state)
            .connections
            .values()
            .map(|slot| slot.held.len())
            .sum()
    }

    /// Cancel every consumer of `queue` from the broker side, as when the queue is deleted.
    pub fn cancel_consumers(&self, queue: &str) {
        let mut state = lock(&self.state);
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return;
        };
        let cancelled = std::mem::take(&mut queue_state.consumers);
        queue_state.next_consumer = 0;

        for (connection, consumer_tag) in cancelled {
            if let Some(slot) = state.connections.get_mut(&connection) {
                slot.consumer_tags.remove(&consumer_tag);
                debug!(connection, consumer_tag = %consumer_tag, "Memory broker cancelled consumer");
                let _ = slot.events.send(EngineEvent::ConsumerCancelled { consumer_tag });
            }
        }
    }

    /// Drop every open connection as if the network failed.
    pub fn sever_connections(&self, reason: &str) {
        let sinks = self.drain_connections();
        for sink in sinks {
            let _ = sink.send(EngineEvent::Error(reason.to_string()));
        }
    }

    /// Close every open connection from the broker side.
    pub fn close_connections(&self) {
        let sinks = self.drain_connections();
        for sink in sinks {
            let _ = sink.send(EngineEvent::Closed);
        }
    }

    fn drain_connections(&self) -> Vec<EventSink> {
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| state.teardown(id))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    /// Messages ready for delivery in `queue`, or `None` if it was never declared.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        lock(&self.state).queues.get(queue).map(|q| q.messages.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        lock(&self.state)
            .connections
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }
}

#[async_trait]
impl Engine for MemoryBroker {
    async fn connect(
        &self,
        address: &Address,
        events: EventSink,
    ) -> Result<Box<dyn EngineChannel>, String> {
        loop {
            let resumed = self.handshakes_resumed.notified();
            let paused = lock(&self.state).handshakes_paused;
            if !paused {
                break;
            }
            resumed.await;
        }

        let mut state = lock(&self.state);

        if let Some(reason) = &state.refusal {
            return Err(reason.clone());
        }
        if (address.username(), address.password())
            != (state.credentials.0.as_str(), state.credentials.1.as_str())
        {
            return Err(format!(
                "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN for user '{}'",
                address.username()
            ));
        }
        if !state.vhosts.contains(address.vhost()) {
            return Err(format!(
                "NOT_ALLOWED - vhost '{}' not found",
                address.vhost()
            ));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(
            id,
            ConnectionSlot {
                events,
                next_tag: 0,
                prefetch: None,
                confirm: false,
                unacked: BTreeMap::new(),
                consumer_tags: HashSet::new(),
                held: Vec::new(),
            },
        );
        debug!(connection = id, vhost = %address.vhost(), "Memory broker accepted connection");

        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
            connection: id,
        }))
    }
}

impl BrokerState {
    fn slot(&mut self, connection: u64) -> Result<&mut ConnectionSlot, String> {
        self.connections
            .get_mut(&connection)
            .ok_or_else(|| "CHANNEL_ERROR - channel is closed".to_string())
    }

    fn declare_exchange(&mut self, exchange: &Exchange) -> Result<(), String> {
        if exchange.name.is_empty() {
            return Err("ACCESS_REFUSED - operation not permitted on the default exchange".to_string());
        }

        match self.exchanges.get(&exchange.name) {
            Some(existing) if existing.kind != exchange.kind || existing.durable != exchange.durable => {
                Err(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    exchange.name, exchange.kind, existing.kind
                ))
            }
            Some(_) => Ok(()),
            None if exchange.name.starts_with("amq.") => Err(format!(
                "ACCESS_REFUSED - exchange name '{}' contains reserved prefix 'amq.*'",
                exchange.name
            )),
            None => {
                self.exchanges.insert(
                    exchange.name.clone(),
                    ExchangeState {
                        kind: exchange.kind,
                        durable: exchange.durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, queue: &Queue) -> Result<QueueInfo, String> {
        let name = if queue.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            queue.name.clone()
        };

        let state = self.queues.entry(name.clone()).or_insert_with(|| QueueState {
            durable: queue.durable,
            ..QueueState::default()
        });
        if state.durable != queue.durable {
            return Err(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                name
            ));
        }

        Ok(QueueInfo {
            name,
            message_count: state.messages.len() as u32,
            consumer_count: state.consumers.len() as u32,
        })
    }

    fn bind_queue(&mut self, binding: &Binding) -> Result<(), String> {
        if binding.exchange.is_empty() {
            return Err("ACCESS_REFUSED - operation not permitted on the default exchange".to_string());
        }
        if !self.queues.contains_key(&binding.queue) {
            return Err(format!("NOT_FOUND - no queue '{}'", binding.queue));
        }
        let exchange = self
            .exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| format!("NOT_FOUND - no exchange '{}'", binding.exchange))?;

        let entry = (binding.queue.clone(), binding.routing_key.clone());
        if !exchange.bindings.contains(&entry) {
            exchange.bindings.push(entry);
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, String> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| format!("NOT_FOUND - no exchange '{}'", exchange))?;

        let mut routed: Vec<String> = Vec::new();
        for (queue, binding_key) in &state.bindings {
            let hit = match state.kind {
                ExchangeKind::Direct => binding_key == routing_key,
                ExchangeKind::Topic => topic_matches(binding_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if hit && !routed.contains(queue) {
                routed.push(queue.clone());
            }
        }
        Ok(routed)
    }

    fn publish(
        &mut self,
        connection: u64,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        flags: PublishFlags,
    ) -> Result<Confirmation, String> {
        let confirm = self.slot(connection)?.confirm;
        if confirm && self.nack_publishes {
            return Ok(Confirmation::Nack);
        }
        let routed = self.route(exchange, routing_key)?;

        if routed.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message is unroutable");
            // Without confirms the peer has no way to hand the message back.
            if flags.mandatory && confirm {
                return Ok(Confirmation::Returned {
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                });
            }
        }

        for queue in routed {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.messages.push_back(Stored {
                    envelope: envelope.clone(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
            }
        }
        self.pump();

        Ok(if confirm {
            Confirmation::Ack
        } else {
            Confirmation::NotRequested
        })
    }

    fn consume(&mut self, connection: u64, queue: &str, consumer_tag: &str) -> Result<(), String> {
        if !self.queues.contains_key(queue) {
            return Err(format!("NOT_FOUND - no queue '{}'", queue));
        }
        let slot = self.slot(connection)?;
        if !slot.consumer_tags.insert(consumer_tag.to_string()) {
            return Err(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                consumer_tag
            ));
        }
        if let Some(state) = self.queues.get_mut(queue) {
            state.consumers.push((connection, consumer_tag.to_string()));
        }
        self.pump();
        Ok(())
    }

    fn settle(&mut self, connection: u64, delivery_tag: u64, requeue: Option<bool>) -> Result<(), String> {
        let unacked = self
            .slot(connection)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag))?;

        if requeue == Some(true) {
            if let Some(state) = self.queues.get_mut(&unacked.queue) {
                state.messages.push_front(Stored {
                    redelivered: true,
                    ..unacked.message
                });
            }
        }
        self.pump();
        Ok(())
    }

    /// Remove a connection, requeueing what it left unacked. Returns its event sink.
    fn teardown(&mut self, connection: u64) -> Option<EventSink> {
        let slot = self.connections.remove(&connection)?;

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|(owner, _)| *owner != connection);
            queue.next_consumer = 0;
        }
        // Highest tag first so the original order is restored at the head of the queue.
        for (_, unacked) in slot.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.messages.push_front(Stored {
                    redelivered: true,
                    ..unacked.message
                });
            }
        }

        debug!(connection, "Memory broker connection torn down");
        self.pump();
        Some(slot.events)
    }

    /// Deliver ready messages round-robin to consumers with prefetch capacity.
    fn pump(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.pump_queue(&name);
        }
    }

    fn pump_queue(&mut self, name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    self.connections
                        .get(&queue.consumers[idx].0)
                        .is_some_and(ConnectionSlot::has_capacity)
                });
            let Some(idx) = chosen else {
                return;
            };

            queue.next_consumer = (idx + 1) % count;
            let (connection, consumer_tag) = queue.consumers[idx].clone();
            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            let Some(slot) = self.connections.get_mut(&connection) else {
                return;
            };

            slot.next_tag += 1;
            let delivery = Delivery {
                message: message.envelope.clone(),
                delivery_tag: slot.next_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
            };
            slot.unacked.insert(
                slot.next_tag,
                Unacked {
                    queue: name.to_string(),
                    message,
                },
            );
            let _ = slot.events.send(EngineEvent::Delivery {
                consumer_tag,
                delivery,
            });
        }
    }
}

enum PendingConfirm {
    Ready(Confirmation),
    Held(oneshot::Receiver<Confirmation>),
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
}

impl MemoryChannel {
    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T, String>) -> Result<T, String> {
        let mut state = lock(&self.broker.state);
        state.slot(self.connection)?;
        f(&mut *state)
    }
}

#[async_trait]
impl EngineChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), String> {
        self.with_state(|state| state.declare_exchange(exchange))
    }

    async fn declare_queue(&self, queue: &Queue) -> Result<QueueInfo, String> {
        self.with_state(|state| state.declare_queue(queue))
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), String> {
        self.with_state(|state| state.bind_queue(binding))
    }

    async fn set_qos(&self, prefetch_count: u16) -> Result<(), String> {
        self.with_state(|state| {
            state.slot(self.connection)?.prefetch = (prefetch_count > 0).then_some(prefetch_count);
            state.pump();
            Ok(())
        })
    }

    async fn enable_confirm(&self) -> Result<(), String> {
        self.with_state(|state| {
            state.slot(self.connection)?.confirm = true;
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        flags: PublishFlags,
    ) -> Result<ConfirmFuture, String> {
        let connection = self.connection;
        let pending = self.with_state(|state| {
            let outcome = state.publish(connection, exchange, routing_key, envelope, flags)?;
            if !state.hold_confirms || outcome == Confirmation::NotRequested {
                return Ok(PendingConfirm::Ready(outcome));
            }
            let (reply, held) = oneshot::channel();
            state.slot(connection)?.held.push((reply, outcome));
            Ok(PendingConfirm::Held(held))
        })?;

        Ok(match pending {
            PendingConfirm::Ready(outcome) => Box::pin(futures::future::ready(Ok(outcome))),
            PendingConfirm::Held(held) => Box::pin(async move {
                match held.await {
                    Ok(outcome) => Ok(outcome),
                    Err(_) => futures::future::pending().await,
                }
            }),
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<(), String> {
        self.with_state(|state| state.consume(self.connection, queue, consumer_tag))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), String> {
        self.with_state(|state| state.settle(self.connection, delivery_tag, None))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), String> {
        self.with_state(|state| state.settle(self.connection, delivery_tag, Some(requeue)))
    }

    async fn close(&self) -> Result<(), String> {
        lock(&self.broker.state).teardown(self.connection);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        lock(&self.broker.state).teardown(self.connection);
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && match_words(rest, &words[1..]),
    }
}
