// src/rabbitmq/mod.rs
// Connection lifecycle, channel operations and the publisher/subscriber built on them

pub mod address;
pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod memory;
pub mod publisher;
pub mod topology;
pub mod tokio_exec;

use std::sync::{Mutex, MutexGuard};

pub use address::Address;
pub use amqp_client::{Engine, EngineChannel, EngineEvent, LapinEngine};
pub use channel_manager::{ChannelContext, ConsumerSession, PendingAckSet, Publication};
pub use connection::{ConnectionEvents, ConnectionState, NoEvents, TransportHandle};
pub use consumer::{Subscriber, SubscriberConfig, SubscriberState};
pub use errors::{
    ConsumeError, DeclareError, Error, PayloadError, PublishError, Result, SettlementError,
    TransportError,
};
pub use memory::MemoryBroker;
pub use publisher::{Publisher, PublisherConfig};
pub use topology::{
    Binding, Exchange, ExchangeKind, Queue, QueueInfo, Topology, TopologyDeclarator,
};
pub use tokio_exec::Reactor;

// Lock state guarded by a std mutex, recovering the data if a user callback panicked while
// holding it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
