// src/rabbitmq/errors.rs

use thiserror::Error;

use super::connection::ConnectionState;

/// Handshake or network failure. Fatal to the connection; nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid AMQP address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection lost: {0}")]
    Lost(String),

    #[error("cannot open a connection that is {0}")]
    InvalidState(ConnectionState),

    #[error("connection closed while the handshake was in progress")]
    Aborted,
}

/// An exchange, queue, binding or channel setting was refused. The channel stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeclareError {
    #[error("channel is not ready")]
    ChannelNotReady,

    #[error("{entity} rejected by peer: {reason}")]
    Rejected { entity: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("channel is not ready")]
    ChannelNotReady,

    #[error("topology has not been declared yet")]
    TopologyNotReady,

    #[error("mandatory publishes need confirm mode to learn about unroutable messages")]
    MandatoryWithoutConfirm,

    #[error("message to exchange '{exchange}' with routing key '{routing_key}' was returned: {reply_code} {reply_text}")]
    Unroutable {
        exchange: String,
        routing_key: String,
        reply_code: u16,
        reply_text: String,
    },

    #[error("message {0} was negatively acknowledged by the peer")]
    Nacked(u64),

    #[error("publish rejected by peer: {0}")]
    Rejected(String),

    #[error("channel closed before the publish outcome was known")]
    ChannelClosed,

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumeError {
    #[error("channel is not ready")]
    ChannelNotReady,

    #[error("no delivery handler registered before starting the consumer")]
    MissingHandler,

    #[error("consumer tag '{0}' is already in use on this channel")]
    DuplicateTag(String),

    #[error("consume rejected by peer: {0}")]
    Rejected(String),
}

/// Ack/reject failures. `ChannelNotReady`, `UnknownTag` and `AlreadySettled` are kept apart
/// so callers can tell a double settlement from a dead channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("channel is not ready")]
    ChannelNotReady,

    #[error("delivery tag {0} was never delivered on this channel")]
    UnknownTag(u64),

    #[error("delivery tag {0} has already been settled")]
    AlreadySettled(u64),
}

/// Application-level payload problems, handled by the caller (usually by rejecting).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("message serialization error: {0}")]
    Encode(String),

    #[error("message deserialization error: {0}")]
    Decode(String),

    #[error("priority {0} is outside 0..=9")]
    InvalidPriority(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Declare(#[from] DeclareError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

// Custom Result type for messaging operations
pub type Result<T> = std::result::Result<T, Error>;
