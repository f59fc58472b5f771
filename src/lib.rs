//! Client façade for AMQP publish/subscribe.
//!
//! A [`rabbitmq::TransportHandle`] owns one connection and its state machine, a
//! [`rabbitmq::ChannelContext`] carries the declare, publish, consume and settlement
//! operations of that connection, and [`rabbitmq::Publisher`] / [`rabbitmq::Subscriber`]
//! put a fixed topology on top. The wire protocol lives behind [`rabbitmq::Engine`]:
//! [`rabbitmq::LapinEngine`] talks to a real broker, [`rabbitmq::MemoryBroker`] runs in
//! process.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use message::{Delivery, DeliveryMode, Envelope, HeaderValue, PublishFlags};
