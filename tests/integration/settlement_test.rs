use std::sync::Arc;

use rabbit_facade::rabbitmq::{MemoryBroker, SettlementError, Subscriber};
use tokio::sync::mpsc;

use crate::helper::{assert_quiet, orders_publisher, orders_subscriber_config, recv, ADDR};

type Seen = (u64, bool, String);

// Subscriber whose handler only reports deliveries, leaving settlement to the test.
async fn manual_subscriber(
    broker: &MemoryBroker,
) -> (Subscriber, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(Arc::new(broker.clone()), orders_subscriber_config())
        .on_delivery(move |delivery, _| {
            let _ = tx.send((
                delivery.delivery_tag,
                delivery.redelivered,
                delivery.body_str().into_owned(),
            ));
        });
    subscriber.connect(ADDR).await.unwrap();
    (subscriber, rx)
}

#[tokio::test]
async fn test_settle_before_connect() {
    let broker = MemoryBroker::new();
    let subscriber = Subscriber::new(Arc::new(broker), orders_subscriber_config())
        .on_delivery(|_, _| {});

    assert_eq!(subscriber.ack(1), Err(SettlementError::ChannelNotReady));
    assert_eq!(subscriber.requeue(1), Err(SettlementError::ChannelNotReady));
}

#[tokio::test]
async fn test_double_settlement_is_reported() {
    let broker = MemoryBroker::new();
    let (subscriber, mut rx) = manual_subscriber(&broker).await;
    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    publisher.publish("once").await.unwrap();

    let (tag, _, _) = recv(&mut rx).await;
    subscriber.ack(tag).unwrap();

    assert_eq!(subscriber.ack(tag), Err(SettlementError::AlreadySettled(tag)));
    assert_eq!(subscriber.reject(tag), Err(SettlementError::AlreadySettled(tag)));
    assert_eq!(subscriber.ack(99), Err(SettlementError::UnknownTag(99)));
    assert_eq!(broker.unacked("orders-q"), 0);
}

#[tokio::test]
async fn test_requeue_redelivers_with_new_tag() {
    let broker = MemoryBroker::new();
    let (subscriber, mut rx) = manual_subscriber(&broker).await;
    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    publisher.publish("try again").await.unwrap();

    let (first, redelivered, body) = recv(&mut rx).await;
    assert!(!redelivered);
    subscriber.requeue(first).unwrap();

    let (second, redelivered, again) = recv(&mut rx).await;
    assert!(redelivered);
    assert!(second > first);
    assert_eq!(again, body);

    subscriber.ack(second).unwrap();
    assert_eq!(subscriber.ack(first), Err(SettlementError::AlreadySettled(first)));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_discarded_message_is_gone() {
    let broker = MemoryBroker::new();
    let (subscriber, mut rx) = manual_subscriber(&broker).await;
    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    publisher.publish("poison").await.unwrap();

    let (tag, _, _) = recv(&mut rx).await;
    subscriber.reject(tag).unwrap();

    assert_quiet(&mut rx).await;
    assert_eq!(broker.queue_depth("orders-q"), Some(0));
    assert_eq!(broker.unacked("orders-q"), 0);
}

#[tokio::test]
async fn test_handler_settles_each_delivery_once() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(Arc::new(broker.clone()), orders_subscriber_config())
        .on_delivery(move |delivery, channel| {
            let tag = delivery.delivery_tag;
            // Retry once, then accept.
            let result = if delivery.redelivered {
                channel.ack(tag)
            } else {
                channel.reject(tag, true)
            };
            let _ = tx.send((tag, delivery.redelivered, result));
        });
    subscriber.connect(ADDR).await.unwrap();

    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    publisher.publish("flaky").await.unwrap();

    assert_eq!(recv(&mut rx).await, (1, false, Ok(())));
    assert_eq!(recv(&mut rx).await, (2, true, Ok(())));
    assert_quiet(&mut rx).await;

    assert_eq!(subscriber.channel().unwrap().unsettled(), 0);
    assert_eq!(subscriber.received(), 2);
}
