use std::sync::Arc;

use rabbit_facade::rabbitmq::{
    MemoryBroker, PublishError, Publisher, PublisherConfig, Queue, Subscriber, SubscriberConfig,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::helper::{assert_quiet, orders_publisher, orders_subscriber_config, recv, ADDR};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: u32,
    total_cents: u64,
}

#[tokio::test]
async fn test_acked_deliveries_leave_queue_empty() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(Arc::new(broker.clone()), orders_subscriber_config())
        .on_delivery(move |delivery, channel| {
            channel.ack(delivery.delivery_tag).unwrap();
            let _ = tx.send(delivery.delivery_tag);
        });
    subscriber.connect(ADDR).await.unwrap();

    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    for i in 1..=5 {
        publisher.publish(format!("order {}", i)).await.unwrap();
    }

    let mut tags = Vec::new();
    for _ in 0..5 {
        tags.push(recv(&mut rx).await);
    }
    assert_eq!(tags, vec![1, 2, 3, 4, 5]);
    assert_eq!(publisher.published(), 5);
    assert_eq!(subscriber.received(), 5);

    // Acks travel ahead of this declare on the same channel.
    let info = subscriber
        .channel()
        .unwrap()
        .declare_queue(&Queue::new("orders-q", true))
        .await
        .unwrap();
    assert_eq!(info.message_count, 0);
    assert_eq!(broker.unacked("orders-q"), 0);
}

#[tokio::test]
async fn test_json_payload_round_trip() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(Arc::new(broker.clone()), orders_subscriber_config())
        .on_delivery(move |delivery, channel| {
            channel.ack(delivery.delivery_tag).unwrap();
            let _ = tx.send(delivery.json::<OrderCreated>());
        });
    subscriber.connect(ADDR).await.unwrap();

    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    publisher
        .publish_json(&OrderCreated {
            order_id: 42,
            total_cents: 1999,
        })
        .await
        .unwrap();

    assert_eq!(
        recv(&mut rx).await.unwrap(),
        OrderCreated {
            order_id: 42,
            total_cents: 1999
        }
    );
}

#[tokio::test]
async fn test_publish_without_connection_is_not_counted() {
    let broker = MemoryBroker::new();
    let publisher = orders_publisher(&broker);

    assert_eq!(publisher.publish("early").await, Err(PublishError::ChannelNotReady));

    publisher.connect(ADDR).await.unwrap();
    publisher.close().await.unwrap();
    assert_eq!(publisher.publish("late").await, Err(PublishError::ChannelNotReady));
    assert_eq!(publisher.published(), 0);
}

#[tokio::test]
async fn test_delivery_tags_strictly_increase() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(Arc::new(broker.clone()), orders_subscriber_config())
        .on_delivery(move |delivery, channel| {
            // Alternate settlement kinds; tags must not be reused either way.
            if delivery.delivery_tag % 2 == 0 {
                channel.reject(delivery.delivery_tag, false).unwrap();
            } else {
                channel.ack(delivery.delivery_tag).unwrap();
            }
            let _ = tx.send(delivery.delivery_tag);
        });
    subscriber.connect(ADDR).await.unwrap();

    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    for i in 0..10 {
        publisher.publish(format!("m{}", i)).await.unwrap();
    }

    let mut previous = 0;
    for _ in 0..10 {
        let tag = recv(&mut rx).await;
        assert!(tag > previous, "tag {} after {}", tag, previous);
        previous = tag;
    }
}

#[tokio::test]
async fn test_prefetch_limits_unsettled_deliveries() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(
        Arc::new(broker.clone()),
        SubscriberConfig {
            prefetch_count: Some(2),
            ..orders_subscriber_config()
        },
    )
    .on_delivery(move |delivery, _| {
        let _ = tx.send(delivery.delivery_tag);
    });
    subscriber.connect(ADDR).await.unwrap();

    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    for i in 0..5 {
        publisher.publish(format!("m{}", i)).await.unwrap();
    }

    assert_eq!(recv(&mut rx).await, 1);
    assert_eq!(recv(&mut rx).await, 2);
    assert_quiet(&mut rx).await;
    assert_eq!(broker.queue_depth("orders-q"), Some(3));

    subscriber.ack(1).unwrap();
    assert_eq!(recv(&mut rx).await, 3);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_queue_without_exchange_consumes_default_route() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(
        Arc::new(broker.clone()),
        SubscriberConfig::new("", "work-q", "work-q"),
    )
    .on_delivery(move |delivery, channel| {
        channel.ack(delivery.delivery_tag).unwrap();
        let _ = tx.send(delivery.routing_key.clone());
    });
    subscriber.connect(ADDR).await.unwrap();

    let publisher = Publisher::new(Arc::new(broker), PublisherConfig::new("", "work-q"));
    publisher.connect(ADDR).await.unwrap();
    publisher.publish("job").await.unwrap();

    assert_eq!(recv(&mut rx).await, "work-q");
}
