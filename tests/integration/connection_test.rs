use std::sync::Arc;

use rabbit_facade::rabbitmq::{
    ConnectionState, Exchange, LapinEngine, MemoryBroker, Publisher, PublisherConfig,
    SettlementError, Subscriber, SubscriberConfig, SubscriberState, TopologyDeclarator,
    TransportHandle,
};
use tokio::sync::mpsc;

use crate::helper::{orders_publisher, orders_subscriber_config, recv, EventLog, ADDR};

#[tokio::test]
async fn test_connected_fires_once_before_declares() {
    let broker = MemoryBroker::new();
    let log = Arc::new(EventLog::default());
    let transport = TransportHandle::new(Arc::new(broker)).with_events(log.clone());

    let channel = transport.open(&ADDR.parse().unwrap()).await.unwrap();
    TopologyDeclarator::new(channel)
        .declare_exchange(&Exchange::direct("orders").durable())
        .await
        .unwrap();
    log.push("exchange declared");

    assert!(transport.open(&ADDR.parse().unwrap()).await.is_err());
    assert_eq!(log.entries(), vec!["connected", "exchange declared"]);
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_reconnect_after_peer_close_redeclares_topology() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(Arc::new(broker.clone()), orders_subscriber_config())
        .on_delivery(move |delivery, channel| {
            channel.ack(delivery.delivery_tag).unwrap();
            let _ = tx.send(delivery.body_str().into_owned());
        });

    subscriber.connect(ADDR).await.unwrap();
    broker.close_connections();
    assert_eq!(subscriber.run().await, ConnectionState::Closed);
    assert_eq!(subscriber.state(), SubscriberState::Closed);

    subscriber.connect(ADDR).await.unwrap();
    assert_eq!(subscriber.state(), SubscriberState::Consuming);

    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    publisher.publish("after reconnect").await.unwrap();

    assert_eq!(recv(&mut rx).await, "after reconnect");
    assert_eq!(subscriber.received(), 1);
}

#[tokio::test]
async fn test_severed_connection_fails_and_requeues_unacked() {
    let broker = MemoryBroker::new();
    let log = Arc::new(EventLog::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(Arc::new(broker.clone()), orders_subscriber_config())
        .with_events(log.clone())
        .on_delivery(move |delivery, _| {
            // Left unsettled on purpose.
            let _ = tx.send((delivery.delivery_tag, delivery.redelivered));
        });
    subscriber.connect(ADDR).await.unwrap();

    let publisher = orders_publisher(&broker);
    publisher.connect(ADDR).await.unwrap();
    publisher.publish("in flight").await.unwrap();
    let (tag, redelivered) = recv(&mut rx).await;
    assert_eq!((tag, redelivered), (1, false));

    broker.sever_connections("connection reset by peer");
    assert_eq!(subscriber.run().await, ConnectionState::Failed);
    assert_eq!(subscriber.state(), SubscriberState::Failed);
    assert_eq!(subscriber.ack(tag), Err(SettlementError::ChannelNotReady));
    assert_eq!(
        log.entries(),
        vec![
            "connected".to_string(),
            "error: connection lost: connection reset by peer".to_string()
        ]
    );
    assert_eq!(broker.queue_depth("orders-q"), Some(1));

    // The publisher's connection was severed too.
    assert_eq!(publisher.run().await, ConnectionState::Failed);

    subscriber.connect(ADDR).await.unwrap();
    assert_eq!(recv(&mut rx).await, (1, true));
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance; set AMQP_ADDR to point at it
async fn test_live_broker_round_trip() {
    let address = std::env::var("AMQP_ADDR").unwrap_or_else(|_| ADDR.to_string());
    let engine = Arc::new(LapinEngine::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(
        engine.clone(),
        SubscriberConfig::new("rabbit_facade_it", "rabbit_facade_it_q", "it.message"),
    )
    .on_delivery(move |delivery, channel| {
        channel.ack(delivery.delivery_tag).unwrap();
        let _ = tx.send(delivery.body_str().into_owned());
    });
    subscriber.connect(&address).await.unwrap();

    let publisher = Publisher::new(
        engine,
        PublisherConfig {
            confirm: true,
            ..PublisherConfig::new("rabbit_facade_it", "it.message")
        },
    );
    publisher.connect(&address).await.unwrap();
    publisher.publish("hello from the integration test").await.unwrap();

    assert_eq!(recv(&mut rx).await, "hello from the integration test");
    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}
