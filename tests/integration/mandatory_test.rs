use std::sync::Arc;

use rabbit_facade::rabbitmq::{
    Binding, MemoryBroker, PublishError, Publisher, PublisherConfig, Queue,
};

use crate::helper::ADDR;

fn publisher(broker: &MemoryBroker, confirm: bool, mandatory: bool) -> Publisher {
    Publisher::new(
        Arc::new(broker.clone()),
        PublisherConfig {
            confirm,
            mandatory,
            ..PublisherConfig::new("audit", "audit.login")
        },
    )
}

#[tokio::test]
async fn test_mandatory_unroutable_is_returned() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker, false, true);
    publisher.connect(ADDR).await.unwrap();

    let err = publisher.publish("nobody listens").await.unwrap_err();
    assert_eq!(
        err,
        PublishError::Unroutable {
            exchange: "audit".to_string(),
            routing_key: "audit.login".to_string(),
            reply_code: 312,
            reply_text: "NO_ROUTE".to_string(),
        }
    );
    assert_eq!(publisher.published(), 0);

    let channel = publisher.transport().channel().unwrap();
    channel.declare_queue(&Queue::new("audit-q", false)).await.unwrap();
    channel
        .bind_queue(&Binding::new("audit", "audit-q", "audit.login"))
        .await
        .unwrap();

    publisher.publish("now routed").await.unwrap();
    assert_eq!(publisher.published(), 1);
    assert_eq!(broker.queue_depth("audit-q"), Some(1));
}

#[tokio::test]
async fn test_unroutable_without_mandatory_is_dropped() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker, true, false);
    publisher.connect(ADDR).await.unwrap();

    // The peer acks and discards it; only mandatory publishes learn otherwise.
    publisher.publish("into the void").await.unwrap();
    assert_eq!(publisher.published(), 1);
    assert!(publisher.transport().channel().unwrap().confirm_mode());
}

#[tokio::test]
async fn test_confirmed_publishes_are_counted() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker, true, true);
    publisher.connect(ADDR).await.unwrap();

    let channel = publisher.transport().channel().unwrap();
    channel.declare_queue(&Queue::new("audit-q", true)).await.unwrap();
    channel
        .bind_queue(&Binding::new("audit", "audit-q", "audit.login"))
        .await
        .unwrap();

    for i in 0..3 {
        publisher.publish(format!("login {}", i)).await.unwrap();
    }
    assert_eq!(publisher.published(), 3);
    assert_eq!(broker.queue_depth("audit-q"), Some(3));
}
