use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rabbit_facade::config::{self, FacadeConfig, CONFIG_FILE_NAME};
use rabbit_facade::env::apply_env_overrides;
use rabbit_facade::rabbitmq::{ChannelContext, LapinEngine, Publisher, Reactor, Subscriber};
use rabbit_facade::Delivery;

const USAGE: &str = "usage: rabbit-facade <init-config [path] | publish [count] | consume>";
const MAX_RETRIES: u32 = 3;

enum MessageStatus {
    Success,
    Retry,
    Discard,
}

fn process_message(delivery: &Delivery) -> MessageStatus {
    let body = delivery.body_str();
    let retry_count = delivery.retry_count();
    info!(
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        retry_count,
        "Received message: {}",
        body
    );

    if body.contains("discard") || retry_count >= MAX_RETRIES {
        MessageStatus::Discard
    } else if body.contains("retry") && !delivery.redelivered {
        MessageStatus::Retry
    } else {
        MessageStatus::Success
    }
}

fn handle_delivery(delivery: &Delivery, channel: &ChannelContext) {
    let tag = delivery.delivery_tag;
    let result = match process_message(delivery) {
        MessageStatus::Success => channel.ack(tag).map(|_| "acknowledged"),
        MessageStatus::Retry => channel.reject(tag, true).map(|_| "requeued"),
        MessageStatus::Discard => channel.reject(tag, false).map(|_| "discarded"),
    };

    match result {
        Ok(outcome) => info!(delivery_tag = tag, "Message {}", outcome),
        Err(e) => error!(delivery_tag = tag, "Failed to settle message: {}", e),
    }
}

fn load_settings() -> Result<FacadeConfig> {
    let mut settings = match config::load_config() {
        Ok(settings) => settings,
        Err(e) => {
            warn!("{:#}; using built-in defaults", e);
            FacadeConfig::default()
        }
    };
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

fn publish(settings: FacadeConfig, count: u64) -> Result<()> {
    let reactor = Reactor::new().context("Failed to start the reactor")?;
    let publisher = Publisher::new(Arc::new(LapinEngine::new()), settings.publisher);

    reactor.block_on(async {
        publisher.connect(&settings.connection.uri).await?;

        for i in 1..=count {
            let payload = format!("message {} of {}", i, count);
            if let Err(e) = publisher.publish(payload).await {
                error!("Failed to publish message {}: {}", i, e);
            }
        }

        info!(
            exchange = %publisher.exchange(),
            routing_key = %publisher.routing_key(),
            published = publisher.published(),
            "Publishing finished"
        );
        publisher.close().await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn consume(settings: FacadeConfig) -> Result<()> {
    let reactor = Reactor::new().context("Failed to start the reactor")?;
    let subscriber = Subscriber::new(Arc::new(LapinEngine::new()), settings.subscriber)
        .on_delivery(handle_delivery);

    reactor.block_on(async {
        subscriber.connect(&settings.connection.uri).await?;
        info!(queue = %subscriber.queue(), "Consumer started, waiting for messages");

        tokio::select! {
            state = subscriber.run() => info!(%state, "Connection ended"),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing connection");
                subscriber.close().await?;
            }
        }

        info!(received = subscriber.received(), "Consumer finished");
        Ok::<(), anyhow::Error>(())
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("init-config") => {
            let path = args
                .get(1)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            config::create_default_config_file(&path)?;
            println!("Configuration file created at: {}", path.display());
            Ok(())
        }
        Some("publish") => {
            let count = args
                .get(1)
                .map(|count| count.parse::<u64>())
                .transpose()
                .context("publish count must be a positive number")?
                .unwrap_or(5);
            publish(load_settings()?, count)
        }
        Some("consume") => consume(load_settings()?),
        _ => {
            eprintln!("{}", USAGE);
            Err(anyhow!("unknown or missing command"))
        }
    }
}
