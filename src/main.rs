//! Command-line interface for async-kafka
//!
//! Consumes a topic and logs every decoded JSON message until Ctrl-C.
//!
//! # Usage Examples
//! ```bash
//! # Join a consumer group, committing acknowledged offsets
//! async-kafka --brokers localhost:9092 --topic orders --group-id billing
//!
//! # Read every partition directly, starting at the end of the topic
//! ASYNC_KAFKA_BROKERS=localhost:9092,localhost:9093 async-kafka \
//!   --topic orders --start latest --decode-mode ordered
//! ```

use anyhow::Context;
use async_kafka::{Config, Consumer};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    let factory = config
        .factory::<serde_json::Value>()
        .context("Invalid consumer configuration")?;
    let mut consumer = factory.create()?;

    let token = CancellationToken::new();
    let (mut messages, mut errors) = consumer
        .consume(&token)
        .await
        .with_context(|| format!("Failed to consume topic '{}'", config.topic))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping consumer");
                break;
            }
            message = messages.recv() => {
                let Some(message) = message else {
                    break;
                };
                message.span().in_scope(|| {
                    tracing::info!(payload = %message.value(), "Received message");
                });
                if let Err(e) = message.ack() {
                    tracing::warn!("Failed to acknowledge message: {e}");
                }
            }
            Some(e) = errors.recv() => tracing::error!("Consumer error: {e}"),
        }
    }

    token.cancel();
    consumer.close().await.context("Failed to close consumer")?;
    Ok(())
}
