use async_kafka::{option, Consumer, Factory, StartOffset};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Example consuming JSON events as a member of a consumer group
///
/// This example shows how to:
/// 1. Build a group consumer factory with options
/// 2. Consume decoded messages and errors from two queues
/// 3. Acknowledge processed messages so their offsets get committed
/// 4. Stop on Ctrl-C and close the consumer
///
/// To run this example:
/// 1. Start Kafka with Docker
///   docker run -d --name kafka -p 9092:9092 apache/kafka:latest
/// 2. Run the example
///   cargo run --example group_consumer

#[derive(Debug, Deserialize)]
struct UserEvent {
    user_id: String,
    event_type: String,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    if let Err(e) = run_main().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let factory = Factory::<UserEvent>::group(
        "group-consumer-example",
        "example-group",
        "user-events",
        vec!["localhost:9092".to_string()],
        vec![option::buffer(100), option::start(StartOffset::Earliest)],
    )?;
    let mut consumer = factory.create()?;

    let token = CancellationToken::new();
    let (mut messages, mut errors) = consumer.consume(&token).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(message) = messages.recv() => {
                let _entered = message.span().enter();
                let event = message.value();
                tracing::info!("{} sent {}", event.user_id, event.event_type);
                message.ack()?;
            }
            Some(e) = errors.recv() => tracing::warn!("consumer error: {e}"),
            else => break,
        }
    }

    consumer.close().await?;
    Ok(())
}
