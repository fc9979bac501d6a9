use async_kafka::testing::MemoryBroker;
use async_kafka::{Error, Message};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Event {
    pub n: u32,
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("async_kafka=debug")
        .try_init()
        .ok();
}

pub fn brokers() -> Vec<String> {
    vec!["memory:9092".to_string()]
}

/// Topic and group names are unique per test because the lag gauge is
/// process wide.
pub fn unique(prefix: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("{prefix}-{}", NEXT.fetch_add(1, Ordering::SeqCst))
}

pub fn connector(broker: &MemoryBroker) -> Arc<MemoryBroker> {
    Arc::new(broker.clone())
}

pub fn produce_events(broker: &MemoryBroker, topic: &str, partition: i32, events: std::ops::Range<u32>) {
    for n in events {
        broker
            .produce(topic, partition, format!(r#"{{"n": {n}}}"#))
            .unwrap();
    }
}

pub async fn next_message<T>(messages: &mut mpsc::Receiver<Message<T>>) -> Message<T> {
    timeout(WAIT, messages.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("message queue closed")
}

pub async fn next_error(errors: &mut mpsc::Receiver<Error>) -> Error {
    timeout(WAIT, errors.recv())
        .await
        .expect("timed out waiting for an error")
        .expect("error queue closed")
}

/// Drain `queue` until it closes.
pub async fn wait_closed<V>(queue: &mut mpsc::Receiver<V>) {
    timeout(WAIT, async {
        while queue.recv().await.is_some() {}
    })
    .await
    .expect("queue was not closed");
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}
