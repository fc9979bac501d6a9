use crate::support::{
    brokers, connector, init_tracing, next_error, next_message, produce_events, unique,
    wait_closed, wait_until, Event,
};
use async_kafka::testing::MemoryBroker;
use async_kafka::{metrics, option, Backoff, Consumer, Error, Factory, RetryPolicy};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn factory(
    broker: &MemoryBroker,
    group: &str,
    topic: &str,
    options: Vec<async_kafka::ConsumerOption<Event>>,
) -> Factory<Event> {
    Factory::group("test-service", group, topic, brokers(), options)
        .unwrap()
        .with_connector(connector(broker))
}

fn failing_decoder() -> async_kafka::ConsumerOption<Event> {
    option::decoder(|_: &[u8]| Err("not an event".into()))
}

#[tokio::test]
async fn test_group_delivers_partition_in_order() {
    init_tracing();
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..10);

    let mut consumer = factory(&broker, &group, &topic, vec![]).create().unwrap();
    let token = CancellationToken::new();
    let (mut messages, mut errors) = consumer.consume(&token).await.unwrap();

    for expected in 0..10 {
        let message = next_message(&mut messages).await;
        assert_eq!(message.value().n, expected);
        assert_eq!(message.offset(), i64::from(expected));
        assert_eq!(message.topic(), topic);
        assert_eq!(message.partition(), 0);
        assert!(message.ack_handle().is_some());
    }

    token.cancel();
    wait_closed(&mut messages).await;
    wait_closed(&mut errors).await;
    assert_eq!(broker.closed_clients(), 1);

    timeout(Duration::from_secs(2), consumer.close())
        .await
        .expect("close hung after cancellation")
        .unwrap();
    assert_eq!(broker.closed_clients(), 1);
}

#[tokio::test]
async fn test_group_acknowledged_offsets_are_resumed() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..3);

    let factory = factory(&broker, &group, &topic, vec![]);
    let mut first = factory.create().unwrap();
    let (mut messages, _errors) = first.consume(&CancellationToken::new()).await.unwrap();
    for _ in 0..3 {
        next_message(&mut messages).await.ack().unwrap();
    }
    assert_eq!(broker.committed(&group, &topic, 0), Some(3));
    first.close().await.unwrap();

    produce_events(&broker, &topic, 0, 3..4);
    let mut second = factory.create().unwrap();
    let (mut messages, _errors) = second.consume(&CancellationToken::new()).await.unwrap();
    let message = next_message(&mut messages).await;
    assert_eq!(message.offset(), 3);
    assert_eq!(message.value().n, 3);
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_group_decode_error_restarts_session() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..1);

    let mut consumer = factory(&broker, &group, &topic, vec![failing_decoder()])
        .create()
        .unwrap();
    let (_messages, mut errors) = consumer.consume(&CancellationToken::new()).await.unwrap();

    // The record is never acknowledged, so every session fails on it again.
    for _ in 0..2 {
        match next_error(&mut errors).await {
            Error::Decode { offset, partition, .. } => {
                assert_eq!((partition, offset), (0, 0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
    assert!(broker.sessions(&group) >= 2);
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_group_bounded_retries_give_up() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..1);

    let options = vec![
        failing_decoder(),
        option::retry_policy(RetryPolicy::bounded(2, Backoff::None)),
    ];
    let mut consumer = factory(&broker, &group, &topic, options).create().unwrap();
    let (mut messages, mut errors) = consumer.consume(&CancellationToken::new()).await.unwrap();

    assert!(matches!(next_error(&mut errors).await, Error::Decode { .. }));
    match next_error(&mut errors).await {
        Error::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*source, Error::Decode { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    wait_closed(&mut messages).await;
    assert_eq!(broker.sessions(&group), 2);
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_group_fatal_error_is_forwarded() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 2);

    let mut consumer = factory(&broker, &group, &topic, vec![]).create().unwrap();
    let (mut messages, mut errors) = consumer.consume(&CancellationToken::new()).await.unwrap();

    broker.fail_group(&group, "broker fenced this member");
    match next_error(&mut errors).await {
        Error::Broker(reason) => assert_eq!(reason, "broker fenced this member"),
        other => panic!("unexpected error: {other}"),
    }

    // The client is gone, so consumption winds down without cancellation.
    wait_closed(&mut messages).await;
    wait_closed(&mut errors).await;
    assert_eq!(broker.closed_clients(), 1);
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_group_rebalance_starts_new_session() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..1);

    let mut consumer = factory(&broker, &group, &topic, vec![]).create().unwrap();
    let (mut messages, _errors) = consumer.consume(&CancellationToken::new()).await.unwrap();
    next_message(&mut messages).await.ack().unwrap();
    wait_until(|| broker.sessions(&group) == 1).await;

    broker.rebalance();
    wait_until(|| broker.sessions(&group) == 2).await;

    produce_events(&broker, &topic, 0, 1..2);
    let message = next_message(&mut messages).await;
    assert_eq!(message.offset(), 1);
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_group_offset_lag_gauge() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..3);

    let mut consumer = factory(&broker, &group, &topic, vec![]).create().unwrap();
    let (mut messages, _errors) = consumer.consume(&CancellationToken::new()).await.unwrap();
    let mut last = None;
    for _ in 0..3 {
        last = Some(next_message(&mut messages).await.offset());
    }

    assert_eq!(last, Some(2));
    assert_eq!(metrics::offset_diff(&group, &topic, 0), Some(1));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_group_close_is_idempotent() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);

    let mut consumer = factory(&broker, &group, &topic, vec![]).create().unwrap();
    consumer.close().await.unwrap();

    let (_messages, _errors) = consumer.consume(&CancellationToken::new()).await.unwrap();
    consumer.close().await.unwrap();
    consumer.close().await.unwrap();
    assert_eq!(broker.closed_clients(), 1);
}

#[tokio::test]
async fn test_group_close_failure_is_reported() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);
    broker.fail_close("leave group timed out");

    let mut consumer = factory(&broker, &group, &topic, vec![]).create().unwrap();
    let (_messages, _errors) = consumer.consume(&CancellationToken::new()).await.unwrap();

    let err = consumer.close().await.unwrap_err();
    assert!(matches!(err, Error::Close(_)));
    assert!(err.to_string().starts_with("failed to close consumer"));
}

#[tokio::test]
async fn test_group_close_reports_failure_after_watchdog_closed_client() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);
    broker.fail_close("leave group timed out");

    let mut consumer = factory(&broker, &group, &topic, vec![]).create().unwrap();
    let token = CancellationToken::new();
    let (_messages, _errors) = consumer.consume(&token).await.unwrap();

    token.cancel();
    wait_until(|| broker.closed_clients() == 1).await;

    for _ in 0..2 {
        let err = consumer.close().await.unwrap_err();
        assert!(matches!(err, Error::Close(_)));
        assert!(err.to_string().ends_with("leave group timed out"));
    }
    assert_eq!(broker.closed_clients(), 1);
}

#[tokio::test]
async fn test_group_consume_only_once() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);

    let mut consumer = factory(&broker, &group, &topic, vec![]).create().unwrap();
    let token = CancellationToken::new();
    let _streams = consumer.consume(&token).await.unwrap();
    assert!(matches!(
        consumer.consume(&token).await,
        Err(Error::AlreadyConsuming)
    ));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_group_failed_connect_can_be_retried() {
    let broker = MemoryBroker::new();
    let (topic, group) = (unique("orders"), unique("billing"));
    broker.create_topic(&topic, 1);
    broker.refuse_connections(true);

    let mut consumer = factory(&broker, &group, &topic, vec![]).create().unwrap();
    let token = CancellationToken::new();
    assert!(matches!(
        consumer.consume(&token).await,
        Err(Error::Broker(_))
    ));

    broker.refuse_connections(false);
    assert!(consumer.consume(&token).await.is_ok());
    consumer.close().await.unwrap();
}
