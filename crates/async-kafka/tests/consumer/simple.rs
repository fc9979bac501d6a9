use crate::support::{
    brokers, connector, next_error, next_message, produce_events, unique, wait_closed, Event,
};
use async_kafka::testing::MemoryBroker;
use async_kafka::{metrics, option, Consumer, DecodeMode, Error, Factory, StartOffset};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn factory(
    broker: &MemoryBroker,
    topic: &str,
    options: Vec<async_kafka::ConsumerOption<Event>>,
) -> Factory<Event> {
    Factory::simple("test-service", topic, brokers(), options)
        .unwrap()
        .with_connector(connector(broker))
}

#[tokio::test]
async fn test_simple_reads_every_partition() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 3);
    let mut expected = HashSet::new();
    for partition in 0..3 {
        let first = partition as u32 * 4;
        produce_events(&broker, &topic, partition, first..first + 4);
        for (offset, n) in (first..first + 4).enumerate() {
            expected.insert((partition, offset as i64, n));
        }
    }

    let mut consumer = factory(&broker, &topic, vec![]).create().unwrap();
    let token = CancellationToken::new();
    let (mut messages, mut errors) = consumer.consume(&token).await.unwrap();

    let mut received = HashSet::new();
    for _ in 0..12 {
        let message = next_message(&mut messages).await;
        assert!(message.ack_handle().is_none());
        received.insert((message.partition(), message.offset(), message.value().n));
    }
    assert_eq!(received, expected);
    assert_eq!(broker.opened_readers(), 3);

    token.cancel();
    wait_closed(&mut messages).await;
    wait_closed(&mut errors).await;
    assert_eq!(broker.closed_readers(), 3);

    timeout(Duration::from_secs(2), consumer.close())
        .await
        .expect("close hung after cancellation")
        .unwrap();
    assert_eq!(broker.closed_clients(), 1);
}

#[tokio::test]
async fn test_simple_ordered_decoding_keeps_offsets_in_order() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..20);

    let options = vec![option::decode_mode(DecodeMode::Ordered), option::buffer(1)];
    let mut consumer = factory(&broker, &topic, options).create().unwrap();
    let (mut messages, _errors) = consumer.consume(&CancellationToken::new()).await.unwrap();

    for expected in 0..20 {
        assert_eq!(next_message(&mut messages).await.offset(), expected);
    }
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_simple_decode_errors_skip_only_the_record() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..1);
    broker.produce(&topic, 0, "not json").unwrap();
    produce_events(&broker, &topic, 0, 2..3);

    let mut consumer = factory(&broker, &topic, vec![]).create().unwrap();
    let (mut messages, mut errors) = consumer.consume(&CancellationToken::new()).await.unwrap();

    match next_error(&mut errors).await {
        Error::Decode { offset, .. } => assert_eq!(offset, 1),
        other => panic!("unexpected error: {other}"),
    }
    let mut values = HashSet::new();
    for _ in 0..2 {
        values.insert(next_message(&mut messages).await.value().n);
    }
    assert_eq!(values, HashSet::from([0, 2]));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_simple_reports_every_undecodable_record() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..5);

    let options = vec![option::decoder(|_: &[u8]| Err("not an event".into()))];
    let mut consumer = factory(&broker, &topic, options).create().unwrap();
    let (mut messages, mut errors) = consumer.consume(&CancellationToken::new()).await.unwrap();

    let mut offsets = HashSet::new();
    for _ in 0..5 {
        match next_error(&mut errors).await {
            Error::Decode { topic: t, partition, offset, .. } => {
                assert_eq!((t.as_str(), partition), (topic.as_str(), 0));
                assert!(offsets.insert(offset), "offset {offset} reported twice");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(offsets, (0..5).collect::<HashSet<i64>>());
    assert!(messages.try_recv().is_err());

    consumer.close().await.unwrap();
    wait_closed(&mut errors).await;
}

#[tokio::test]
async fn test_simple_zero_partitions_fails_consume() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 0);

    let mut consumer = factory(&broker, &topic, vec![]).create().unwrap();
    let err = consumer.consume(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::NoPartitions(ref t) if *t == topic));
    assert_eq!(err.to_string(), format!("got 0 partitions for topic '{topic}'"));
    assert_eq!(broker.opened_readers(), 0);
    assert_eq!(broker.closed_clients(), 1);
}

#[tokio::test]
async fn test_simple_open_failure_closes_opened_readers() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 3);
    broker.refuse_partition(&topic, 2);

    let mut consumer = factory(&broker, &topic, vec![]).create().unwrap();
    assert!(consumer.consume(&CancellationToken::new()).await.is_err());
    assert_eq!(broker.opened_readers(), 2);
    assert_eq!(broker.closed_readers(), 2);
    assert_eq!(broker.closed_clients(), 1);
}

#[tokio::test]
async fn test_simple_reader_failure_stops_only_its_partition() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 2);

    let mut consumer = factory(&broker, &topic, vec![]).create().unwrap();
    let (mut messages, mut errors) = consumer.consume(&CancellationToken::new()).await.unwrap();

    broker.fail_partition(&topic, 0, "leader not available").unwrap();
    match next_error(&mut errors).await {
        Error::Broker(reason) => assert_eq!(reason, "leader not available"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.closed_readers(), 1);

    produce_events(&broker, &topic, 1, 0..1);
    let message = next_message(&mut messages).await;
    assert_eq!((message.partition(), message.value().n), (1, 0));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_simple_latest_skips_existing_records() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..2);

    let options = vec![option::start(StartOffset::Latest)];
    let mut consumer = factory(&broker, &topic, options).create().unwrap();
    let (mut messages, _errors) = consumer.consume(&CancellationToken::new()).await.unwrap();

    produce_events(&broker, &topic, 0, 2..3);
    let message = next_message(&mut messages).await;
    assert_eq!(message.offset(), 2);
    assert_eq!(message.value().n, 2);
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_simple_offset_lag_gauge_has_empty_group() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 1);
    produce_events(&broker, &topic, 0, 0..4);

    let options = vec![option::decode_mode(DecodeMode::Ordered)];
    let mut consumer = factory(&broker, &topic, options).create().unwrap();
    let (mut messages, _errors) = consumer.consume(&CancellationToken::new()).await.unwrap();
    for _ in 0..4 {
        next_message(&mut messages).await;
    }

    assert_eq!(metrics::offset_diff("", &topic, 0), Some(1));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_simple_close_never_fails() {
    let broker = MemoryBroker::new();
    let topic = unique("clicks");
    broker.create_topic(&topic, 1);
    broker.fail_close("socket already gone");

    let mut consumer = factory(&broker, &topic, vec![]).create().unwrap();
    consumer.close().await.unwrap();

    let (mut messages, _errors) = consumer.consume(&CancellationToken::new()).await.unwrap();
    consumer.close().await.unwrap();
    consumer.close().await.unwrap();
    wait_closed(&mut messages).await;
    assert_eq!(broker.closed_clients(), 1);
    assert!(matches!(
        consumer.consume(&CancellationToken::new()).await,
        Err(Error::AlreadyConsuming)
    ));
}
