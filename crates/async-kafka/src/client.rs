//! librdkafka backed broker clients.
//!
//! Group sessions are driven from a single [`StreamConsumer`]: the session
//! task polls it, routes each record to the claim of its partition and serves
//! the rebalance callbacks, which end the session on revocation. Direct
//! readers split one partition queue each off a consumer that is never
//! subscribed to a group.
//!
//! High water marks come from the statistics librdkafka emits every
//! `statistics.interval.ms`; until the first report a partition's mark is
//! taken to be one past the last record read.

use crate::broker::{Claim, ClaimHandler, Connector, DirectClient, GroupClient, PartitionReader};
use crate::config::StartOffset;
use crate::error::{Error, Result};
use crate::message::{Ack, Acknowledger, RawRecord};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer as RdkafkaConsumer, ConsumerContext, Rebalance,
    StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message as RdkafkaMessage};
use rdkafka::statistics::Statistics;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
/// Records buffered between the session task and one claim.
const CLAIM_BUFFER: usize = 64;
const STATISTICS_INTERVAL: &str = "statistics.interval.ms";
const DEFAULT_STATISTICS_INTERVAL_MS: &str = "1000";

/// Opens librdkafka clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct RdKafkaConnector;

#[async_trait]
impl Connector for RdKafkaConnector {
    async fn group(&self, config: &ClientConfig) -> Result<Arc<dyn GroupClient>> {
        Ok(Arc::new(RdKafkaGroupClient::new(config)?))
    }

    async fn direct(&self, config: &ClientConfig) -> Result<Arc<dyn DirectClient>> {
        Ok(Arc::new(RdKafkaDirectClient::new(config)?))
    }
}

fn raw_record(message: &BorrowedMessage<'_>, ack: Option<Ack>) -> RawRecord {
    RawRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message.payload().map(Bytes::copy_from_slice),
        timestamp: message.timestamp().to_millis(),
        ack,
    }
}

/// Statistics are the only source of high water marks that does not block.
fn with_statistics(config: &ClientConfig) -> ClientConfig {
    let mut config = config.clone();
    if config.get(STATISTICS_INTERVAL).is_none() {
        config.set(STATISTICS_INTERVAL, DEFAULT_STATISTICS_INTERVAL_MS);
    }
    config
}

/// Latest high water mark per partition, as reported by librdkafka statistics.
#[derive(Debug, Default)]
struct Watermarks {
    high: RwLock<HashMap<(String, i32), i64>>,
}

impl Watermarks {
    fn record(&self, statistics: &Statistics) {
        for (name, topic) in &statistics.topics {
            for (id, partition) in &topic.partitions {
                self.update(name, *id, partition.hi_offset);
            }
        }
    }

    fn update(&self, topic: &str, partition: i32, high: i64) {
        // librdkafka reports -1 for unknown marks and for its internal
        // unassigned partition.
        if partition < 0 || high < 0 {
            return;
        }
        self.high
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((topic.to_string(), partition), high);
    }

    /// Never below `position + 1`: the last reported mark may predate the
    /// record at `position`.
    fn high_water_mark(&self, topic: &str, partition: i32, position: i64) -> i64 {
        let next = position + 1;
        self.high
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(topic.to_string(), partition))
            .map_or(next, |&high| high.max(next))
    }
}

// ============================================================================
// Group client
// ============================================================================

enum GroupEvent {
    Assigned(Vec<(String, i32)>),
    Revoked,
}

fn topic_partitions(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

struct GroupContext {
    events: mpsc::UnboundedSender<GroupEvent>,
    fatal: mpsc::UnboundedSender<KafkaError>,
    watermarks: Arc<Watermarks>,
}

impl ClientContext for GroupContext {
    fn stats(&self, statistics: Statistics) {
        self.watermarks.record(&statistics);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        if error.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) {
            error!("fatal librdkafka error: {error}: {reason}");
            let _ = self.fatal.send(error);
        } else {
            warn!("librdkafka error: {error}: {reason}");
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            debug!("partitions revoked: {:?}", topic_partitions(tpl));
            let _ = self.events.send(GroupEvent::Revoked);
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let assigned = topic_partitions(tpl);
                debug!("partitions assigned: {assigned:?}");
                let _ = self.events.send(GroupEvent::Assigned(assigned));
            }
            Rebalance::Error(e) => warn!("rebalance failed: {e}"),
            _ => {}
        }
    }
}

type GroupStreamConsumer = StreamConsumer<GroupContext>;

/// Stores acknowledged offsets for the next auto commit.
struct OffsetStore {
    consumer: Arc<GroupStreamConsumer>,
}

impl Acknowledger for OffsetStore {
    fn ack(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        // The stored offset is the next one to consume.
        self.consumer.store_offset(topic, partition, offset + 1)?;
        Ok(())
    }
}

/// Earliest offset of a partition that was fetched but not yet handed over
/// by its claim.
#[derive(Debug)]
struct ResumePoint(AtomicI64);

impl ResumePoint {
    fn new() -> Self {
        Self(AtomicI64::new(-1))
    }

    /// A fetched record was queued for the claim.
    fn routed(&self, offset: i64) {
        let _ = self
            .0
            .compare_exchange(-1, offset, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn set(&self, offset: i64) {
        self.0.store(offset, Ordering::SeqCst);
    }

    fn offset(&self) -> Option<i64> {
        let offset = self.0.load(Ordering::SeqCst);
        (offset >= 0).then_some(offset)
    }
}

type PartitionKey = (String, i32);

/// Claims of one group session.
struct Session {
    token: CancellationToken,
    handler: Arc<dyn ClaimHandler>,
    watermarks: Arc<Watermarks>,
    claims: HashMap<PartitionKey, mpsc::Sender<RawRecord>>,
    resume: HashMap<PartitionKey, Arc<ResumePoint>>,
    tasks: JoinSet<(PartitionKey, Result<()>)>,
}

impl Session {
    fn new(
        token: CancellationToken,
        handler: Arc<dyn ClaimHandler>,
        watermarks: Arc<Watermarks>,
    ) -> Self {
        Self {
            token,
            handler,
            watermarks,
            claims: HashMap::new(),
            resume: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Sender and resume point of the claim for a partition, spawning the
    /// claim if needed.
    fn claim(&mut self, topic: &str, partition: i32) -> (mpsc::Sender<RawRecord>, Arc<ResumePoint>) {
        let key = (topic.to_string(), partition);
        let resume = Arc::clone(
            self.resume
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ResumePoint::new())),
        );
        if let Some(records) = self.claims.get(&key) {
            return (records.clone(), resume);
        }

        let (records_tx, records_rx) = mpsc::channel(CLAIM_BUFFER);
        self.claims.insert(key.clone(), records_tx.clone());

        let mut claim = RdKafkaClaim::new(
            topic,
            partition,
            records_rx,
            Arc::clone(&resume),
            Arc::clone(&self.watermarks),
        );
        let handler = Arc::clone(&self.handler);
        let token = self.token.clone();
        self.tasks.spawn(async move {
            let result = handler.consume_claim(&mut claim, &token).await;
            (key, result)
        });
        (records_tx, resume)
    }

    /// Hand a fetched record to the claim of its partition.
    async fn route(&mut self, record: RawRecord) {
        let (claim, resume) = self.claim(&record.topic, record.partition);
        resume.routed(record.offset);
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = claim.send(record) => {}
        }
    }

    /// Stop every claim and return the offset each partition has to be read
    /// from again.
    async fn finish(mut self) -> Vec<(String, i32, i64)> {
        self.token.cancel();
        self.claims.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(((topic, partition), Err(e))) = joined {
                debug!("claim {topic}/{partition} failed during session teardown: {e}");
            }
        }

        let mut points: Vec<_> = self
            .resume
            .into_iter()
            .filter_map(|((topic, partition), point)| {
                point.offset().map(|offset| (topic, partition, offset))
            })
            .collect();
        points.sort();
        points
    }
}

enum SessionEnd {
    Cancelled,
    Revoked,
    Closed,
    Failed(Error),
}

pub struct RdKafkaGroupClient {
    consumer: Arc<GroupStreamConsumer>,
    acknowledger: Arc<dyn Acknowledger>,
    watermarks: Arc<Watermarks>,
    events: Mutex<mpsc::UnboundedReceiver<GroupEvent>>,
    fatal: Mutex<mpsc::UnboundedReceiver<KafkaError>>,
    subscribed: AtomicBool,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl RdKafkaGroupClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let watermarks = Arc::new(Watermarks::default());
        let consumer: GroupStreamConsumer =
            with_statistics(config).create_with_context(GroupContext {
                events: events_tx,
                fatal: fatal_tx,
                watermarks: Arc::clone(&watermarks),
            })?;
        let consumer = Arc::new(consumer);

        Ok(Self {
            acknowledger: Arc::new(OffsetStore {
                consumer: Arc::clone(&consumer),
            }),
            consumer,
            watermarks,
            events: Mutex::new(events_rx),
            fatal: Mutex::new(fatal_rx),
            subscribed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    /// Point partitions that are still assigned back at records the caller
    /// never got, so the next session reads them again.
    async fn rewind(&self, points: Vec<(String, i32, i64)>) {
        if points.is_empty() {
            return;
        }
        let consumer = Arc::clone(&self.consumer);
        let rewound = tokio::task::spawn_blocking(move || -> KafkaResult<()> {
            let assignment = consumer.assignment()?;
            for (topic, partition, offset) in points {
                if assignment.find_partition(&topic, partition).is_none() {
                    continue;
                }
                match consumer.seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT) {
                    Ok(()) => debug!("rewound {topic}/{partition} to offset {offset}"),
                    Err(e) => {
                        warn!("failed to rewind {topic}/{partition} to offset {offset}: {e}")
                    }
                }
            }
            Ok(())
        })
        .await;

        match rewound {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to read assignment for rewind: {e}"),
            Err(e) => warn!("rewind task failed: {e}"),
        }
    }
}

#[async_trait]
impl GroupClient for RdKafkaGroupClient {
    async fn consume(
        &self,
        topics: &[String],
        token: &CancellationToken,
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ClientClosed);
        }
        if !self.subscribed.swap(true, Ordering::SeqCst) {
            let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.consumer.subscribe(&topics)?;
        }

        let mut events = self.events.lock().await;
        let mut session = Session::new(
            token.child_token(),
            handler,
            Arc::clone(&self.watermarks),
        );
        for (topic, partition) in topic_partitions(&self.consumer.assignment()?) {
            session.claim(&topic, partition);
        }

        let end = loop {
            tokio::select! {
                biased;
                _ = session.token.cancelled() => break SessionEnd::Cancelled,
                _ = self.closed.cancelled() => break SessionEnd::Closed,
                event = events.recv() => match event {
                    Some(GroupEvent::Assigned(assigned)) => {
                        for (topic, partition) in assigned {
                            session.claim(&topic, partition);
                        }
                    }
                    Some(GroupEvent::Revoked) => break SessionEnd::Revoked,
                    None => break SessionEnd::Closed,
                },
                Some(joined) = session.tasks.join_next() => match joined {
                    Ok((_, Err(e))) => break SessionEnd::Failed(e),
                    Ok((key, Ok(()))) => {
                        session.claims.remove(&key);
                    }
                    Err(e) => break SessionEnd::Failed(Error::Broker(format!("claim task failed: {e}"))),
                },
                received = self.consumer.recv() => {
                    let record = match received {
                        Ok(message) => raw_record(&message, None),
                        Err(e) => break SessionEnd::Failed(e.into()),
                    };
                    let ack = Ack::new(
                        Arc::clone(&self.acknowledger),
                        record.topic.clone(),
                        record.partition,
                        record.offset,
                    );
                    // Records can overtake the assignment event.
                    session.route(record.with_ack(ack)).await;
                }
            }
        };

        let resume = session.finish().await;
        match end {
            SessionEnd::Cancelled | SessionEnd::Revoked => Ok(()),
            SessionEnd::Closed => Err(Error::ClientClosed),
            SessionEnd::Failed(e) => {
                // The fetch position of every partition is past the records
                // that were still queued for its claim.
                self.rewind(resume).await;
                Err(e)
            }
        }
    }

    async fn fatal_error(&self) -> Option<Error> {
        let mut fatal = self.fatal.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            error = fatal.recv() => error.map(Error::from),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        if !self.subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Flush acknowledged offsets before leaving the group.
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            let committed = match consumer.commit_consumer_state(CommitMode::Sync) {
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
                other => other,
            };
            consumer.unsubscribe();
            committed
        })
        .await
        .map_err(|e| Error::Broker(format!("close task failed: {e}")))??;
        Ok(())
    }
}

struct RdKafkaClaim {
    topic: String,
    partition: i32,
    records: mpsc::Receiver<RawRecord>,
    resume: Arc<ResumePoint>,
    watermarks: Arc<Watermarks>,
    taken: Option<i64>,
}

impl RdKafkaClaim {
    fn new(
        topic: &str,
        partition: i32,
        records: mpsc::Receiver<RawRecord>,
        resume: Arc<ResumePoint>,
        watermarks: Arc<Watermarks>,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            records,
            resume,
            watermarks,
            taken: None,
        }
    }
}

#[async_trait]
impl Claim for RdKafkaClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn high_water_mark(&self) -> i64 {
        self.watermarks
            .high_water_mark(&self.topic, self.partition, self.taken.unwrap_or(-1))
    }

    async fn next(&mut self) -> Option<RawRecord> {
        // Asking for the next record means the previous one was handled.
        if let Some(previous) = self.taken.take() {
            self.resume.set(previous + 1);
        }
        let record = self.records.recv().await?;
        self.resume.set(record.offset);
        self.taken = Some(record.offset);
        Some(record)
    }
}

// ============================================================================
// Direct client
// ============================================================================

struct DirectContext {
    watermarks: Arc<Watermarks>,
}

impl ClientContext for DirectContext {
    fn stats(&self, statistics: Statistics) {
        self.watermarks.record(&statistics);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        warn!("librdkafka error: {error}: {reason}");
    }
}

impl ConsumerContext for DirectContext {}

type DirectStreamConsumer = StreamConsumer<DirectContext>;

pub struct RdKafkaDirectClient {
    consumer: Arc<DirectStreamConsumer>,
    watermarks: Arc<Watermarks>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl RdKafkaDirectClient {
    /// Must be called from within a tokio runtime: the main queue of the
    /// consumer is polled by a background task until the client is closed.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let watermarks = Arc::new(Watermarks::default());
        let consumer: DirectStreamConsumer =
            with_statistics(config).create_with_context(DirectContext {
                watermarks: Arc::clone(&watermarks),
            })?;
        let consumer = Arc::new(consumer);
        let closed = CancellationToken::new();

        let main_queue = Arc::clone(&consumer);
        let stop = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    received = main_queue.recv() => {
                        if let Err(e) = received {
                            warn!("direct consumer error: {e}");
                        }
                    }
                }
            }
        });

        Ok(Self {
            consumer,
            watermarks,
            closing: AtomicBool::new(false),
            closed,
        })
    }
}

fn partition_ids(consumer: &DirectStreamConsumer, topic: &str) -> KafkaResult<Vec<i32>> {
    let metadata = consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
    let mut ids = Vec::new();
    for meta in metadata.topics().iter().filter(|meta| meta.name() == topic) {
        if let Some(err) = meta.error() {
            return Err(KafkaError::MetadataFetch(err.into()));
        }
        ids.extend(meta.partitions().iter().map(|partition| partition.id()));
    }
    Ok(ids)
}

#[async_trait]
impl DirectClient for RdKafkaDirectClient {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        if self.closed.is_cancelled() {
            return Err(Error::ClientClosed);
        }
        let consumer = Arc::clone(&self.consumer);
        let topic = topic.to_string();
        let ids = tokio::task::spawn_blocking(move || partition_ids(&consumer, &topic))
            .await
            .map_err(|e| Error::Broker(format!("metadata request failed: {e}")))??;
        Ok(ids)
    }

    async fn open_partition(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionReader>> {
        if self.closed.is_cancelled() {
            return Err(Error::ClientClosed);
        }
        let queue = self
            .consumer
            .split_partition_queue(topic, partition)
            .ok_or_else(|| {
                Error::Broker(format!("failed to get partition consumer {topic}/{partition}"))
            })?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, start.offset())?;
        self.consumer.incremental_assign(&tpl)?;

        Ok(Box::new(RdKafkaPartitionReader {
            consumer: Arc::clone(&self.consumer),
            watermarks: Arc::clone(&self.watermarks),
            queue,
            topic: topic.to_string(),
            partition,
            position: -1,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        self.consumer.unassign()?;
        Ok(())
    }
}

struct RdKafkaPartitionReader {
    consumer: Arc<DirectStreamConsumer>,
    watermarks: Arc<Watermarks>,
    queue: StreamPartitionQueue<DirectContext>,
    topic: String,
    partition: i32,
    position: i64,
    closed: bool,
}

#[async_trait]
impl PartitionReader for RdKafkaPartitionReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn high_water_mark(&self) -> i64 {
        self.watermarks
            .high_water_mark(&self.topic, self.partition, self.position)
    }

    async fn next(&mut self) -> Result<Option<RawRecord>> {
        if self.closed {
            return Ok(None);
        }
        let record = match self.queue.recv().await {
            Ok(message) => raw_record(&message, None),
            Err(e) => return Err(e.into()),
        };
        self.position = record.offset;
        Ok(Some(record))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.topic, self.partition);
        self.consumer.incremental_unassign(&tpl)?;
        Ok(())
    }
}
