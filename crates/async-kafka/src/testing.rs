//! In-memory broker for exercising consumers without a Kafka cluster.
//!
//! [`MemoryBroker`] implements [`Connector`], so it plugs into
//! [`crate::Factory::with_connector`]. Topics are plain vectors of records;
//! readers and claims wait on a per-partition watch channel for new records.
//! Group sessions cover every partition of the subscribed topics (one member
//! per group) and end on [`MemoryBroker::rebalance`].
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! broker.create_topic("events", 2);
//! broker.produce("events", 0, br#"{"id": 1}"#.to_vec())?;
//!
//! let factory = Factory::<serde_json::Value>::simple("svc", "events", brokers, vec![])?
//!     .with_connector(Arc::new(broker.clone()));
//! ```

use crate::broker::{Claim, ClaimHandler, Connector, DirectClient, GroupClient, PartitionReader};
use crate::config::StartOffset;
use crate::error::{Error, Result};
use crate::message::{Ack, Acknowledger, RawRecord};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

struct PartitionLog {
    records: Vec<Bytes>,
    failure: Option<String>,
    changes: watch::Sender<u64>,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            failure: None,
            changes: watch::channel(0).0,
        }
    }

    fn touch(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<PartitionLog>>,
    committed: HashMap<(String, String, i32), i64>,
    group_errors: HashMap<String, Vec<mpsc::UnboundedSender<Error>>>,
    sessions: HashMap<String, usize>,
    refuse_connections: bool,
    refused_partitions: HashSet<(String, i32)>,
    close_failure: Option<String>,
    opened_readers: usize,
    closed_readers: usize,
    closed_clients: usize,
}

struct Inner {
    state: std::sync::Mutex<State>,
    generation: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: std::sync::Mutex::new(State::default()),
                generation: watch::channel(0).0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Create `topic` with `partitions` empty partitions, replacing any
    /// existing topic of that name.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let logs = (0..partitions).map(|_| PartitionLog::new()).collect();
        self.state().topics.insert(topic.to_string(), logs);
    }

    /// Append a record and return its offset.
    pub fn produce(&self, topic: &str, partition: i32, payload: impl Into<Bytes>) -> Result<i64> {
        let mut state = self.state();
        let log = partition_log(&mut state, topic, partition)?;
        log.records.push(payload.into());
        log.touch();
        Ok(log.records.len() as i64 - 1)
    }

    /// Make the next read of a partition reader fail with `reason`.
    pub fn fail_partition(&self, topic: &str, partition: i32, reason: &str) -> Result<()> {
        let mut state = self.state();
        let log = partition_log(&mut state, topic, partition)?;
        log.failure = Some(reason.to_string());
        log.touch();
        Ok(())
    }

    /// Report a fatal error to every client of `group`.
    pub fn fail_group(&self, group: &str, reason: &str) {
        if let Some(clients) = self.state().group_errors.get(group) {
            for client in clients {
                let _ = client.send(Error::Broker(reason.to_string()));
            }
        }
    }

    /// Revoke every group assignment, ending all running sessions.
    pub fn rebalance(&self) {
        self.inner.generation.send_modify(|generation| *generation += 1);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Make opening a reader for this partition fail.
    pub fn refuse_partition(&self, topic: &str, partition: i32) {
        self.state()
            .refused_partitions
            .insert((topic.to_string(), partition));
    }

    /// Make closing group and direct clients fail with `reason`.
    pub fn fail_close(&self, reason: &str) {
        self.state().close_failure = Some(reason.to_string());
    }

    pub fn high_water_mark(&self, topic: &str, partition: i32) -> i64 {
        self.state()
            .topics
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .map_or(0, |log| log.records.len() as i64)
    }

    /// Next offset `group` would read from a partition, if it acknowledged any.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Number of sessions `group` has started.
    pub fn sessions(&self, group: &str) -> usize {
        self.state().sessions.get(group).copied().unwrap_or(0)
    }

    pub fn opened_readers(&self) -> usize {
        self.state().opened_readers
    }

    pub fn closed_readers(&self) -> usize {
        self.state().closed_readers
    }

    pub fn closed_clients(&self) -> usize {
        self.state().closed_clients
    }

    fn partition_count(&self, topic: &str) -> Result<usize> {
        self.state()
            .topics
            .get(topic)
            .map(Vec::len)
            .ok_or_else(|| Error::Broker(format!("unknown topic '{topic}'")))
    }

    fn record(&self, topic: &str, partition: i32, offset: i64) -> Option<RawRecord> {
        let state = self.state();
        let payload = state
            .topics
            .get(topic)?
            .get(partition as usize)?
            .records
            .get(usize::try_from(offset).ok()?)?
            .clone();
        Some(RawRecord::new(topic, partition, offset, payload))
    }

    fn take_failure(&self, topic: &str, partition: i32) -> Option<String> {
        let mut state = self.state();
        partition_log(&mut state, topic, partition)
            .ok()?
            .failure
            .take()
    }

    fn watch_partition(&self, topic: &str, partition: i32) -> Result<watch::Receiver<u64>> {
        let mut state = self.state();
        Ok(partition_log(&mut state, topic, partition)?.changes.subscribe())
    }

    fn start_position(&self, topic: &str, partition: i32, start: StartOffset) -> i64 {
        match start {
            StartOffset::Earliest => 0,
            StartOffset::Latest => self.high_water_mark(topic, partition),
        }
    }

    fn close_client(&self) -> Result<()> {
        let mut state = self.state();
        state.closed_clients += 1;
        match &state.close_failure {
            Some(reason) => Err(Error::Broker(reason.clone())),
            None => Ok(()),
        }
    }
}

fn partition_log<'a>(
    state: &'a mut State,
    topic: &str,
    partition: i32,
) -> Result<&'a mut PartitionLog> {
    state
        .topics
        .get_mut(topic)
        .and_then(|logs| logs.get_mut(usize::try_from(partition).ok()?))
        .ok_or_else(|| Error::Broker(format!("unknown partition {topic}/{partition}")))
}

fn start_offset(config: &ClientConfig) -> StartOffset {
    match config.get("auto.offset.reset") {
        Some("latest") => StartOffset::Latest,
        _ => StartOffset::Earliest,
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn group(&self, config: &ClientConfig) -> Result<Arc<dyn GroupClient>> {
        if self.state().refuse_connections {
            return Err(Error::Broker("connection refused".to_string()));
        }
        let group = config
            .get("group.id")
            .ok_or_else(|| Error::InvalidConfig("group.id is not set".to_string()))?
            .to_string();

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        self.state()
            .group_errors
            .entry(group.clone())
            .or_default()
            .push(fatal_tx);

        Ok(Arc::new(MemoryGroupClient {
            broker: self.clone(),
            acks: Arc::new(MemoryAcks {
                broker: self.clone(),
                group: group.clone(),
            }),
            group,
            start: start_offset(config),
            fatal: Mutex::new(fatal_rx),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }))
    }

    async fn direct(&self, _config: &ClientConfig) -> Result<Arc<dyn DirectClient>> {
        if self.state().refuse_connections {
            return Err(Error::Broker("connection refused".to_string()));
        }
        Ok(Arc::new(MemoryDirectClient {
            broker: self.clone(),
            closing: AtomicBool::new(false),
        }))
    }
}

struct MemoryAcks {
    broker: MemoryBroker,
    group: String,
}

impl Acknowledger for MemoryAcks {
    fn ack(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut state = self.broker.state();
        let next = state
            .committed
            .entry((self.group.clone(), topic.to_string(), partition))
            .or_insert(0);
        *next = (*next).max(offset + 1);
        Ok(())
    }
}

pub struct MemoryGroupClient {
    broker: MemoryBroker,
    acks: Arc<MemoryAcks>,
    group: String,
    start: StartOffset,
    fatal: Mutex<mpsc::UnboundedReceiver<Error>>,
    closing: AtomicBool,
    closed: CancellationToken,
}

#[async_trait]
impl GroupClient for MemoryGroupClient {
    async fn consume(
        &self,
        topics: &[String],
        token: &CancellationToken,
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ClientClosed);
        }
        *self
            .broker
            .state()
            .sessions
            .entry(self.group.clone())
            .or_insert(0) += 1;

        let mut generation = self.broker.inner.generation.subscribe();
        let session = token.child_token();
        let mut claims = JoinSet::new();

        for topic in topics {
            for partition in 0..self.broker.partition_count(topic)? as i32 {
                let position = self
                    .broker
                    .committed(&self.group, topic, partition)
                    .unwrap_or_else(|| self.broker.start_position(topic, partition, self.start));
                let mut claim = MemoryClaim {
                    broker: self.broker.clone(),
                    acks: Arc::clone(&self.acks),
                    changes: self.broker.watch_partition(topic, partition)?,
                    topic: topic.clone(),
                    partition,
                    position,
                };
                let handler = Arc::clone(&handler);
                let session = session.clone();
                claims.spawn(async move { handler.consume_claim(&mut claim, &session).await });
            }
        }

        let result = loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => break Ok(()),
                _ = self.closed.cancelled() => break Err(Error::ClientClosed),
                _ = generation.changed() => break Ok(()),
                Some(joined) = claims.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(Error::Broker(format!("claim task failed: {e}"))),
                },
            }
        };

        session.cancel();
        while claims.join_next().await.is_some() {}
        result
    }

    async fn fatal_error(&self) -> Option<Error> {
        let mut fatal = self.fatal.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            error = fatal.recv() => error,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        self.broker.close_client()
    }
}

struct MemoryClaim {
    broker: MemoryBroker,
    acks: Arc<MemoryAcks>,
    changes: watch::Receiver<u64>,
    topic: String,
    partition: i32,
    position: i64,
}

#[async_trait]
impl Claim for MemoryClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn high_water_mark(&self) -> i64 {
        self.broker.high_water_mark(&self.topic, self.partition)
    }

    async fn next(&mut self) -> Option<RawRecord> {
        loop {
            self.changes.borrow_and_update();
            if let Some(record) = self.broker.record(&self.topic, self.partition, self.position) {
                self.position += 1;
                let ack = Ack::new(
                    Arc::clone(&self.acks) as Arc<dyn Acknowledger>,
                    self.topic.clone(),
                    record.partition,
                    record.offset,
                );
                return Some(record.with_ack(ack));
            }
            self.changes.changed().await.ok()?;
        }
    }
}

pub struct MemoryDirectClient {
    broker: MemoryBroker,
    closing: AtomicBool,
}

#[async_trait]
impl DirectClient for MemoryDirectClient {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        Ok((0..self.broker.partition_count(topic)? as i32).collect())
    }

    async fn open_partition(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionReader>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        if self
            .broker
            .state()
            .refused_partitions
            .contains(&(topic.to_string(), partition))
        {
            return Err(Error::Broker(format!(
                "failed to get partition consumer {topic}/{partition}"
            )));
        }

        let changes = self.broker.watch_partition(topic, partition)?;
        self.broker.state().opened_readers += 1;
        Ok(Box::new(MemoryReader {
            broker: self.broker.clone(),
            changes,
            topic: topic.to_string(),
            partition,
            position: self.broker.start_position(topic, partition, start),
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.close_client()
    }
}

struct MemoryReader {
    broker: MemoryBroker,
    changes: watch::Receiver<u64>,
    topic: String,
    partition: i32,
    position: i64,
    closed: bool,
}

#[async_trait]
impl PartitionReader for MemoryReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn high_water_mark(&self) -> i64 {
        self.broker.high_water_mark(&self.topic, self.partition)
    }

    async fn next(&mut self) -> Result<Option<RawRecord>> {
        loop {
            if self.closed {
                return Ok(None);
            }
            self.changes.borrow_and_update();
            if let Some(reason) = self.broker.take_failure(&self.topic, self.partition) {
                return Err(Error::Broker(reason));
            }
            if let Some(record) = self.broker.record(&self.topic, self.partition, self.position) {
                self.position += 1;
                return Ok(Some(record));
            }
            if self.changes.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.broker.state().closed_readers += 1;
        }
        Ok(())
    }
}
