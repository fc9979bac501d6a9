use crate::error::Result;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::Span;

/// Marks records as processed on the broker side.
///
/// Implemented by group-mode clients; the stored position is picked up by the
/// next offset commit.
pub trait Acknowledger: Send + Sync {
    fn ack(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

/// Acknowledgment handle for one record, carried from the claim to the caller.
#[derive(Clone)]
pub struct Ack {
    acknowledger: Arc<dyn Acknowledger>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Ack {
    pub fn new(
        acknowledger: Arc<dyn Acknowledger>,
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
    ) -> Self {
        Self {
            acknowledger,
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Mark the record as processed.
    pub fn ack(&self) -> Result<()> {
        self.acknowledger
            .ack(&self.topic, self.partition, self.offset)
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .finish()
    }
}

/// An undecoded record as handed out by a broker client.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Kafka topic
    pub topic: String,
    /// Kafka partition
    pub partition: i32,
    /// Kafka offset, strictly increasing within a partition
    pub offset: i64,
    /// Message key (if any)
    pub key: Option<Bytes>,
    /// Message payload (tombstones have none)
    pub payload: Option<Bytes>,
    /// Message timestamp (milliseconds since epoch)
    pub timestamp: Option<i64>,
    /// Set by group-mode clients only
    pub ack: Option<Ack>,
}

impl RawRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: Some(payload.into()),
            timestamp: None,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: Ack) -> Self {
        self.ack = Some(ack);
        self
    }
}

/// A decoded record delivered on the message queue.
///
/// The span was entered nowhere; it stays open until the message (or a clone
/// of the span taken by the caller) is dropped.
#[derive(Debug)]
pub struct Message<T> {
    value: T,
    span: Span,
    ack: Option<Ack>,
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Bytes>,
    timestamp: Option<i64>,
}

impl<T> Message<T> {
    pub(crate) fn new(record: RawRecord, value: T, span: Span) -> Self {
        Self {
            value,
            span,
            ack: record.ack,
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key,
            timestamp: record.timestamp,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Span started when the record was claimed.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Acknowledgment handle, present for group-mode messages.
    pub fn ack_handle(&self) -> Option<&Ack> {
        self.ack.as_ref()
    }

    /// Acknowledge the message. A no-op in simple mode.
    pub fn ack(&self) -> Result<()> {
        match &self.ack {
            Some(ack) => ack.ack(),
            None => Ok(()),
        }
    }
}
