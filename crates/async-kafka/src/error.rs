use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by decoder hooks and option mutators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not apply option '{option}' to consumer: {source}")]
    Option {
        option: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("failed to decode record {topic}/{partition}@{offset}: {source}")]
    Decode {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: BoxError,
    },

    #[error("got 0 partitions for topic '{0}'")]
    NoPartitions(String),

    #[error("consumer is already consuming")]
    AlreadyConsuming,

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("consumer client is closed")]
    ClientClosed,

    #[error("giving up after {attempts} failed sessions: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to close consumer: {0}")]
    Close(#[source] Arc<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;
