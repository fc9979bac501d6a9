use crate::error::{BoxError, Result};
use crate::factory::Factory;
use crate::option::{self, ConsumerOption};
use crate::retry::RetryPolicy;
use clap::{Parser, ValueEnum};
use rdkafka::config::ClientConfig;
use rdkafka::Offset;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decoder hook turning a record payload into an application value.
pub type Decoder<T> = Arc<dyn Fn(&[u8]) -> std::result::Result<T, BoxError> + Send + Sync>;

/// Decoder parsing payloads as JSON.
pub fn json_decoder<T: DeserializeOwned>() -> Decoder<T> {
    Arc::new(|payload: &[u8]| serde_json::from_slice(payload).map_err(BoxError::from))
}

pub(crate) const DEFAULT_SESSION_TIMEOUT_MS: u64 = 6000;

/// Where a consumer starts reading when it has no committed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StartOffset {
    #[default]
    Earliest,
    Latest,
}

impl StartOffset {
    /// Value for librdkafka's `auto.offset.reset`.
    pub fn as_reset_str(&self) -> &'static str {
        match self {
            StartOffset::Earliest => "earliest",
            StartOffset::Latest => "latest",
        }
    }

    pub fn offset(&self) -> Offset {
        match self {
            StartOffset::Earliest => Offset::Beginning,
            StartOffset::Latest => Offset::End,
        }
    }
}

/// How simple-mode partition pumps decode records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DecodeMode {
    /// Every record is decoded and emitted by its own task. Records of one
    /// partition may reach the message queue in any order.
    #[default]
    Concurrent,
    /// Records are decoded inline by the pump, in offset order.
    Ordered,
}

/// Configuration shared by group and simple consumers.
///
/// Built by [`Factory::create`] and then adjusted by the factory's options;
/// the consumer owns it from then on.
pub struct ConsumerConfig<T> {
    /// Kafka brokers, in the order they are tried
    pub brokers: Vec<String>,
    /// Topic to consume from
    pub topic: String,
    /// Consumer group; `None` consumes every partition directly
    pub group: Option<String>,
    /// Capacity of the message and error queues
    ///
    /// Zero behaves as a single-slot hand-off.
    pub buffer_size: usize,
    pub decoder: Decoder<T>,
    /// librdkafka properties, keyed by the factory name (`client.id`)
    pub client: ClientConfig,
    /// Offset policy when no committed position exists
    pub start: StartOffset,
    /// Simple mode only
    pub decode_mode: DecodeMode,
    /// Group mode only
    pub retry: RetryPolicy,
}

impl<T> ConsumerConfig<T> {
    /// Capacity of the output queues.
    pub fn queue_capacity(&self) -> usize {
        self.buffer_size.max(1)
    }

    /// Client properties for joining `group`.
    ///
    /// Offsets are stored only when a message is acknowledged and committed
    /// in the background.
    pub fn group_client_config(&self, group: &str) -> ClientConfig {
        let mut client = self.client.clone();
        client
            .set("bootstrap.servers", self.brokers.join(","))
            .set("group.id", group)
            .set("auto.offset.reset", self.start.as_reset_str())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");
        client
    }

    /// Client properties for reading partitions without a group.
    pub fn direct_client_config(&self) -> ClientConfig {
        let mut client = self.client.clone();
        client
            .set("bootstrap.servers", self.brokers.join(","))
            .set("enable.auto.commit", "false");
        client
    }
}

/// Default client properties for a consumer named `name`.
pub fn default_client_config(name: &str) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("client.id", name)
        .set("session.timeout.ms", DEFAULT_SESSION_TIMEOUT_MS.to_string())
        .set("enable.partition.eof", "false");
    client
}

impl<T> Clone for ConsumerConfig<T> {
    fn clone(&self) -> Self {
        Self {
            brokers: self.brokers.clone(),
            topic: self.topic.clone(),
            group: self.group.clone(),
            buffer_size: self.buffer_size,
            decoder: Arc::clone(&self.decoder),
            client: self.client.clone(),
            start: self.start,
            decode_mode: self.decode_mode,
            retry: self.retry.clone(),
        }
    }
}

impl<T> fmt::Debug for ConsumerConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("brokers", &self.brokers)
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("buffer_size", &self.buffer_size)
            .field("client", &self.client)
            .field("start", &self.start)
            .field("decode_mode", &self.decode_mode)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Command line and environment configuration for a consumer.
#[derive(Debug, Clone, Parser)]
pub struct Config {
    /// Consumer name, used as the Kafka client id
    #[clap(long, env = "ASYNC_KAFKA_NAME", default_value = "async-kafka")]
    pub name: String,
    /// Kafka brokers (comma-separated or multiple --brokers)
    #[clap(long, env = "ASYNC_KAFKA_BROKERS", value_delimiter = ',', required = true)]
    pub brokers: Vec<String>,
    /// Topic to consume from
    #[clap(long, env = "ASYNC_KAFKA_TOPIC")]
    pub topic: String,
    /// Consumer group ID. Without it every partition of the topic is consumed directly.
    #[clap(long, env = "ASYNC_KAFKA_GROUP_ID")]
    pub group_id: Option<String>,
    /// Capacity of the message and error queues
    #[clap(long, env = "ASYNC_KAFKA_BUFFER_SIZE")]
    pub buffer_size: Option<usize>,
    /// Where to start when there is no committed offset
    #[clap(long, env = "ASYNC_KAFKA_START", value_enum, default_value_t = StartOffset::Earliest)]
    pub start: StartOffset,
    /// Session timeout in milliseconds
    #[clap(long, env = "ASYNC_KAFKA_SESSION_TIMEOUT_MS", default_value_t = DEFAULT_SESSION_TIMEOUT_MS)]
    pub session_timeout_ms: u64,
    /// Decoding strategy of the direct (group-less) consumer
    #[clap(long, env = "ASYNC_KAFKA_DECODE_MODE", value_enum, default_value_t = DecodeMode::Concurrent)]
    pub decode_mode: DecodeMode,
}

impl Config {
    /// Options equivalent to the flags.
    pub fn options<T: Send + 'static>(&self) -> Vec<ConsumerOption<T>> {
        let mut options = vec![
            option::start(self.start),
            option::session_timeout(Duration::from_millis(self.session_timeout_ms)),
            option::decode_mode(self.decode_mode),
        ];
        if let Some(size) = self.buffer_size {
            options.push(option::buffer(size));
        }
        options
    }

    /// Group factory when a group id is set, simple factory otherwise.
    pub fn factory<T: DeserializeOwned + Send + 'static>(&self) -> Result<Factory<T>> {
        self.factory_with_decoder(json_decoder())
    }

    /// Like [`Config::factory`], for payloads that are not JSON.
    pub fn factory_with_decoder<T: Send + 'static>(&self, decoder: Decoder<T>) -> Result<Factory<T>> {
        let options = self.options();
        match &self.group_id {
            Some(group) => Factory::group_with_decoder(
                &self.name,
                group,
                &self.topic,
                self.brokers.clone(),
                decoder,
                options,
            ),
            None => Factory::simple_with_decoder(
                &self.name,
                &self.topic,
                self.brokers.clone(),
                decoder,
                options,
            ),
        }
    }
}
