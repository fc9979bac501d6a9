//! Kafka consumers exposed as a pair of queues: decoded messages and errors.
//!
//! Two strategies are available, both built through [`Factory`]:
//!
//! - Consumer Groups: partitions are balanced across the group members, records
//!   of a partition arrive in offset order and acknowledged offsets are
//!   committed for the group
//! - Simple: every partition of the topic is read directly by this process,
//!   without coordination or committed offsets
//!
//! Each message carries a `kafka_consume` tracing span and every record updates
//! the `kafka_consumer_offset_diff` lag gauge.

pub mod broker;

/// Raw record to [`Message`] conversion shared by both strategies
pub mod claim;

/// librdkafka backed broker clients
pub mod client;

/// Consumer settings, decoders and the command-line configuration
pub mod config;
pub mod consumer;
pub mod error;
pub mod factory;
pub mod group;
pub mod message;
pub mod metrics;
pub mod option;
pub mod retry;
pub mod simple;

/// In-memory broker for tests and local experiments
pub mod testing;

// Re-export main types for easy access
pub use client::RdKafkaConnector;
pub use config::{json_decoder, Config, ConsumerConfig, DecodeMode, Decoder, StartOffset};
pub use consumer::{Consumer, Streams};
pub use error::{BoxError, Error, Result};
pub use factory::Factory;
pub use group::GroupConsumer;
pub use message::{Ack, Acknowledger, Message, RawRecord};
pub use option::ConsumerOption;
pub use retry::{Backoff, RetryPolicy};
pub use simple::SimpleConsumer;
