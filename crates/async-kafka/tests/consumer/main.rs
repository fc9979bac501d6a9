//! Consumer tests against the in-memory broker
//!
//! Both strategies run end to end through `Factory`, with
//! `async_kafka::testing::MemoryBroker` standing in for a Kafka cluster.

mod group;
mod simple;
mod support;
