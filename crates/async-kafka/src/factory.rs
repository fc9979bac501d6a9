use crate::broker::Connector;
use crate::client::RdKafkaConnector;
use crate::config::{
    default_client_config, json_decoder, ConsumerConfig, DecodeMode, Decoder, StartOffset,
};
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::group::GroupConsumer;
use crate::option::ConsumerOption;
use crate::retry::RetryPolicy;
use crate::simple::SimpleConsumer;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Queue capacity of group consumers unless overridden.
pub const DEFAULT_GROUP_BUFFER: usize = 0;
/// Queue capacity of simple consumers unless overridden.
pub const DEFAULT_SIMPLE_BUFFER: usize = 1000;

/// Builds consumers from validated settings and a list of options.
///
/// Creating a consumer does not touch the network; connections are made by
/// [`Consumer::consume`].
pub struct Factory<T> {
    name: String,
    group: Option<String>,
    topic: String,
    brokers: Vec<String>,
    decoder: Decoder<T>,
    options: Vec<ConsumerOption<T>>,
    connector: Arc<dyn Connector>,
}

impl<T: DeserializeOwned + Send + 'static> Factory<T> {
    /// Factory of consumers joining `group`, decoding payloads as JSON.
    pub fn group(
        name: &str,
        group: &str,
        topic: &str,
        brokers: Vec<String>,
        options: Vec<ConsumerOption<T>>,
    ) -> Result<Self> {
        Self::group_with_decoder(name, group, topic, brokers, json_decoder(), options)
    }

    /// Factory of consumers reading every partition directly, decoding
    /// payloads as JSON.
    pub fn simple(
        name: &str,
        topic: &str,
        brokers: Vec<String>,
        options: Vec<ConsumerOption<T>>,
    ) -> Result<Self> {
        Self::simple_with_decoder(name, topic, brokers, json_decoder(), options)
    }
}

impl<T: Send + 'static> Factory<T> {
    pub fn group_with_decoder(
        name: &str,
        group: &str,
        topic: &str,
        brokers: Vec<String>,
        decoder: Decoder<T>,
        options: Vec<ConsumerOption<T>>,
    ) -> Result<Self> {
        validate(name, topic, &brokers)?;
        if group.is_empty() {
            return Err(Error::InvalidConfig("group is required".to_string()));
        }
        Ok(Self::build(name, Some(group), topic, brokers, decoder, options))
    }

    pub fn simple_with_decoder(
        name: &str,
        topic: &str,
        brokers: Vec<String>,
        decoder: Decoder<T>,
        options: Vec<ConsumerOption<T>>,
    ) -> Result<Self> {
        validate(name, topic, &brokers)?;
        Ok(Self::build(name, None, topic, brokers, decoder, options))
    }

    fn build(
        name: &str,
        group: Option<&str>,
        topic: &str,
        brokers: Vec<String>,
        decoder: Decoder<T>,
        options: Vec<ConsumerOption<T>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            group: group.map(str::to_string),
            topic: topic.to_string(),
            brokers,
            decoder,
            options,
            connector: Arc::new(RdKafkaConnector),
        }
    }

    /// Replace the librdkafka backed connector.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Create a consumer.
    ///
    /// Options are applied in order; the first failing one aborts creation.
    pub fn create(&self) -> Result<Box<dyn Consumer<T>>> {
        let config = self.config()?;
        let connector = Arc::clone(&self.connector);
        let consumer: Box<dyn Consumer<T>> = match &self.group {
            Some(group) => Box::new(GroupConsumer::new(group, config, connector)),
            None => Box::new(SimpleConsumer::new(config, connector)),
        };
        Ok(consumer)
    }

    /// The configuration `create` hands to the consumer.
    pub fn config(&self) -> Result<ConsumerConfig<T>> {
        let mut config = ConsumerConfig {
            brokers: self.brokers.clone(),
            topic: self.topic.clone(),
            group: self.group.clone(),
            buffer_size: match self.group {
                Some(_) => DEFAULT_GROUP_BUFFER,
                None => DEFAULT_SIMPLE_BUFFER,
            },
            decoder: Arc::clone(&self.decoder),
            client: default_client_config(&self.name),
            start: StartOffset::default(),
            decode_mode: DecodeMode::default(),
            retry: RetryPolicy::forever(),
        };

        for option in &self.options {
            option
                .apply(&mut config)
                .map_err(|source| Error::Option {
                    option: option.name(),
                    source,
                })?;
        }
        Ok(config)
    }
}

fn validate(name: &str, topic: &str, brokers: &[String]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidConfig("name is required".to_string()));
    }
    if brokers.is_empty() {
        return Err(Error::InvalidConfig(
            "provide at least one broker".to_string(),
        ));
    }
    if topic.is_empty() {
        return Err(Error::InvalidConfig("topic is required".to_string()));
    }
    Ok(())
}
