//! Named configuration mutators applied by the factory.
//!
//! Options run in declaration order when a consumer is created. The first one
//! that fails aborts creation and is reported by name.

use crate::config::{json_decoder, ConsumerConfig, DecodeMode, Decoder, StartOffset};
use crate::error::BoxError;
use crate::retry::RetryPolicy;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type Apply<T> =
    Arc<dyn Fn(&mut ConsumerConfig<T>) -> std::result::Result<(), BoxError> + Send + Sync>;

pub struct ConsumerOption<T> {
    name: &'static str,
    apply: Apply<T>,
}

impl<T> ConsumerOption<T> {
    pub fn new<F>(name: &'static str, apply: F) -> Self
    where
        F: Fn(&mut ConsumerConfig<T>) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            name,
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn apply(&self, config: &mut ConsumerConfig<T>) -> std::result::Result<(), BoxError> {
        (self.apply)(config)
    }
}

impl<T> Clone for ConsumerOption<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            apply: Arc::clone(&self.apply),
        }
    }
}

impl<T> fmt::Debug for ConsumerOption<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConsumerOption").field(&self.name).finish()
    }
}

/// Capacity of the message and error queues.
pub fn buffer<T: 'static>(size: usize) -> ConsumerOption<T> {
    ConsumerOption::new("buffer", move |config| {
        config.buffer_size = size;
        Ok(())
    })
}

/// Replace the payload decoder.
pub fn decoder<T, F>(decode: F) -> ConsumerOption<T>
where
    T: 'static,
    F: Fn(&[u8]) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
{
    let decode: Decoder<T> = Arc::new(decode);
    ConsumerOption::new("decoder", move |config| {
        config.decoder = Arc::clone(&decode);
        Ok(())
    })
}

/// Decode payloads as JSON.
pub fn json<T: DeserializeOwned + 'static>() -> ConsumerOption<T> {
    ConsumerOption::new("json_decoder", |config| {
        config.decoder = json_decoder();
        Ok(())
    })
}

/// Offset policy used when there is no committed position.
pub fn start<T: 'static>(start: StartOffset) -> ConsumerOption<T> {
    ConsumerOption::new("start", move |config| {
        config.start = start;
        Ok(())
    })
}

/// Raw librdkafka property.
pub fn client_setting<T: 'static>(key: &str, value: &str) -> ConsumerOption<T> {
    let key = key.to_string();
    let value = value.to_string();
    ConsumerOption::new("client_setting", move |config| {
        if key.is_empty() || value.is_empty() {
            return Err("client setting key and value must not be empty".into());
        }
        config.client.set(key.clone(), value.clone());
        Ok(())
    })
}

pub fn session_timeout<T: 'static>(timeout: Duration) -> ConsumerOption<T> {
    ConsumerOption::new("session_timeout", move |config| {
        if timeout.is_zero() {
            return Err("session timeout must be positive".into());
        }
        config
            .client
            .set("session.timeout.ms", timeout.as_millis().to_string());
        Ok(())
    })
}

/// Simple mode decoding strategy.
pub fn decode_mode<T: 'static>(mode: DecodeMode) -> ConsumerOption<T> {
    ConsumerOption::new("decode_mode", move |config| {
        config.decode_mode = mode;
        Ok(())
    })
}

/// Group mode session retry policy.
pub fn retry_policy<T: 'static>(policy: RetryPolicy) -> ConsumerOption<T> {
    ConsumerOption::new("retry_policy", move |config| {
        if policy.max_attempts == Some(0) {
            return Err("retry policy must allow at least one attempt".into());
        }
        config.retry = policy.clone();
        Ok(())
    })
}
