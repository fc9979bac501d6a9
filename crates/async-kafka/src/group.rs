//! Consumer group strategy.
//!
//! Partitions are spread over every live member of the group by the broker.
//! Two tasks run per consumer:
//!
//! - a watchdog that closes the group client on cancellation, or on a fatal
//!   client error which it also forwards to the error queue;
//! - the session loop, which re-enters the group protocol after every session
//!   (rebalance or failure) and pumps each assigned claim through
//!   [`MessageHandler`].
//!
//! Records of one partition are decoded and queued in offset order.

use crate::broker::{Claim, ClaimHandler, Connector, GroupClient};
use crate::claim;
use crate::config::{ConsumerConfig, Decoder};
use crate::consumer::{forward, Consumer, Streams};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::metrics;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct GroupConsumer<T> {
    group: String,
    config: ConsumerConfig<T>,
    connector: Arc<dyn Connector>,
    token: Option<CancellationToken>,
    client: Option<Arc<ClientCloser>>,
}

/// Closes the group client once; every caller sees the outcome of that first
/// close, whether it came from [`GroupConsumer::close`] or the watchdog.
struct ClientCloser {
    client: Arc<dyn GroupClient>,
    result: OnceCell<std::result::Result<(), Arc<Error>>>,
}

impl ClientCloser {
    fn new(client: Arc<dyn GroupClient>) -> Self {
        Self {
            client,
            result: OnceCell::new(),
        }
    }

    async fn close(&self) -> std::result::Result<(), Arc<Error>> {
        self.result
            .get_or_init(|| async { self.client.close().await.map_err(Arc::new) })
            .await
            .clone()
    }
}

impl<T: Send + 'static> GroupConsumer<T> {
    pub fn new(group: &str, config: ConsumerConfig<T>, connector: Arc<dyn Connector>) -> Self {
        Self {
            group: group.to_string(),
            config,
            connector,
            token: None,
            client: None,
        }
    }

    pub fn config(&self) -> &ConsumerConfig<T> {
        &self.config
    }
}

#[async_trait]
impl<T: Send + 'static> Consumer<T> for GroupConsumer<T> {
    async fn consume(&mut self, token: &CancellationToken) -> Result<Streams<T>> {
        if self.client.is_some() {
            return Err(Error::AlreadyConsuming);
        }

        let token = token.child_token();
        self.token = Some(token.clone());

        let client = self
            .connector
            .group(&self.config.group_client_config(&self.group))
            .await?;
        let closer = Arc::new(ClientCloser::new(Arc::clone(&client)));
        self.client = Some(Arc::clone(&closer));
        info!(
            "consuming messages from topic '{}' using group '{}'",
            self.config.topic, self.group
        );

        let (messages_tx, messages_rx) = mpsc::channel(self.config.queue_capacity());
        let (errors_tx, errors_rx) = mpsc::channel(self.config.queue_capacity());

        tokio::spawn(watchdog(
            Arc::clone(&client),
            closer,
            token.clone(),
            errors_tx.clone(),
        ));

        let handler = Arc::new(MessageHandler {
            group: self.group.clone(),
            decoder: Arc::clone(&self.config.decoder),
            messages: messages_tx,
        });
        tokio::spawn(run_sessions(
            client,
            self.config.topic.clone(),
            token,
            handler,
            errors_tx,
            self.config.retry.clone(),
        ));

        Ok((messages_rx, errors_rx))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(token) = &self.token {
            token.cancel();
        }

        let Some(closer) = self.client.as_ref() else {
            return Ok(());
        };
        closer.close().await.map_err(Error::Close)
    }
}

async fn watchdog(
    client: Arc<dyn GroupClient>,
    closer: Arc<ClientCloser>,
    token: CancellationToken,
    errors: mpsc::Sender<Error>,
) {
    let fatal = tokio::select! {
        _ = token.cancelled() => None,
        fatal = client.fatal_error() => fatal,
    };

    match fatal {
        None if token.is_cancelled() => {
            info!("canceling consuming messages requested");
            close_client(&closer).await;
        }
        None => debug!("consumer group client closed"),
        Some(e) => {
            error!("consumer group client failed: {e}");
            close_client(&closer).await;
            forward(&errors, e, &token).await;
        }
    }
}

async fn close_client(closer: &ClientCloser) {
    if let Err(e) = closer.close().await {
        error!("failed to close consumer group client: {e}");
    }
}

/// Re-enter the group protocol until the client is closed or the token is
/// cancelled. Every failing session is reported on the error queue; the
/// retry policy decides how long to wait before the next one.
async fn run_sessions<T: Send + 'static>(
    client: Arc<dyn GroupClient>,
    topic: String,
    token: CancellationToken,
    handler: Arc<MessageHandler<T>>,
    errors: mpsc::Sender<Error>,
    retry: RetryPolicy,
) {
    let topics = [topic];
    let mut failures: u32 = 0;
    let mut failing_since: Option<Instant> = None;

    while !token.is_cancelled() {
        let result = client
            .consume(&topics, &token, Arc::clone(&handler) as Arc<dyn ClaimHandler>)
            .await;

        let e = match result {
            Ok(()) => {
                debug!("consumer group session for topic '{}' ended", topics[0]);
                failures = 0;
                failing_since = None;
                continue;
            }
            Err(Error::ClientClosed) => break,
            Err(e) => e,
        };

        failures = failures.saturating_add(1);
        let elapsed = failing_since.get_or_insert_with(Instant::now).elapsed();
        let Some(delay) = retry.next_delay(failures, elapsed) else {
            error!("consumer group session failed {failures} times in a row, giving up: {e}");
            let exhausted = Error::RetriesExhausted {
                attempts: failures,
                source: Box::new(e),
            };
            forward(&errors, exhausted, &token).await;
            break;
        };

        warn!("consumer group session failed: {e}");
        if !forward(&errors, e, &token).await {
            break;
        }
        if !delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    debug!("leaving consumer group session loop");
}

/// Claim handler feeding the message queue.
pub(crate) struct MessageHandler<T> {
    group: String,
    decoder: Decoder<T>,
    messages: mpsc::Sender<Message<T>>,
}

#[async_trait]
impl<T: Send + 'static> ClaimHandler for MessageHandler<T> {
    async fn consume_claim(
        &self,
        claim: &mut dyn Claim,
        session: &CancellationToken,
    ) -> Result<()> {
        debug!(
            "claimed partition {} of topic '{}'",
            claim.partition(),
            claim.topic()
        );

        loop {
            let record = tokio::select! {
                _ = session.cancelled() => None,
                record = claim.next() => record,
            };
            let Some(record) = record else {
                return Ok(());
            };

            metrics::set_offset_diff(
                &self.group,
                &record.topic,
                record.partition,
                claim.high_water_mark(),
                record.offset,
            );
            let message = claim::process(record, &self.decoder, Some(self.group.as_str()))?;

            if !forward(&self.messages, message, session).await {
                return Ok(());
            }
        }
    }
}
