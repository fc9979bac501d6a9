//! Direct partition strategy.
//!
//! Every partition of the topic is read by this process, without group
//! coordination. One pump task runs per partition.
//!
//! With [`DecodeMode::Concurrent`] (the default) each record is decoded and
//! queued by a task of its own so a slow decode never holds up fetching. The
//! flip side is that records of the same partition can reach the message
//! queue in any order. [`DecodeMode::Ordered`] decodes inline instead.

use crate::broker::{Connector, DirectClient, PartitionReader};
use crate::claim;
use crate::config::{ConsumerConfig, DecodeMode, Decoder, StartOffset};
use crate::consumer::{forward, Consumer, Streams};
use crate::error::{Error, Result};
use crate::message::{Message, RawRecord};
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct SimpleConsumer<T> {
    config: ConsumerConfig<T>,
    connector: Arc<dyn Connector>,
    token: Option<CancellationToken>,
    client: Option<Arc<dyn DirectClient>>,
    consuming: bool,
}

impl<T: Send + 'static> SimpleConsumer<T> {
    pub fn new(config: ConsumerConfig<T>, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            token: None,
            client: None,
            consuming: false,
        }
    }

    pub fn config(&self) -> &ConsumerConfig<T> {
        &self.config
    }
}

#[async_trait]
impl<T: Send + 'static> Consumer<T> for SimpleConsumer<T> {
    async fn consume(&mut self, token: &CancellationToken) -> Result<Streams<T>> {
        if self.consuming {
            return Err(Error::AlreadyConsuming);
        }

        let client = self
            .connector
            .direct(&self.config.direct_client_config())
            .await?;
        info!(
            "consuming messages from topic '{}' without using consumer group",
            self.config.topic
        );

        let readers =
            match open_readers(client.as_ref(), &self.config.topic, self.config.start).await {
                Ok(readers) => readers,
                Err(e) => {
                    if let Err(close_err) = client.close().await {
                        error!("failed to close consumer: {close_err}");
                    }
                    return Err(e);
                }
            };

        let token = token.child_token();
        self.token = Some(token.clone());
        self.client = Some(client);
        self.consuming = true;

        let (messages_tx, messages_rx) = mpsc::channel(self.config.queue_capacity());
        let (errors_tx, errors_rx) = mpsc::channel(self.config.queue_capacity());

        for reader in readers {
            let pump = Pump {
                reader,
                decoder: Arc::clone(&self.config.decoder),
                mode: self.config.decode_mode,
                messages: messages_tx.clone(),
                errors: errors_tx.clone(),
                token: token.clone(),
            };
            tokio::spawn(pump.run());
        }

        Ok((messages_rx, errors_rx))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(token) = &self.token {
            token.cancel();
        }

        // Readers close themselves once they see the cancellation.
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                error!("failed to close consumer: {e}");
            }
        }
        Ok(())
    }
}

/// Open a reader for every partition of `topic`, or none at all.
async fn open_readers(
    client: &dyn DirectClient,
    topic: &str,
    start: StartOffset,
) -> Result<Vec<Box<dyn PartitionReader>>> {
    let partitions = client.partitions(topic).await?;
    // A cluster that is still starting up may report no partitions.
    if partitions.is_empty() {
        return Err(Error::NoPartitions(topic.to_string()));
    }

    let mut readers = Vec::with_capacity(partitions.len());
    for partition in partitions {
        match client.open_partition(topic, partition, start).await {
            Ok(reader) => readers.push(reader),
            Err(e) => {
                for mut reader in readers {
                    close_reader(reader.as_mut()).await;
                }
                return Err(e);
            }
        }
    }
    Ok(readers)
}

async fn close_reader(reader: &mut dyn PartitionReader) {
    if let Err(e) = reader.close().await {
        error!(
            "failed to close partition consumer {}/{}: {e}",
            reader.topic(),
            reader.partition()
        );
    }
}

struct Pump<T> {
    reader: Box<dyn PartitionReader>,
    decoder: Decoder<T>,
    mode: DecodeMode,
    messages: mpsc::Sender<Message<T>>,
    errors: mpsc::Sender<Error>,
    token: CancellationToken,
}

impl<T: Send + 'static> Pump<T> {
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => None,
                next = self.reader.next() => Some(next),
            };

            match next {
                None => {
                    info!("canceling consuming messages requested");
                    close_reader(self.reader.as_mut()).await;
                    return;
                }
                Some(Err(e)) => {
                    close_reader(self.reader.as_mut()).await;
                    forward(&self.errors, e, &self.token).await;
                    return;
                }
                Some(Ok(None)) => {
                    debug!(
                        "partition reader {}/{} stopped",
                        self.reader.topic(),
                        self.reader.partition()
                    );
                    close_reader(self.reader.as_mut()).await;
                    return;
                }
                Some(Ok(Some(record))) => {
                    metrics::set_offset_diff(
                        "",
                        &record.topic,
                        record.partition,
                        self.reader.high_water_mark(),
                        record.offset,
                    );
                    match self.mode {
                        DecodeMode::Concurrent => {
                            tokio::spawn(decode_and_emit(
                                record,
                                Arc::clone(&self.decoder),
                                self.messages.clone(),
                                self.errors.clone(),
                                self.token.clone(),
                            ));
                        }
                        DecodeMode::Ordered => {
                            decode_and_emit(
                                record,
                                Arc::clone(&self.decoder),
                                self.messages.clone(),
                                self.errors.clone(),
                                self.token.clone(),
                            )
                            .await;
                        }
                    }
                }
            }
        }
    }
}

/// A decode error only drops this record; the pump keeps going.
async fn decode_and_emit<T>(
    record: RawRecord,
    decoder: Decoder<T>,
    messages: mpsc::Sender<Message<T>>,
    errors: mpsc::Sender<Error>,
    token: CancellationToken,
) {
    match claim::process(record, &decoder, None) {
        Ok(message) => {
            forward(&messages, message, &token).await;
        }
        Err(e) => {
            forward(&errors, e, &token).await;
        }
    }
}
