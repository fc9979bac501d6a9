use crate::error::{Error, Result};
use crate::message::Message;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Message queue and error queue returned by [`Consumer::consume`].
pub type Streams<T> = (mpsc::Receiver<Message<T>>, mpsc::Receiver<Error>);

/// A Kafka consumer streaming decoded messages and errors.
///
/// Implemented by [`crate::GroupConsumer`] and [`crate::SimpleConsumer`].
#[async_trait]
pub trait Consumer<T>: Send {
    /// Start consuming.
    ///
    /// Returns once the broker client is set up; messages and errors then
    /// stream in the background until `token` (or [`Consumer::close`])
    /// cancels consumption. An error here means nothing was started. Can be
    /// called once per consumer.
    async fn consume(&mut self, token: &CancellationToken) -> Result<Streams<T>>;

    /// Stop consuming and release the broker client.
    ///
    /// Safe to call more than once, and before `consume`.
    async fn close(&mut self) -> Result<()>;
}

/// Send `value` unless `token` is cancelled first.
///
/// Returns false when the value was not delivered.
pub(crate) async fn forward<V>(
    queue: &mpsc::Sender<V>,
    value: V,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        sent = queue.send(value) => sent.is_ok(),
    }
}
