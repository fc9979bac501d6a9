//! Broker client seam.
//!
//! The consumers only talk to the broker through these traits. [`crate::client`]
//! implements them on top of librdkafka and [`crate::testing`] keeps
//! everything in memory.

use crate::config::StartOffset;
use crate::error::{Error, Result};
use crate::message::RawRecord;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Records of one partition assigned to this member for one session.
#[async_trait]
pub trait Claim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Offset the next produced record will get.
    fn high_water_mark(&self) -> i64;

    /// Next record of the claim, `None` once the session is over.
    async fn next(&mut self) -> Option<RawRecord>;
}

/// Callback run by a [`GroupClient`] for every claim of a session.
///
/// Claims of one session run concurrently. Returning an error ends the whole
/// session with that error.
#[async_trait]
pub trait ClaimHandler: Send + Sync {
    async fn consume_claim(&self, claim: &mut dyn Claim, session: &CancellationToken)
        -> Result<()>;
}

/// Group membership client.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Join the group for `topics` and run one session.
    ///
    /// Blocks until the assignment is revoked, `token` is cancelled or a claim
    /// fails. Returns [`Error::ClientClosed`] once the client was closed.
    async fn consume(
        &self,
        topics: &[String],
        token: &CancellationToken,
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<()>;

    /// Wait for the next fatal client error; `None` once the client is closed.
    async fn fatal_error(&self) -> Option<Error>;

    /// Leave the group and release the client. Closing twice is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Reader of a single partition.
#[async_trait]
pub trait PartitionReader: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Offset the next produced record will get.
    fn high_water_mark(&self) -> i64;

    /// Next record; an error is fatal for this reader. `Ok(None)` means the
    /// reader was shut down underneath us.
    async fn next(&mut self) -> Result<Option<RawRecord>>;

    async fn close(&mut self) -> Result<()>;
}

/// Client reading partitions without group coordination.
#[async_trait]
pub trait DirectClient: Send + Sync {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    async fn open_partition(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionReader>>;

    async fn close(&self) -> Result<()>;
}

/// Opens broker clients from librdkafka style properties.
#[async_trait]
pub trait Connector: Send + Sync {
    /// `config` carries `bootstrap.servers` and `group.id`.
    async fn group(&self, config: &ClientConfig) -> Result<Arc<dyn GroupClient>>;

    /// `config` carries `bootstrap.servers`.
    async fn direct(&self, config: &ClientConfig) -> Result<Arc<dyn DirectClient>>;
}
