//! Store Capabilities
//!
//! The gateway's external collaborators, modeled as capability traits with a
//! shared `Lifecycle` surface. Each has a real variant (backed by an actual
//! broker / coordination store) and an in-memory dummy; selection is
//! configuration-driven, and every component receives its stores as explicit
//! dependencies - there are no process-wide singletons.

use crate::error::{OffsetError, Result};
use crate::types::{InstanceInfo, SubMessage};
use async_trait::async_trait;
use bytes::Bytes;

/// Start/stop/name surface shared by every store
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self);
}

/// Publish side of the broker
#[async_trait]
pub trait PubStore: Lifecycle {
    /// Synchronously publish one message.
    ///
    /// Returns the (partition, offset) the broker assigned. `BrokerDown`
    /// errors are transient and callers fall back to hinted handoff.
    async fn sync_pub(
        &self,
        cluster: &str,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<(i32, i64)>;
}

/// Subscribe side of the broker
#[async_trait]
pub trait SubStore: Lifecycle {
    /// Fetch the next batch for a consumer group, at most `limit` messages.
    ///
    /// `client` identifies the HTTP connection driving this group member;
    /// fetcher state is keyed by it and torn down via `teardown_client`.
    async fn fetch(
        &self,
        cluster: &str,
        topic: &str,
        group: &str,
        client: &str,
        limit: usize,
    ) -> Result<Vec<SubMessage>>;

    /// Drop any fetcher state held for a disconnected client.
    async fn teardown_client(&self, client: &str);
}

/// Consumer-offset coordination store
#[async_trait]
pub trait OffsetStore: Lifecycle {
    /// Commit a consumer-group offset.
    ///
    /// `OffsetError::NodeMissing` means the (group, topic, partition) node
    /// does not exist; the commit is invalid and must not be retried.
    async fn reset_consumer_group_offset(
        &self,
        cluster: &str,
        topic: &str,
        group: &str,
        partition: &str,
        offset: i64,
    ) -> std::result::Result<(), OffsetError>;
}

/// Topic/application manager store
#[async_trait]
pub trait ManagerStore: Lifecycle {
    /// Owning application id for a topic, None when the topic is unknown.
    async fn topic_appid(&self, topic: &str) -> Option<String>;

    /// Whether a consumer group has been registered.
    async fn group_registered(&self, group: &str) -> bool;
}

/// Service registry the gateway announces itself in
#[async_trait]
pub trait Registry: Send + Sync {
    fn name(&self) -> &'static str;

    async fn register(&self, info: &InstanceInfo) -> Result<()>;

    async fn deregister(&self, id: &str) -> Result<()>;
}
