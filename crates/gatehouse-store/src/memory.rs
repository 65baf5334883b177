//! In-Memory Broker and Dummy Stores
//!
//! A single `MemoryBroker` backs the dummy variants of every store trait, so
//! a gateway configured with `--store dummy` behaves end to end: publishes
//! land in per-topic logs, subscribers consume them through group cursors,
//! and offset commits mutate the same state the fetch side reads.
//!
//! The broker can be flipped "down" (`set_down`) to exercise the hinted
//! handoff fallback without a real outage.

use crate::error::{OffsetError, Result, StoreError};
use crate::traits::{Lifecycle, ManagerStore, OffsetStore, PubStore, Registry, SubStore};
use crate::types::{InstanceInfo, SubMessage};
use async_trait::async_trait;
use bytes::Bytes;
use gatehouse_core::ClusterTopic;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Bytes,
    value: Bytes,
}

/// Shared state of the dummy broker
#[derive(Default)]
pub struct MemoryBroker {
    topics: RwLock<HashMap<ClusterTopic, Vec<StoredMessage>>>,
    // next fetch position per (cluster/topic, group)
    cursors: RwLock<HashMap<(ClusterTopic, String), usize>>,
    // committed offsets per (cluster/topic, group, partition)
    committed: RwLock<HashMap<(ClusterTopic, String, i32), i64>>,
    down: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate a broker outage; publishes and fetches fail until cleared.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// All values published to a topic, in publish order.
    pub async fn published(&self, cluster: &str, topic: &str) -> Vec<Bytes> {
        let ct = ClusterTopic::new(cluster, topic);
        self.topics
            .read()
            .await
            .get(&ct)
            .map(|msgs| msgs.iter().map(|m| m.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Committed offset for a group/partition, if any.
    pub async fn committed_offset(
        &self,
        cluster: &str,
        topic: &str,
        group: &str,
        partition: i32,
    ) -> Option<i64> {
        let ct = ClusterTopic::new(cluster, topic);
        self.committed
            .read()
            .await
            .get(&(ct, group.to_string(), partition))
            .copied()
    }
}

/// Dummy publish store over the in-memory broker
pub struct DummyPubStore {
    broker: Arc<MemoryBroker>,
}

impl DummyPubStore {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Lifecycle for DummyPubStore {
    fn name(&self) -> &'static str {
        "dummy-pub"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}

#[async_trait]
impl PubStore for DummyPubStore {
    async fn sync_pub(
        &self,
        cluster: &str,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<(i32, i64)> {
        if self.broker.is_down() {
            return Err(StoreError::BrokerDown("dummy broker down".into()));
        }

        let ct = ClusterTopic::new(cluster, topic);
        let mut topics = self.broker.topics.write().await;
        let log = topics.entry(ct).or_default();
        log.push(StoredMessage {
            key: key.unwrap_or_default(),
            value,
        });
        Ok((0, (log.len() - 1) as i64))
    }
}

/// Dummy subscribe store over the in-memory broker
pub struct DummySubStore {
    broker: Arc<MemoryBroker>,
    clients: Mutex<HashSet<String>>,
}

impl DummySubStore {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            clients: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl Lifecycle for DummySubStore {
    fn name(&self) -> &'static str {
        "dummy-sub"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}

#[async_trait]
impl SubStore for DummySubStore {
    async fn fetch(
        &self,
        cluster: &str,
        topic: &str,
        group: &str,
        client: &str,
        limit: usize,
    ) -> Result<Vec<SubMessage>> {
        if self.broker.is_down() {
            return Err(StoreError::BrokerDown("dummy broker down".into()));
        }
        self.clients.lock().await.insert(client.to_string());

        let ct = ClusterTopic::new(cluster, topic);
        let topics = self.broker.topics.read().await;
        let Some(log) = topics.get(&ct) else {
            return Ok(Vec::new());
        };

        let mut cursors = self.broker.cursors.write().await;
        let pos = cursors.entry((ct, group.to_string())).or_insert(0);

        let batch: Vec<SubMessage> = log
            .iter()
            .enumerate()
            .skip(*pos)
            .take(limit)
            .map(|(i, m)| SubMessage {
                partition: 0,
                offset: i as i64,
                key: m.key.clone(),
                value: m.value.clone(),
            })
            .collect();
        *pos += batch.len();
        Ok(batch)
    }

    async fn teardown_client(&self, client: &str) {
        if self.clients.lock().await.remove(client) {
            debug!(client, "fetcher state torn down");
        }
    }
}

/// Dummy coordination store over the in-memory broker
pub struct DummyOffsetStore {
    broker: Arc<MemoryBroker>,
}

impl DummyOffsetStore {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Lifecycle for DummyOffsetStore {
    fn name(&self) -> &'static str {
        "dummy-offsets"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}

#[async_trait]
impl OffsetStore for DummyOffsetStore {
    async fn reset_consumer_group_offset(
        &self,
        cluster: &str,
        topic: &str,
        group: &str,
        partition: &str,
        offset: i64,
    ) -> std::result::Result<(), OffsetError> {
        let partition: i32 = partition
            .parse()
            .map_err(|_| OffsetError::Backend(format!("bad partition: {partition}")))?;

        let ct = ClusterTopic::new(cluster, topic);
        // no group node until the group has fetched at least once
        let known = self
            .broker
            .cursors
            .read()
            .await
            .contains_key(&(ct.clone(), group.to_string()));
        if !known {
            return Err(OffsetError::NodeMissing);
        }

        self.broker
            .committed
            .write()
            .await
            .insert((ct, group.to_string(), partition), offset);
        Ok(())
    }
}

/// Dummy manager store
pub struct DummyManager {
    cluster: String,
    appids: RwLock<HashMap<String, String>>,
    groups: RwLock<HashSet<String>>,
    allow_all: bool,
}

impl DummyManager {
    /// Empty manager: every topic and group must be registered explicitly.
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            appids: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashSet::new()),
            allow_all: false,
        }
    }

    /// Manager that accepts every topic and group, for open deployments.
    pub fn permissive(cluster: impl Into<String>) -> Self {
        Self {
            allow_all: true,
            ..Self::new(cluster)
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub async fn register_topic(&self, topic: impl Into<String>, appid: impl Into<String>) {
        self.appids.write().await.insert(topic.into(), appid.into());
    }

    pub async fn register_group(&self, group: impl Into<String>) {
        self.groups.write().await.insert(group.into());
    }
}

#[async_trait]
impl Lifecycle for DummyManager {
    fn name(&self) -> &'static str {
        "dummy-manager"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}

#[async_trait]
impl ManagerStore for DummyManager {
    async fn topic_appid(&self, topic: &str) -> Option<String> {
        if let Some(appid) = self.appids.read().await.get(topic) {
            return Some(appid.clone());
        }
        self.allow_all.then(|| "app1".to_string())
    }

    async fn group_registered(&self, group: &str) -> bool {
        self.allow_all || self.groups.read().await.contains(group)
    }
}

/// Dummy registry recording announcements
#[derive(Default)]
pub struct DummyRegistry {
    registered: Mutex<Vec<String>>,
}

impl DummyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn registered_ids(&self) -> Vec<String> {
        self.registered.lock().await.clone()
    }
}

#[async_trait]
impl Registry for DummyRegistry {
    fn name(&self) -> &'static str {
        "dummy-registry"
    }

    async fn register(&self, info: &InstanceInfo) -> Result<()> {
        self.registered.lock().await.push(info.id.clone());
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.registered.lock().await.retain(|r| r != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pub_then_fetch() {
        let broker = MemoryBroker::new();
        let pubs = DummyPubStore::new(broker.clone());
        let subs = DummySubStore::new(broker.clone());

        pubs.sync_pub("c1", "t1", None, Bytes::from("a")).await.unwrap();
        let (partition, offset) = pubs
            .sync_pub("c1", "t1", Some(Bytes::from("k")), Bytes::from("b"))
            .await
            .unwrap();
        assert_eq!((partition, offset), (0, 1));

        let batch = subs.fetch("c1", "t1", "g1", "10.0.0.1:1234", 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].value, Bytes::from("a"));
        assert_eq!(batch[1].offset, 1);

        // the group cursor advanced past both messages
        let batch = subs.fetch("c1", "t1", "g1", "10.0.0.1:1234", 10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_down_broker_fails_pub() {
        let broker = MemoryBroker::new();
        let pubs = DummyPubStore::new(broker.clone());

        broker.set_down(true);
        let err = pubs
            .sync_pub("c1", "t1", None, Bytes::from("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BrokerDown(_)));

        broker.set_down(false);
        pubs.sync_pub("c1", "t1", None, Bytes::from("x")).await.unwrap();
    }

    #[tokio::test]
    async fn test_offset_commit_for_unknown_group_is_node_missing() {
        let broker = MemoryBroker::new();
        let offsets = DummyOffsetStore::new(broker.clone());

        let err = offsets
            .reset_consumer_group_offset("c1", "t1", "ghost", "3", 42)
            .await
            .unwrap_err();
        assert!(matches!(err, OffsetError::NodeMissing));
    }

    #[tokio::test]
    async fn test_offset_commit_roundtrip() {
        let broker = MemoryBroker::new();
        let pubs = DummyPubStore::new(broker.clone());
        let subs = DummySubStore::new(broker.clone());
        let offsets = DummyOffsetStore::new(broker.clone());

        pubs.sync_pub("c1", "t1", None, Bytes::from("m")).await.unwrap();
        subs.fetch("c1", "t1", "g1", "client", 10).await.unwrap();

        offsets
            .reset_consumer_group_offset("c1", "t1", "g1", "0", 0)
            .await
            .unwrap();
        assert_eq!(broker.committed_offset("c1", "t1", "g1", 0).await, Some(0));
    }

    #[tokio::test]
    async fn test_manager_registration() {
        let manager = DummyManager::new("c1");
        assert_eq!(manager.topic_appid("orders").await, None);
        assert!(!manager.group_registered("g1").await);

        manager.register_topic("orders", "app42").await;
        manager.register_group("g1").await;
        assert_eq!(manager.topic_appid("orders").await, Some("app42".into()));
        assert!(manager.group_registered("g1").await);

        let open = DummyManager::permissive("c1");
        assert!(open.topic_appid("anything").await.is_some());
        assert!(open.group_registered("whoever").await);
    }

    #[tokio::test]
    async fn test_registry_roundtrip() {
        let registry = DummyRegistry::new();
        let info = InstanceInfo {
            id: "gw-1".into(),
            version: "0.1.0".into(),
            host: "localhost".into(),
            pub_addr: "127.0.0.1:9191".into(),
            sub_addr: "127.0.0.1:9192".into(),
        };
        registry.register(&info).await.unwrap();
        assert_eq!(registry.registered_ids().await, vec!["gw-1".to_string()]);
        registry.deregister("gw-1").await.unwrap();
        assert!(registry.registered_ids().await.is_empty());
    }
}
