//! Gateway lifecycle tests: start order, announce/deregister, idempotent
//! stop, and the delayed-job path under a running gateway.

use gatehouse_gateway::{broker_delivery, Gateway, GatewayConfig, SubConfig};
use gatehouse_hh::{DiskHandoff, HandoffConfig};
use gatehouse_jobs::{ExecutorConfig, JobItem, JobStore, SqliteJobStore};
use gatehouse_store::{
    DummyManager, DummyOffsetStore, DummyPubStore, DummyRegistry, DummySubStore, InstanceInfo,
    MemoryBroker, PubStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn instance(id: &str) -> InstanceInfo {
    InstanceInfo {
        id: id.into(),
        version: "0.1.0".into(),
        host: "localhost".into(),
        pub_addr: "127.0.0.1:0".into(),
        sub_addr: "127.0.0.1:0".into(),
    }
}

async fn build_gateway(
    registry: Arc<DummyRegistry>,
    hh_dir: &TempDir,
) -> (Gateway, Arc<MemoryBroker>, Arc<SqliteJobStore>) {
    let broker = MemoryBroker::new();
    let pub_store: Arc<dyn PubStore> = Arc::new(DummyPubStore::new(broker.clone()));
    let handoff = DiskHandoff::new(
        HandoffConfig {
            dirs: vec![hh_dir.path().to_path_buf()],
            ..Default::default()
        },
        broker_delivery(pub_store.clone()),
    )
    .unwrap();
    let job_store = Arc::new(SqliteJobStore::new_in_memory().await.unwrap());

    let cfg = GatewayConfig {
        info: instance("gw-test"),
        cluster: "c1".into(),
        pub_addr: "127.0.0.1:0".parse().unwrap(),
        sub: SubConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            sub_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        jobs: ExecutorConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
        job_topics: vec!["orders".into()],
    };

    let gateway = Gateway::new(
        cfg,
        Arc::new(DummyOffsetStore::new(broker.clone())),
        Arc::new(DummyManager::permissive("c1")),
        pub_store,
        Arc::new(DummySubStore::new(broker.clone())),
        Arc::new(handoff),
        job_store.clone(),
        Some(registry),
    );
    (gateway, broker, job_store)
}

#[tokio::test]
async fn test_start_announces_and_stop_deregisters() {
    let registry = Arc::new(DummyRegistry::new());
    let hh_dir = TempDir::new().unwrap();
    let (mut gateway, _broker, _jobs) = build_gateway(registry.clone(), &hh_dir).await;

    gateway.start().await.unwrap();
    assert_eq!(registry.registered_ids().await, vec!["gw-test".to_string()]);

    tokio::time::timeout(Duration::from_secs(10), gateway.stop())
        .await
        .expect("stop finishes");
    assert!(registry.registered_ids().await.is_empty());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let registry = Arc::new(DummyRegistry::new());
    let hh_dir = TempDir::new().unwrap();
    let (mut gateway, _broker, _jobs) = build_gateway(registry.clone(), &hh_dir).await;

    gateway.start().await.unwrap();
    gateway.stop().await;
    gateway.stop().await; // second stop is a no-op
    assert!(registry.registered_ids().await.is_empty());
}

#[tokio::test]
async fn test_due_job_fires_under_running_gateway() {
    let registry = Arc::new(DummyRegistry::new());
    let hh_dir = TempDir::new().unwrap();
    let (mut gateway, broker, job_store) = build_gateway(registry, &hh_dir).await;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    job_store.setup_topic("orders").await.unwrap();
    job_store
        .add(
            "orders",
            &JobItem {
                job_id: 1,
                payload: b"delayed".to_vec(),
                ctime: now,
                due_time: now,
            },
        )
        .await
        .unwrap();

    gateway.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let published = !broker.published("c1", "orders").await.is_empty();
        let archived = job_store.archived("orders").await.unwrap().len() == 1;
        if published && archived {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never fired");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    gateway.stop().await;
}
