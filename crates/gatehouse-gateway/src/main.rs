//! Gatehouse Gateway Binary
//!
//! Wires the configured store variants into a `Gateway` and serves until
//! SIGINT/SIGTERM. With `--flush-inflights-only` it instead starts the pub
//! store, replays every buffered hinted-handoff block, and exits.
//!
//! ## Logging
//!
//! Controlled via `RUST_LOG`:
//! ```bash
//! RUST_LOG=debug gatehouse --store dummy
//! RUST_LOG=info  gatehouse --hh-dirs /data/a,/data/b --job-topics orders
//! ```

use clap::Parser;
use gatehouse_gateway::config::Options;
use gatehouse_gateway::gateway::{broker_delivery, Gateway, GatewayConfig};
use gatehouse_gateway::sub_server::SubConfig;
use gatehouse_hh::{DiskHandoff, DummyHandoff, Handoff, HandoffConfig};
use gatehouse_jobs::{DummyJobStore, ExecutorConfig, JobStore, SqliteJobStore};
use gatehouse_store::{
    DummyManager, DummyOffsetStore, DummyPubStore, DummyRegistry, DummySubStore, InstanceInfo,
    ManagerStore, MemoryBroker, PubStore, Registry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opts = Options::parse();

    if opts.store != "dummy" {
        return Err(format!(
            "unsupported store '{}': this build ships the dummy broker; \
             a real broker client plugs in behind the PubStore/SubStore traits",
            opts.store
        )
        .into());
    }

    let broker = MemoryBroker::new();
    let pub_store: Arc<dyn PubStore> = Arc::new(DummyPubStore::new(broker.clone()));
    let sub_store = Arc::new(DummySubStore::new(broker.clone()));
    let offset_store = Arc::new(DummyOffsetStore::new(broker.clone()));
    let manager: Arc<dyn ManagerStore> = if opts.permit_unregistered_group {
        Arc::new(DummyManager::permissive(opts.cluster.clone()))
    } else {
        Arc::new(DummyManager::new(opts.cluster.clone()))
    };

    let handoff: Arc<dyn Handoff> = match opts.hinted_handoff.as_str() {
        "disk" => {
            let cfg = HandoffConfig {
                dirs: opts.hh_dirs.clone(),
                ..Default::default()
            };
            Arc::new(DiskHandoff::new(cfg, broker_delivery(pub_store.clone()))?)
        }
        "dummy" => Arc::new(DummyHandoff),
        other => return Err(format!("unknown hinted handoff type: {other}").into()),
    };

    if opts.flush_inflights_only {
        pub_store.start().await?;
        info!(store = pub_store.name(), "pub store started");
        handoff.flush_inflights().await?;
        return Ok(());
    }

    let job_store: Arc<dyn JobStore> = if opts.job_db == "dummy" {
        Arc::new(DummyJobStore)
    } else {
        Arc::new(SqliteJobStore::new(&opts.job_db).await?)
    };

    let registry: Arc<dyn Registry> = Arc::new(DummyRegistry::new());
    let cfg = GatewayConfig {
        info: InstanceInfo {
            id: opts.id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: hostname(),
            pub_addr: opts.pub_addr.to_string(),
            sub_addr: opts.sub_addr.to_string(),
        },
        cluster: opts.cluster.clone(),
        pub_addr: opts.pub_addr,
        sub: SubConfig {
            addr: opts.sub_addr,
            sub_timeout: Duration::from_secs(opts.sub_timeout),
            ..Default::default()
        },
        jobs: ExecutorConfig {
            handler_concurrency: opts.job_handlers,
            ..Default::default()
        },
        job_topics: opts.job_topics.clone(),
    };

    let mut gateway = Gateway::new(
        cfg,
        offset_store,
        manager,
        pub_store,
        sub_store,
        handoff,
        job_store,
        Some(registry),
    );
    gateway.start().await?;
    gateway.serve_forever().await;
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
