//! Gateway Lifecycle
//!
//! The top-level coordinator owning every store and server as an explicit
//! dependency. Start order builds the stack leaves-first; stop order is
//! strictly the reverse, and each server's completion is awaited before its
//! backing store is torn down:
//!
//! ```text
//! start: offsets -> manager -> pub store -> handoff -> job store
//!        -> pub server -> sub store -> sub server (+ committer, executors)
//!        -> registry announce
//! stop:  registry deregister -> servers drain -> committer/executors drain
//!        -> sub store -> job store -> handoff -> pub store -> manager
//!        -> offsets
//! ```
//!
//! SIGINT and SIGTERM both trigger the same one-shot graceful stop; SIGHUP
//! is swallowed.

use crate::ack::AckCommitter;
use crate::pub_server::{self, PubState};
use crate::sub_server::{SubConfig, SubServer};
use gatehouse_hh::{DeliveryError, DeliveryFn, Handoff};
use gatehouse_jobs::{ExecutorConfig, JobExecutor, JobStore};
use gatehouse_store::{
    InstanceInfo, ManagerStore, OffsetStore, PubStore, Registry, StoreError, SubStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub type GatewayResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Wrap a pub store as the handoff drain callback, classifying its errors
/// into park-and-retry (`BrokerDown`) versus bounded-retry (`Rejected`).
pub fn broker_delivery(pub_store: Arc<dyn PubStore>) -> DeliveryFn {
    Arc::new(move |ct, block| {
        let pub_store = pub_store.clone();
        Box::pin(async move {
            let key = if block.key.is_empty() {
                None
            } else {
                Some(block.key.clone())
            };
            match pub_store
                .sync_pub(&ct.cluster, &ct.topic, key, block.value.clone())
                .await
            {
                Ok(_) => Ok(()),
                Err(StoreError::BrokerDown(reason)) => Err(DeliveryError::BrokerDown(reason)),
                Err(e) => Err(DeliveryError::Rejected(e.to_string())),
            }
        })
    })
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub info: InstanceInfo,
    pub cluster: String,
    pub pub_addr: SocketAddr,
    pub sub: SubConfig,
    pub jobs: ExecutorConfig,
    /// Topics with delayed-job executors attached
    pub job_topics: Vec<String>,
}

struct Running {
    pub_server: JoinHandle<std::io::Result<()>>,
    sub_server: JoinHandle<std::io::Result<()>>,
    sub_completion: oneshot::Receiver<()>,
    committer: JoinHandle<()>,
    teardown: JoinHandle<()>,
    executors: Vec<JoinHandle<()>>,
}

pub struct Gateway {
    cfg: GatewayConfig,
    offset_store: Arc<dyn OffsetStore>,
    manager: Arc<dyn ManagerStore>,
    pub_store: Arc<dyn PubStore>,
    sub_store: Arc<dyn SubStore>,
    handoff: Arc<dyn Handoff>,
    job_store: Arc<dyn JobStore>,
    registry: Option<Arc<dyn Registry>>,
    shutdown: watch::Sender<bool>,
    running: Option<Running>,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: GatewayConfig,
        offset_store: Arc<dyn OffsetStore>,
        manager: Arc<dyn ManagerStore>,
        pub_store: Arc<dyn PubStore>,
        sub_store: Arc<dyn SubStore>,
        handoff: Arc<dyn Handoff>,
        job_store: Arc<dyn JobStore>,
        registry: Option<Arc<dyn Registry>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cfg,
            offset_store,
            manager,
            pub_store,
            sub_store,
            handoff,
            job_store,
            registry,
            shutdown,
            running: None,
        }
    }

    /// Bring the whole stack up, registering with the registry last so
    /// traffic only arrives once everything below is ready.
    pub async fn start(&mut self) -> GatewayResult<()> {
        info!(id = %self.cfg.info.id, "starting gateway");

        self.offset_store.start().await?;
        info!(store = self.offset_store.name(), "offset store started");

        self.manager.start().await?;
        info!(store = self.manager.name(), "manager store started");

        self.pub_store.start().await?;
        info!(store = self.pub_store.name(), "pub store started");

        self.handoff.start().await?;
        info!(handoff = self.handoff.name(), "hinted handoff started");

        self.job_store.start().await?;
        info!(store = self.job_store.name(), "job store started");

        let pub_state = PubState {
            pub_store: self.pub_store.clone(),
            handoff: self.handoff.clone(),
            manager: self.manager.clone(),
            job_store: self.job_store.clone(),
        };
        let pub_server = tokio::spawn(pub_server::serve(
            self.cfg.pub_addr,
            pub_state,
            self.shutdown.subscribe(),
        ));

        self.sub_store.start().await?;
        info!(store = self.sub_store.name(), "sub store started");

        let (sub_server, mut closed_rx, ack_rx) = SubServer::new(
            self.cfg.sub.clone(),
            self.sub_store.clone(),
            self.manager.clone(),
            self.shutdown.subscribe(),
        );
        let committer = tokio::spawn(AckCommitter::new(self.offset_store.clone(), ack_rx).run());
        let teardown = {
            let sub_store = self.sub_store.clone();
            tokio::spawn(async move {
                while let Some(remote) = closed_rx.recv().await {
                    sub_store.teardown_client(&remote).await;
                }
            })
        };
        let (completion_tx, sub_completion) = oneshot::channel();
        let sub_server = tokio::spawn(sub_server.run(completion_tx));

        let mut executors = Vec::with_capacity(self.cfg.job_topics.len());
        for topic in &self.cfg.job_topics {
            let executor = JobExecutor::new(
                self.cfg.info.id.clone(),
                self.cfg.cluster.clone(),
                topic.clone(),
                self.cfg.jobs.clone(),
                self.job_store.clone(),
                self.pub_store.clone(),
                self.handoff.clone(),
                self.manager.clone(),
                self.shutdown.subscribe(),
            );
            executors.push(tokio::spawn(executor.run()));
        }

        // announce last: come on in
        if let Some(registry) = &self.registry {
            registry.register(&self.cfg.info).await?;
            info!(registry = registry.name(), id = %self.cfg.info.id, "gateway registered");
        } else {
            info!(id = %self.cfg.info.id, "gateway ready, unregistered");
        }

        self.running = Some(Running {
            pub_server,
            sub_server,
            sub_completion,
            committer,
            teardown,
            executors,
        });
        Ok(())
    }

    /// One-shot graceful stop; a second call is a no-op.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        // deregister first so the routing tier stops sending traffic
        if let Some(registry) = &self.registry {
            match registry.deregister(&self.cfg.info.id).await {
                Ok(()) => info!(registry = registry.name(), "deregistered"),
                Err(e) => error!(error = %e, "deregister failed"),
            }
        }

        let _ = self.shutdown.send(true);

        debug!("awaiting pub server stop");
        if let Ok(Err(e)) = running.pub_server.await {
            error!(error = %e, "pub server");
        }

        debug!("awaiting sub server stop");
        let _ = running.sub_completion.await;
        if let Ok(Err(e)) = running.sub_server.await {
            error!(error = %e, "sub server");
        }
        let _ = running.committer.await;

        for executor in running.executors {
            let _ = executor.await;
        }
        // the teardown loop ends with the last conn task; don't wait on
        // stragglers that already blew the drain timeout
        running.teardown.abort();

        self.sub_store.stop().await;
        self.job_store.stop().await;
        self.handoff.stop().await;
        self.pub_store.stop().await;
        self.manager.stop().await;
        self.offset_store.stop().await;

        info!(id = %self.cfg.info.id, "gateway stopped");
    }

    /// Block until a shutdown signal, then stop.
    pub async fn serve_forever(mut self) {
        let signal = shutdown_signal().await;
        info!(%signal, "received signal, shutting down");
        self.stop().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    SigInt,
    SigTerm,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SigInt => write!(f, "SIGINT"),
            Self::SigTerm => write!(f, "SIGTERM"),
        }
    }
}

/// Resolve on the first SIGINT or SIGTERM. SIGHUP is swallowed.
pub async fn shutdown_signal() -> ShutdownSignal {
    #[cfg(unix)]
    {
        let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to install SIGHUP handler");
        tokio::spawn(async move {
            while hup.recv().await.is_some() {
                debug!("SIGHUP ignored");
            }
        });
    }

    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        ShutdownSignal::SigInt
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
        ShutdownSignal::SigTerm
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}
