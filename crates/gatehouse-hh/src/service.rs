//! Hinted-Handoff Service
//!
//! The registry of queues across the configured data directories. The
//! service exclusively owns every queue; callers address them by
//! (cluster, topic) and never touch segments or cursors directly.
//!
//! ## On-Disk Layout
//!
//! ```text
//! <datadir>/
//! ├── cluster1
//! └── cluster2
//!     ├── topic1
//!     └── topic2
//!         ├── 0000000001
//!         ├── 0000000002
//!         └── cursor.dmp
//! ```
//!
//! ## Thread Safety
//!
//! The queue map sits behind an `RwLock`: appends take the read lock on the
//! fast path and upgrade with a double-check only when a queue has to be
//! created, the same shape as a topic-writer cache. Queue creation is rare;
//! everything else is read-mostly.
//!
//! ## Variants
//!
//! `DiskHandoff` is the durable implementation. `DummyHandoff` rejects every
//! append so publish failures surface straight to the caller; it exists so
//! the gateway can run without local buffering when configured to.

use crate::config::HandoffConfig;
use crate::error::{HandoffError, Result};
use crate::queue::{DeliveryFn, Queue};
use async_trait::async_trait;
use bytes::Bytes;
use gatehouse_core::{Block, ClusterTopic};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

/// The hinted-handoff capability the gateway and job executor program
/// against.
#[async_trait]
pub trait Handoff: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    /// Buffer one publish for later replay.
    async fn append(&self, cluster: &str, topic: &str, key: Bytes, value: Bytes) -> Result<()>;

    /// True when the queue for the pair has drained (or never existed).
    async fn empty(&self, cluster: &str, topic: &str) -> bool;

    /// Total blocks not yet past their cursors, summed across queues.
    async fn inflights(&self) -> i64;

    /// Replay every buffered block synchronously. Only valid while the
    /// service is stopped; the offline drain entrypoint uses this.
    async fn flush_inflights(&self) -> Result<()>;
}

/// Durable, disk-backed hinted handoff
pub struct DiskHandoff {
    cfg: HandoffConfig,
    delivery: DeliveryFn,
    closed: AtomicBool,
    queues: RwLock<HashMap<ClusterTopic, Arc<Queue>>>,
    next_dir: AtomicUsize,
}

impl DiskHandoff {
    pub fn new(cfg: HandoffConfig, delivery: DeliveryFn) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            delivery,
            closed: AtomicBool::new(true),
            queues: RwLock::new(HashMap::new()),
            next_dir: AtomicUsize::new(0),
        })
    }

    /// Round-robin across the configured data dirs.
    fn pick_dir(&self) -> &Path {
        let n = self.next_dir.fetch_add(1, Ordering::Relaxed);
        &self.cfg.dirs[n % self.cfg.dirs.len()]
    }

    /// Discover queues already on disk under `dir`.
    async fn load_queues(&self, dir: &Path, start: bool) -> Result<()> {
        let mut clusters = tokio::fs::read_dir(dir).await?;
        while let Some(cluster) = clusters.next_entry().await? {
            if !cluster.file_type().await?.is_dir() {
                continue;
            }
            let cluster_name = cluster.file_name().to_string_lossy().into_owned();

            let mut topics = tokio::fs::read_dir(cluster.path()).await?;
            while let Some(topic) = topics.next_entry().await? {
                if !topic.file_type().await?.is_dir() {
                    continue;
                }
                let ct = ClusterTopic::new(
                    cluster_name.clone(),
                    topic.file_name().to_string_lossy().into_owned(),
                );

                let mut queues = self.queues.write().await;
                if queues.contains_key(&ct) {
                    warn!(queue = %ct, dir = %dir.display(), "duplicate queue directory, first one wins");
                    continue;
                }
                let queue = self.open_queue(ct.clone(), topic.path(), start).await?;
                queues.insert(ct, queue);
            }
        }
        Ok(())
    }

    async fn open_queue(
        &self,
        ct: ClusterTopic,
        dir: PathBuf,
        start: bool,
    ) -> Result<Arc<Queue>> {
        let queue = Arc::new(Queue::new(
            ct,
            dir,
            self.cfg.clone(),
            self.delivery.clone(),
        ));
        queue.open().await?;
        if start {
            queue.start()?;
        }
        Ok(queue)
    }
}

#[async_trait]
impl Handoff for DiskHandoff {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn start(&self) -> Result<()> {
        if !self.closed.load(Ordering::SeqCst) {
            return Err(HandoffError::StillRunning);
        }

        for dir in self.cfg.dirs.clone() {
            tokio::fs::create_dir_all(&dir).await?;
            self.load_queues(&dir, true).await?;
        }

        self.closed.store(false, Ordering::SeqCst);
        info!(dirs = self.cfg.dirs.len(), "hinted handoff started");
        Ok(())
    }

    async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return; // second stop is a no-op
        }

        let queues: Vec<_> = self.queues.write().await.drain().collect();
        for (_, queue) in queues {
            queue.close().await;
        }
        info!("hinted handoff stopped");
    }

    async fn append(&self, cluster: &str, topic: &str, key: Bytes, value: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HandoffError::NotOpen);
        }

        let block = Block::new(key, value)?;
        let ct = ClusterTopic::new(cluster, topic);

        {
            let queues = self.queues.read().await;
            if let Some(queue) = queues.get(&ct) {
                return queue.append(&block).await;
            }
        }

        let mut queues = self.queues.write().await;
        // double-check: someone may have created it while we upgraded
        if let Some(queue) = queues.get(&ct) {
            return queue.append(&block).await;
        }

        let dir = self.pick_dir().join(&ct.cluster).join(&ct.topic);
        let queue = self.open_queue(ct.clone(), dir, true).await?;
        queues.insert(ct, queue.clone());
        queue.append(&block).await
    }

    async fn empty(&self, cluster: &str, topic: &str) -> bool {
        let ct = ClusterTopic::new(cluster, topic);
        let queues = self.queues.read().await;
        queues.get(&ct).map(|q| q.empty_inflight()).unwrap_or(true)
    }

    async fn inflights(&self) -> i64 {
        let queues = self.queues.read().await;
        queues.values().map(|q| q.inflights()).sum()
    }

    async fn flush_inflights(&self) -> Result<()> {
        if !self.closed.load(Ordering::SeqCst) {
            error!("flush inflights invoked against a running service");
            return Err(HandoffError::StillRunning);
        }

        for dir in self.cfg.dirs.clone() {
            if let Err(e) = self.load_queues(&dir, false).await {
                error!(dir = %dir.display(), error = %e, "loading queues for flush");
                return Err(e);
            }
        }

        let (err_tx, mut err_rx) = mpsc::channel::<HandoffError>(64);
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();

        let mut flushes = Vec::with_capacity(queues.len());
        for queue in &queues {
            let queue = queue.clone();
            let err_tx = err_tx.clone();
            flushes.push(tokio::spawn(async move {
                queue.flush_inflights(err_tx).await;
            }));
        }
        drop(err_tx);

        let reporter = tokio::spawn(async move {
            let mut n = 0u64;
            while let Some(e) = err_rx.recv().await {
                error!(error = %e, "flush inflights");
                n += 1;
            }
            n
        });

        for flush in flushes {
            let _ = flush.await;
        }
        let failures = reporter.await.unwrap_or(0);

        let queues: Vec<_> = self.queues.write().await.drain().collect();
        for (_, queue) in queues {
            queue.close().await;
        }

        info!(failures, "flush inflights done");
        Ok(())
    }
}

/// No-durability variant: every append is refused so publish failures
/// surface straight to the caller.
pub struct DummyHandoff;

#[async_trait]
impl Handoff for DummyHandoff {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn append(&self, _cluster: &str, _topic: &str, _key: Bytes, _value: Bytes) -> Result<()> {
        Err(HandoffError::NotOpen)
    }

    async fn empty(&self, _cluster: &str, _topic: &str) -> bool {
        true
    }

    async fn inflights(&self) -> i64 {
        0
    }

    async fn flush_inflights(&self) -> Result<()> {
        Ok(())
    }
}
