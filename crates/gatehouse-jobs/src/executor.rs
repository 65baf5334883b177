//! Delayed-Job Executor
//!
//! One executor per (cluster, topic). A poll task wakes every second,
//! selects every job with `due_time <= now`, and feeds a bounded channel; a
//! fixed pool of handlers claims jobs and publishes them into the log.
//!
//! ## Claim / Publish / Archive
//!
//! 1. `DELETE FROM <due> WHERE job_id = ?` - zero affected rows means a
//!    client cancel or a double fetch won the race; the job is skipped
//!    silently.
//! 2. Publish to the broker. If that fails, append to hinted handoff. If
//!    both fail, the job is reinjected into the due table with its original
//!    timestamps - nothing is ever silently lost.
//! 3. On success, insert a history row with `etime = now` and the
//!    executor's actor id, and emit the job on the audit log.
//!
//! ## Ordering
//!
//! The handler pool trades due-time order for throughput: jobs of the same
//! topic may fire out of order across handlers. Deployments that need strict
//! order set `handler_concurrency = 1`.

use crate::error::Result;
use crate::store::{JobItem, JobStore};
use bytes::Bytes;
use gatehouse_hh::Handoff;
use gatehouse_store::{ManagerStore, PubStore};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Get the current time in epoch seconds
fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Due-job poll cadence (default: 1 s)
    pub poll_interval: Duration,

    /// Bounded due-job channel capacity (default: 200)
    pub queue_capacity: usize,

    /// Handler pool size (default: 10).
    ///
    /// Anything above 1 breaks due-time ordering among jobs of the same
    /// topic; set 1 when strict order matters more than throughput.
    pub handler_concurrency: usize,

    /// Poll-to-due lag above this warns (default: 3 s)
    pub lag_warn: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            queue_capacity: 200,
            handler_concurrency: 10,
            lag_warn: Duration::from_secs(3),
        }
    }
}

/// Polls one topic's due table and fires each job into the log
pub struct JobExecutor {
    parent_id: String,
    cluster: String,
    topic: String,
    cfg: ExecutorConfig,
    store: Arc<dyn JobStore>,
    pub_store: Arc<dyn PubStore>,
    handoff: Arc<dyn Handoff>,
    manager: Arc<dyn ManagerStore>,
    shutdown: watch::Receiver<bool>,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_id: impl Into<String>,
        cluster: impl Into<String>,
        topic: impl Into<String>,
        cfg: ExecutorConfig,
        store: Arc<dyn JobStore>,
        pub_store: Arc<dyn PubStore>,
        handoff: Arc<dyn Handoff>,
        manager: Arc<dyn ManagerStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            parent_id: parent_id.into(),
            cluster: cluster.into(),
            topic: topic.into(),
            cfg,
            store,
            pub_store,
            handoff,
            manager,
            shutdown,
        }
    }

    /// Poll the due table and dispatch jobs until shutdown.
    pub async fn run(mut self) {
        let Some(appid) = self.manager.topic_appid(&self.topic).await else {
            warn!(topic = %self.topic, "invalid topic, executor exiting");
            return;
        };
        if let Err(e) = self.store.setup_topic(&self.topic).await {
            error!(topic = %self.topic, error = %e, "preparing job tables");
            return;
        }
        info!(topic = %self.topic, appid = %appid, workers = self.cfg.handler_concurrency, "job executor starting");

        let (due_tx, due_rx) = mpsc::channel::<JobItem>(self.cfg.queue_capacity);
        let due_rx = Arc::new(Mutex::new(due_rx));

        let mut handlers = Vec::with_capacity(self.cfg.handler_concurrency);
        for worker in 0..self.cfg.handler_concurrency {
            let ctx = HandlerCtx {
                parent_id: self.parent_id.clone(),
                cluster: self.cluster.clone(),
                topic: self.topic.clone(),
                store: self.store.clone(),
                pub_store: self.pub_store.clone(),
                handoff: self.handoff.clone(),
            };
            let rx = due_rx.clone();
            handlers.push(tokio::spawn(async move {
                handle_due_jobs(worker, ctx, rx).await;
            }));
        }

        let mut tick = tokio::time::interval(self.cfg.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let lag_warn = self.cfg.lag_warn.as_secs() as i64;

        'poll: loop {
            tokio::select! {
                _ = self.shutdown.changed() => break 'poll,
                _ = tick.tick() => {
                    let now = now_secs();
                    let due = match self.store.fetch_due(&self.topic, now).await {
                        Ok(due) => due,
                        Err(e) => {
                            error!(topic = %self.topic, error = %e, "polling due jobs");
                            continue;
                        }
                    };

                    for item in due {
                        let lag = now - item.due_time;
                        if lag > lag_warn {
                            warn!(topic = %self.topic, job_id = item.job_id, lag, "late job");
                        }
                        debug!(topic = %self.topic, job_id = item.job_id, "due");
                        if due_tx.send(item).await.is_err() {
                            break 'poll;
                        }
                    }
                }
            }
        }

        // closing the channel lets handlers finish what they hold and exit
        drop(due_tx);
        for handler in handlers {
            let _ = handler.await;
        }
        info!(topic = %self.topic, "job executor stopped");
    }
}

struct HandlerCtx {
    parent_id: String,
    cluster: String,
    topic: String,
    store: Arc<dyn JobStore>,
    pub_store: Arc<dyn PubStore>,
    handoff: Arc<dyn Handoff>,
}

async fn handle_due_jobs(worker: usize, ctx: HandlerCtx, rx: Arc<Mutex<mpsc::Receiver<JobItem>>>) {
    loop {
        let item = rx.lock().await.recv().await;
        let Some(item) = item else {
            debug!(topic = %ctx.topic, worker, "handler done");
            return;
        };
        fire_job(&ctx, item).await;
    }
}

/// Claim, publish (with handoff fallback), archive.
async fn fire_job(ctx: &HandlerCtx, item: JobItem) {
    match ctx.store.delete(&ctx.topic, item.job_id).await {
        Ok(0) => {
            // lost the claim: a client cancel or a double fetch within a tick
            return;
        }
        Ok(_) => {}
        Err(e) => {
            error!(topic = %ctx.topic, job_id = item.job_id, error = %e, "claiming job");
            return;
        }
    }

    let payload = Bytes::from(item.payload.clone());
    let mut delivery = ctx
        .pub_store
        .sync_pub(&ctx.cluster, &ctx.topic, None, payload.clone())
        .await
        .map(|_| ());

    if let Err(e) = &delivery {
        debug!(topic = %ctx.topic, job_id = item.job_id, error = %e, "publish failed, trying handoff");
        delivery = ctx
            .handoff
            .append(&ctx.cluster, &ctx.topic, Bytes::new(), payload)
            .await
            .map_err(|e| gatehouse_store::StoreError::Internal(e.to_string()));
    }

    if let Err(e) = delivery {
        // both paths failed: the job goes back with its original timestamps
        error!(topic = %ctx.topic, job_id = item.job_id, error = %e, "delivery failed, reinjecting");
        if let Err(e) = ctx.store.reinject(&ctx.topic, &item).await {
            error!(topic = %ctx.topic, job_id = item.job_id, error = %e, "reinjecting job");
        }
        return;
    }

    info!(target: "audit", topic = %ctx.topic, job_id = item.job_id, "job fired");

    if let Err(e) = ctx
        .store
        .archive(&ctx.topic, &item, now_secs(), &ctx.parent_id)
        .await
    {
        error!(topic = %ctx.topic, job_id = item.job_id, error = %e, "archiving job");
    } else {
        debug!(topic = %ctx.topic, job_id = item.job_id, "archived");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteJobStore;
    use gatehouse_hh::DummyHandoff;
    use gatehouse_store::{DummyPubStore, MemoryBroker};

    fn item(job_id: i64, payload: &[u8]) -> JobItem {
        JobItem {
            job_id,
            payload: payload.to_vec(),
            ctime: 100,
            due_time: 200,
        }
    }

    async fn test_ctx() -> (HandlerCtx, Arc<SqliteJobStore>, Arc<MemoryBroker>) {
        let store = Arc::new(SqliteJobStore::new_in_memory().await.unwrap());
        store.setup_topic("t1").await.unwrap();
        let broker = MemoryBroker::new();
        let ctx = HandlerCtx {
            parent_id: "exec-1".into(),
            cluster: "c1".into(),
            topic: "t1".into(),
            store: store.clone(),
            pub_store: Arc::new(DummyPubStore::new(broker.clone())),
            handoff: Arc::new(DummyHandoff),
        };
        (ctx, store, broker)
    }

    #[tokio::test]
    async fn test_fire_job_publishes_and_archives() {
        let (ctx, store, broker) = test_ctx().await;
        let job = item(1, b"payload");
        store.add("t1", &job).await.unwrap();

        fire_job(&ctx, job.clone()).await;

        assert_eq!(broker.published("c1", "t1").await, vec![Bytes::from("payload")]);
        assert_eq!(store.archived("t1").await.unwrap(), vec![job]);
        assert!(store.fetch_due("t1", i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_claim_does_not_publish() {
        let (ctx, store, broker) = test_ctx().await;

        // job was never inserted (or a cancel already removed it)
        fire_job(&ctx, item(7, b"ghost")).await;

        assert!(broker.published("c1", "t1").await.is_empty());
        assert!(store.archived("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_total_failure_reinjects_with_original_timestamps() {
        let (ctx, store, broker) = test_ctx().await;
        let job = item(7, b"boom");
        store.add("t1", &job).await.unwrap();

        // broker down and DummyHandoff refuses appends: both paths fail
        broker.set_down(true);
        fire_job(&ctx, job.clone()).await;

        let due = store.fetch_due("t1", 200).await.unwrap();
        assert_eq!(due, vec![job], "job back in the due table unchanged");
        assert!(store.archived("t1").await.unwrap().is_empty(), "no history row");
        assert!(broker.published("c1", "t1").await.is_empty());
    }

    #[tokio::test]
    async fn test_broker_failure_lands_in_handoff() {
        let (mut ctx, store, broker) = test_ctx().await;
        let dir = tempfile::TempDir::new().unwrap();
        let delivery: gatehouse_hh::DeliveryFn = Arc::new(|_ct, _b| Box::pin(async { Ok(()) }));
        let handoff = Arc::new(
            gatehouse_hh::DiskHandoff::new(
                gatehouse_hh::HandoffConfig {
                    dirs: vec![dir.path().to_path_buf()],
                    ..Default::default()
                },
                delivery,
            )
            .unwrap(),
        );
        handoff.start().await.unwrap();
        ctx.handoff = handoff.clone();

        let job = item(3, b"detour");
        store.add("t1", &job).await.unwrap();
        broker.set_down(true);

        fire_job(&ctx, job.clone()).await;

        // handoff accepted the block, so the job counts as fired
        assert_eq!(store.archived("t1").await.unwrap(), vec![job]);
        assert!(store.fetch_due("t1", i64::MAX).await.unwrap().is_empty());
        handoff.stop().await;
    }
}
