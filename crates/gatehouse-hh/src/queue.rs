//! Queue
//!
//! One segmented, append-only log per (cluster, topic). The queue owns its
//! segments and cursor outright: a single writer appends to the tail segment
//! (rolling when full), a single reader replays blocks in arrival order
//! through an injected delivery callback, and a periodic purge task removes
//! segments the reader has fully left behind.
//!
//! ## Replay
//!
//! The drain loop reads the block under the cursor and hands it to the
//! delivery callback (typically the broker publish). On success the cursor
//! advances; on `BrokerDown` the reader parks on the block and retries with
//! exponential back-off forever; on `Rejected` it retries a bounded number of
//! times, then skips the block and records it to the audit log. At true
//! end-of-log the reader sleeps briefly and re-checks.
//!
//! ## Durability
//!
//! Appends hit the file descriptor immediately; segments are fsynced on roll
//! and on close. The cursor is persisted every `dump_per_blocks` successful
//! replays and on clean shutdown, so a crash re-delivers at most one cursor
//! window of blocks - duplicates, never loss.
//!
//! ## State Machine
//!
//! ```text
//! Created -> Opened -> Running -> Draining -> Closed
//!              \________________________________/
//!               (open without start: offline flush)
//! ```

use crate::config::HandoffConfig;
use crate::cursor::Cursor;
use crate::error::{DeliveryError, HandoffError, Result};
use crate::segment::{parse_segment_file_name, segment_file_name, segment_mtime, Segment, SegmentReader};
use gatehouse_core::{Block, ClusterTopic};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Future returned by a delivery callback.
pub type DeliveryFuture =
    Pin<Box<dyn Future<Output = std::result::Result<(), DeliveryError>> + Send>>;

/// Injected delivery callback, typically a broker publish.
pub type DeliveryFn = Arc<dyn Fn(ClusterTopic, Block) -> DeliveryFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Created,
    Opened,
    Running,
    Draining,
    Closed,
}

pub struct Queue {
    ct: ClusterTopic,
    dir: PathBuf,
    cfg: HandoffConfig,
    delivery: DeliveryFn,

    state: StdMutex<QueueState>,
    inflights: Arc<AtomicI64>,
    // lowest segment the reader may still need; purge never crosses it
    reader_segment: Arc<AtomicU64>,
    segments: Arc<StdMutex<BTreeSet<u64>>>,

    // tail segment, None once closed
    writer: Mutex<Option<Segment>>,
    // replay state, taken by start() or flush_inflights()
    replayer: StdMutex<Option<Replayer>>,

    shutdown: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Queue {
    pub fn new(ct: ClusterTopic, dir: PathBuf, cfg: HandoffConfig, delivery: DeliveryFn) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ct,
            dir,
            cfg,
            delivery,
            state: StdMutex::new(QueueState::Created),
            inflights: Arc::new(AtomicI64::new(0)),
            reader_segment: Arc::new(AtomicU64::new(0)),
            segments: Arc::new(StdMutex::new(BTreeSet::new())),
            writer: Mutex::new(None),
            replayer: StdMutex::new(None),
            shutdown,
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock().expect("queue state lock")
    }

    /// Load segments and cursor from disk. Leaves the queue in `Opened`;
    /// `start` spawns the drain and purge tasks.
    pub async fn open(&self) -> Result<()> {
        {
            let st = self.state.lock().expect("queue state lock");
            if *st != QueueState::Created {
                return Err(HandoffError::NotOpen);
            }
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        let mut ids = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(parse_segment_file_name)
            {
                ids.insert(id);
            }
        }

        let tail = match ids.last().copied() {
            Some(max_id) => Segment::open(&self.dir, max_id, self.cfg.max_segment_bytes).await?,
            None => {
                ids.insert(1);
                Segment::create(&self.dir, 1, self.cfg.max_segment_bytes).await?
            }
        };
        let oldest = *ids.first().expect("at least one segment");
        let (tail_id, tail_size) = (tail.id(), tail.size());

        let mut cursor = Cursor::open(&self.dir, oldest).await?;
        if cursor.segment_id() > tail_id
            || (cursor.segment_id() == tail_id && cursor.offset() > tail_size)
        {
            // the tail lost a torn suffix below a persisted dump
            warn!(queue = %self.ct, segment = cursor.segment_id(), offset = cursor.offset(),
                tail_id, tail_size, "cursor beyond tail, resetting to end of log");
            cursor.reset(tail_id, tail_size);
        }
        self.reader_segment
            .store(cursor.segment_id(), Ordering::Relaxed);
        *self.segments.lock().expect("segments lock") = ids.clone();

        let remaining = count_remaining(&self.dir, &ids, &cursor).await;
        self.inflights.store(remaining, Ordering::Relaxed);

        *self.writer.lock().await = Some(tail);
        *self.replayer.lock().expect("replayer lock") = Some(Replayer {
            ct: self.ct.clone(),
            dir: self.dir.clone(),
            cfg: self.cfg.clone(),
            cursor,
            reader: None,
            segments: self.segments.clone(),
            inflights: self.inflights.clone(),
            reader_segment: self.reader_segment.clone(),
            pending: None,
            since_dump: 0,
            corrupt_logged: false,
        });

        *self.state.lock().expect("queue state lock") = QueueState::Opened;
        info!(queue = %self.ct, inflights = remaining, "queue opened");
        Ok(())
    }

    /// Spawn the drain and purge tasks.
    pub fn start(&self) -> Result<()> {
        let mut st = self.state.lock().expect("queue state lock");
        if *st != QueueState::Opened {
            return Err(HandoffError::NotOpen);
        }

        let replayer = self
            .replayer
            .lock()
            .expect("replayer lock")
            .take()
            .ok_or(HandoffError::NotOpen)?;

        let drain = tokio::spawn(drain_loop(
            replayer,
            self.delivery.clone(),
            self.cfg.clone(),
            self.shutdown.subscribe(),
        ));
        let purge = tokio::spawn(purge_loop(
            self.ct.clone(),
            self.dir.clone(),
            self.cfg.clone(),
            self.segments.clone(),
            self.reader_segment.clone(),
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().expect("tasks lock").extend([drain, purge]);

        *st = QueueState::Running;
        Ok(())
    }

    /// Append one block to the tail segment, rolling when full.
    ///
    /// Serialization happens inside the queue: concurrent callers contend on
    /// the writer lock, never on the file.
    pub async fn append(&self, block: &Block) -> Result<()> {
        match self.state() {
            QueueState::Opened | QueueState::Running => {}
            _ => return Err(HandoffError::NotOpen),
        }

        let mut guard = self.writer.lock().await;
        let tail = guard.as_mut().ok_or(HandoffError::NotOpen)?;

        match tail.append(block).await {
            Ok(_) => {}
            Err(HandoffError::SegmentFull) => {
                tail.sync().await?;
                let id = tail.id() + 1;
                let mut fresh = Segment::create(&self.dir, id, self.cfg.max_segment_bytes).await?;
                fresh.append(block).await?;
                self.segments.lock().expect("segments lock").insert(id);
                debug!(queue = %self.ct, segment = id, "rolled segment");
                *tail = fresh;
            }
            Err(e) => return Err(e),
        }

        self.inflights.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Blocks appended but not yet past the cursor. An observability
    /// statistic, not a synchronization primitive.
    pub fn inflights(&self) -> i64 {
        self.inflights.load(Ordering::Relaxed)
    }

    pub fn empty_inflight(&self) -> bool {
        self.inflights() <= 0
    }

    /// Replay every remaining block synchronously, reporting failures on
    /// `errs`. Only valid on an `Opened` (never started) queue; the offline
    /// drain entrypoint uses this.
    pub async fn flush_inflights(&self, errs: mpsc::Sender<HandoffError>) {
        if self.state() != QueueState::Opened {
            let _ = errs.send(HandoffError::StillRunning).await;
            return;
        }
        let Some(mut rep) = self.replayer.lock().expect("replayer lock").take() else {
            let _ = errs.send(HandoffError::NotOpen).await;
            return;
        };

        loop {
            match rep.next_block().await {
                Ok(Some(block)) => match (self.delivery)(self.ct.clone(), block).await {
                    Ok(()) => {
                        if let Err(e) = rep.mark_delivered().await {
                            let _ = errs.send(e).await;
                            break;
                        }
                    }
                    Err(e) => {
                        // leave the block for the next flush attempt
                        let _ = errs.send(e.into()).await;
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    let _ = errs.send(e).await;
                    break;
                }
            }
        }

        if let Err(e) = rep.cursor.persist().await {
            let _ = errs.send(e).await;
        }
        *self.replayer.lock().expect("replayer lock") = Some(rep);
    }

    /// Stop tasks, persist the cursor, fsync the tail.
    pub async fn close(&self) {
        {
            let mut st = self.state.lock().expect("queue state lock");
            match *st {
                QueueState::Closed | QueueState::Created => {
                    *st = QueueState::Closed;
                    return;
                }
                _ => *st = QueueState::Draining,
            }
        }

        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("tasks lock")
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }

        // a queue that was opened but never started still owns its replayer
        let idle = self.replayer.lock().expect("replayer lock").take();
        if let Some(rep) = idle {
            if let Err(e) = rep.cursor.persist().await {
                error!(queue = %self.ct, error = %e, "persisting cursor on close");
            }
        }

        if let Some(tail) = self.writer.lock().await.as_mut() {
            if let Err(e) = tail.sync().await {
                error!(queue = %self.ct, error = %e, "syncing tail segment on close");
            }
        }
        *self.writer.lock().await = None;

        *self.state.lock().expect("queue state lock") = QueueState::Closed;
        info!(queue = %self.ct, "queue closed");
    }
}

/// Replay state: cursor, current reader, and the block being retried
struct Replayer {
    ct: ClusterTopic,
    dir: PathBuf,
    cfg: HandoffConfig,
    cursor: Cursor,
    reader: Option<SegmentReader>,
    segments: Arc<StdMutex<BTreeSet<u64>>>,
    inflights: Arc<AtomicI64>,
    reader_segment: Arc<AtomicU64>,
    pending: Option<(u64, u64, Block)>,
    since_dump: u64,
    corrupt_logged: bool,
}

impl Replayer {
    /// Block under the cursor, or None at true end-of-log.
    ///
    /// The same block is returned until `mark_delivered` or `mark_skipped`
    /// clears it, so a failed delivery retries in place.
    async fn next_block(&mut self) -> Result<Option<Block>> {
        if let Some((_, _, block)) = &self.pending {
            return Ok(Some(block.clone()));
        }

        loop {
            if self.reader.is_none() {
                let mut reader = SegmentReader::open(&self.dir, self.cursor.segment_id()).await?;
                reader.seek(self.cursor.offset()).await?;
                self.reader = Some(reader);
            }
            let reader = self.reader.as_mut().expect("reader just ensured");

            match reader.next().await {
                Ok(Some(block)) => {
                    self.corrupt_logged = false;
                    self.pending = Some((reader.segment_id(), reader.position(), block.clone()));
                    return Ok(Some(block));
                }
                Ok(None) => {
                    let current = reader.segment_id();
                    match self.successor_of(current) {
                        Some(next_id) => self.hop_to(next_id).await?,
                        None => return Ok(None),
                    }
                }
                Err(e) => {
                    let current = reader.segment_id();
                    if !self.corrupt_logged {
                        error!(queue = %self.ct, segment = current, error = %e,
                            "corrupt segment, skipping to next boundary");
                        self.corrupt_logged = true;
                    }
                    self.reader = None;
                    match self.successor_of(current) {
                        Some(next_id) => self.hop_to(next_id).await?,
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    fn successor_of(&self, id: u64) -> Option<u64> {
        self.segments
            .lock()
            .expect("segments lock")
            .range(id + 1..)
            .next()
            .copied()
    }

    async fn hop_to(&mut self, next_id: u64) -> Result<()> {
        self.cursor.advance(next_id, 0)?;
        self.cursor.persist().await?;
        self.reader_segment.store(next_id, Ordering::Relaxed);
        self.reader = None;
        Ok(())
    }

    async fn mark_delivered(&mut self) -> Result<()> {
        self.finish_pending().await
    }

    async fn mark_skipped(&mut self) -> Result<()> {
        self.finish_pending().await
    }

    async fn finish_pending(&mut self) -> Result<()> {
        let Some((segment, next_offset, _)) = self.pending.take() else {
            return Ok(());
        };
        self.cursor.advance(segment, next_offset)?;
        self.inflights.fetch_sub(1, Ordering::Relaxed);
        self.since_dump += 1;
        if self.since_dump >= self.cfg.dump_per_blocks {
            self.cursor.persist().await?;
            self.since_dump = 0;
        }
        Ok(())
    }
}

async fn drain_loop(
    mut rep: Replayer,
    delivery: DeliveryFn,
    cfg: HandoffConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let ct = rep.ct.clone();
    let mut backoff = cfg.initial_backoff;
    let mut attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = match rep.next_block().await {
            Ok(next) => next,
            Err(e) => {
                error!(queue = %ct, error = %e, "reading next block");
                if sleep_or_shutdown(&mut shutdown, cfg.poll_eof_sleep).await {
                    break;
                }
                continue;
            }
        };

        let block = match next {
            Some(block) => block,
            None => {
                if sleep_or_shutdown(&mut shutdown, cfg.poll_eof_sleep).await {
                    break;
                }
                continue;
            }
        };

        match (delivery)(ct.clone(), block.clone()).await {
            Ok(()) => {
                attempts = 0;
                backoff = cfg.initial_backoff;
                if let Err(e) = rep.mark_delivered().await {
                    error!(queue = %ct, error = %e, "advancing cursor");
                }
            }
            Err(DeliveryError::BrokerDown(reason)) => {
                // park on the block and retry forever
                debug!(queue = %ct, %reason, backoff = ?backoff, "broker down, parked");
                if sleep_or_shutdown(&mut shutdown, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(cfg.max_backoff);
            }
            Err(DeliveryError::Rejected(reason)) => {
                attempts += 1;
                if attempts >= cfg.max_retries {
                    warn!(target: "audit", queue = %ct, %reason,
                        key_len = block.key.len(), value_len = block.value.len(),
                        attempts, "block skipped after max delivery attempts");
                    if let Err(e) = rep.mark_skipped().await {
                        error!(queue = %ct, error = %e, "advancing cursor past skipped block");
                    }
                    attempts = 0;
                    backoff = cfg.initial_backoff;
                } else {
                    debug!(queue = %ct, %reason, attempts, backoff = ?backoff, "delivery rejected");
                    if sleep_or_shutdown(&mut shutdown, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(cfg.max_backoff);
                }
            }
        }
    }

    if let Err(e) = rep.cursor.persist().await {
        error!(queue = %ct, error = %e, "persisting cursor on drain exit");
    }
    debug!(queue = %ct, "drain loop done");
}

async fn purge_loop(
    ct: ClusterTopic,
    dir: PathBuf,
    cfg: HandoffConfig,
    segments: Arc<StdMutex<BTreeSet<u64>>>,
    reader_segment: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if sleep_or_shutdown(&mut shutdown, cfg.purge_interval).await {
            break;
        }

        // only segments wholly behind the reader are candidates
        let floor = reader_segment.load(Ordering::Relaxed);
        let candidates: Vec<u64> = segments
            .lock()
            .expect("segments lock")
            .range(..floor)
            .copied()
            .collect();

        for id in candidates {
            let path = dir.join(segment_file_name(id));
            let old_enough = match segment_mtime(&path).await {
                Ok(mtime) => mtime
                    .elapsed()
                    .map(|age| age >= cfg.max_age)
                    .unwrap_or(false),
                Err(e) => {
                    warn!(queue = %ct, segment = id, error = %e, "stat for purge");
                    continue;
                }
            };
            if !old_enough {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    segments.lock().expect("segments lock").remove(&id);
                    info!(queue = %ct, segment = id, "purged segment");
                }
                Err(e) => warn!(queue = %ct, segment = id, error = %e, "purging segment"),
            }
        }
    }
}

async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = shutdown.changed() => true,
    }
}

async fn count_remaining(dir: &std::path::Path, ids: &BTreeSet<u64>, cursor: &Cursor) -> i64 {
    let mut n = 0;
    for &id in ids.range(cursor.segment_id()..) {
        let mut reader = match SegmentReader::open(dir, id).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(segment = id, error = %e, "opening segment for inflight count");
                continue;
            }
        };
        if id == cursor.segment_id() {
            if reader.seek(cursor.offset()).await.is_err() {
                continue;
            }
        }
        loop {
            match reader.next().await {
                Ok(Some(_)) => n += 1,
                Ok(None) => break,
                Err(e) => {
                    warn!(segment = id, error = %e, "corrupt segment during inflight count");
                    break;
                }
            }
        }
    }
    n
}
