//! Ack Committer
//!
//! Aggregates client offset acknowledgements in memory and commits them to
//! the coordination store in batches. The committer task exclusively owns
//! the four-level `cluster -> topic -> group -> partition -> offset` map;
//! every other task talks to it through the bounded ack channel, so the
//! nested structure is never mutated concurrently.
//!
//! ## Flush Cadence
//!
//! A full flush runs every 4000 ack batches and on a 30 s ticker. Only the
//! latest observed offset per slot is committed; the sentinel `-1` marks a
//! slot already committed (or abandoned) and is skipped.
//!
//! ## Partial Failure
//!
//! - commit succeeds: the slot is set to -1
//! - coordination store reports the node missing: the commit is invalid,
//!   the slot is abandoned at -1 and never retried
//! - any other error: the slot keeps its offset and retries next flush
//!
//! ## Shutdown
//!
//! Every ack-producing handler owns a clone of the channel sender. When the
//! server stops accepting requests and the handlers finish, the senders drop,
//! the channel yields `None`, and the committer runs one final flush before
//! exiting. Nothing can send after close because nothing can outlive its
//! sender.

use gatehouse_store::{OffsetError, OffsetStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Ack channel capacity, in batches.
pub const ACK_CHANNEL_CAPACITY: usize = 100;

const FLUSH_PER_N: u64 = 4000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Offset sentinel for "slot empty / already committed".
const SLOT_EMPTY: i64 = -1;

/// One acknowledged offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOffset {
    pub cluster: String,
    pub topic: String,
    pub group: String,
    pub partition: i32,
    pub offset: i64,
}

/// Acks arrive batched per request.
pub type AckBatch = Vec<AckOffset>;

type OffsetMap = HashMap<String, HashMap<String, HashMap<String, HashMap<i32, i64>>>>;

pub struct AckCommitter {
    offsets: OffsetMap,
    rx: mpsc::Receiver<AckBatch>,
    store: Arc<dyn OffsetStore>,
    flush_interval: Duration,
    flush_per_n: u64,
}

impl AckCommitter {
    pub fn new(store: Arc<dyn OffsetStore>, rx: mpsc::Receiver<AckBatch>) -> Self {
        Self {
            offsets: OffsetMap::new(),
            rx,
            store,
            flush_interval: FLUSH_INTERVAL,
            flush_per_n: FLUSH_PER_N,
        }
    }

    /// Override the flush cadence; tests tighten both knobs.
    pub fn with_cadence(mut self, flush_interval: Duration, flush_per_n: u64) -> Self {
        self.flush_interval = flush_interval;
        self.flush_per_n = flush_per_n;
        self
    }

    /// Consume acks until every sender is gone, then flush once and exit.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut batches: u64 = 0;
        loop {
            tokio::select! {
                batch = self.rx.recv() => match batch {
                    Some(batch) => {
                        self.apply(batch);
                        batches += 1;
                        if batches % self.flush_per_n == 0 {
                            self.flush().await;
                        }
                    }
                    None => {
                        // all producers exited; drain is complete
                        self.flush().await;
                        debug!("ack committer done");
                        return;
                    }
                },
                _ = tick.tick() => self.flush().await,
            }
        }
    }

    fn apply(&mut self, batch: AckBatch) {
        for ack in batch {
            let slot = self
                .offsets
                .entry(ack.cluster)
                .or_default()
                .entry(ack.topic)
                .or_default()
                .entry(ack.group)
                .or_default()
                .entry(ack.partition)
                .or_insert(SLOT_EMPTY);
            *slot = ack.offset;
        }
    }

    async fn flush(&mut self) {
        for (cluster, topics) in &mut self.offsets {
            for (topic, groups) in topics {
                for (group, partitions) in groups {
                    for (partition, offset) in partitions {
                        if *offset == SLOT_EMPTY {
                            continue;
                        }

                        debug!(%cluster, %group, %topic, partition = *partition, offset = *offset, "commit offset");
                        match self
                            .store
                            .reset_consumer_group_offset(
                                cluster,
                                topic,
                                group,
                                &partition.to_string(),
                                *offset,
                            )
                            .await
                        {
                            Ok(()) => *offset = SLOT_EMPTY,
                            Err(OffsetError::NodeMissing) => {
                                // invalid commit request, will not retry
                                warn!(%cluster, %group, %topic, partition = *partition, offset = *offset,
                                    "offset node missing, abandoning commit");
                                *offset = SLOT_EMPTY;
                            }
                            Err(e) => {
                                error!(%cluster, %group, %topic, partition = *partition, offset = *offset,
                                    error = %e, "offset commit failed, will retry");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gatehouse_store::{Lifecycle, StoreError};
    use std::sync::Mutex;

    /// Offset store recording every commit; optionally failing.
    #[derive(Default)]
    struct RecordingOffsetStore {
        commits: Mutex<Vec<(String, String, String, String, i64)>>,
        fail_with: Mutex<Option<&'static str>>, // "missing" | "backend"
    }

    impl RecordingOffsetStore {
        fn commits(&self) -> Vec<(String, String, String, String, i64)> {
            self.commits.lock().unwrap().clone()
        }

        fn fail_with(&self, mode: Option<&'static str>) {
            *self.fail_with.lock().unwrap() = mode;
        }
    }

    #[async_trait]
    impl Lifecycle for RecordingOffsetStore {
        fn name(&self) -> &'static str {
            "recording"
        }
        async fn start(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn stop(&self) {}
    }

    #[async_trait]
    impl OffsetStore for RecordingOffsetStore {
        async fn reset_consumer_group_offset(
            &self,
            cluster: &str,
            topic: &str,
            group: &str,
            partition: &str,
            offset: i64,
        ) -> Result<(), OffsetError> {
            match *self.fail_with.lock().unwrap() {
                Some("missing") => Err(OffsetError::NodeMissing),
                Some(_) => Err(OffsetError::Backend("zk flake".into())),
                None => {
                    self.commits.lock().unwrap().push((
                        cluster.to_string(),
                        topic.to_string(),
                        group.to_string(),
                        partition.to_string(),
                        offset,
                    ));
                    Ok(())
                }
            }
        }
    }

    fn ack(group: &str, partition: i32, offset: i64) -> AckOffset {
        AckOffset {
            cluster: "c1".into(),
            topic: "t1".into(),
            group: group.into(),
            partition,
            offset,
        }
    }

    #[tokio::test]
    async fn test_latest_offset_wins_and_flushes_once() {
        let store = Arc::new(RecordingOffsetStore::default());
        let (_tx, rx) = mpsc::channel(4);
        let mut committer = AckCommitter::new(store.clone(), rx);

        committer.apply(vec![ack("g", 0, 5), ack("g", 0, 9)]);
        committer.apply(vec![ack("g", 1, 2)]);
        committer.flush().await;

        let mut commits = store.commits();
        commits.sort();
        assert_eq!(
            commits,
            vec![
                ("c1".into(), "t1".into(), "g".into(), "0".into(), 9),
                ("c1".into(), "t1".into(), "g".into(), "1".into(), 2),
            ]
        );

        // slots are now sentinels; a second flush commits nothing
        committer.flush().await;
        assert_eq!(store.commits().len(), 2);
    }

    #[tokio::test]
    async fn test_node_missing_abandons_slot() {
        let store = Arc::new(RecordingOffsetStore::default());
        let (_tx, rx) = mpsc::channel(4);
        let mut committer = AckCommitter::new(store.clone(), rx);

        committer.apply(vec![ack("g", 3, 42)]);
        store.fail_with(Some("missing"));
        committer.flush().await;

        // slot abandoned: even with the store healthy again, nothing retries
        store.fail_with(None);
        committer.flush().await;
        assert!(store.commits().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_retries_next_flush() {
        let store = Arc::new(RecordingOffsetStore::default());
        let (_tx, rx) = mpsc::channel(4);
        let mut committer = AckCommitter::new(store.clone(), rx);

        committer.apply(vec![ack("g", 0, 7)]);
        store.fail_with(Some("backend"));
        committer.flush().await;
        assert!(store.commits().is_empty());

        store.fail_with(None);
        committer.flush().await;
        assert_eq!(store.commits().len(), 1, "slot retained and retried");
    }

    #[tokio::test]
    async fn test_run_drains_and_flushes_on_sender_drop() {
        let store = Arc::new(RecordingOffsetStore::default());
        let (tx, rx) = mpsc::channel(4);
        let committer =
            AckCommitter::new(store.clone(), rx).with_cadence(Duration::from_secs(3600), 1_000);
        let task = tokio::spawn(committer.run());

        tx.send(vec![ack("g", 0, 1)]).await.unwrap();
        tx.send(vec![ack("g", 0, 4)]).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("committer exits once senders drop")
            .unwrap();
        assert_eq!(store.commits(), vec![("c1".into(), "t1".into(), "g".into(), "0".into(), 4)]);
    }
}
