//! Hinted-handoff integration tests: append/drain round trips, segment
//! roll-over, delivery back-off, crash recovery, retention, and service
//! lifecycle.

use bytes::Bytes;
use gatehouse_core::{Block, ClusterTopic};
use gatehouse_hh::{
    Cursor, DeliveryError, DeliveryFn, DiskHandoff, Handoff, HandoffConfig, HandoffError, Queue,
    QueueState,
};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &Path) -> HandoffConfig {
    HandoffConfig {
        dirs: vec![dir.to_path_buf()],
        max_segment_bytes: 1024,
        purge_interval: Duration::from_secs(3600),
        max_age: Duration::from_secs(3600),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
        max_retries: 3,
        poll_eof_sleep: Duration::from_millis(20),
        dump_per_blocks: 100,
    }
}

fn block(key: &str, value: &str) -> Block {
    Block::new(Bytes::from(key.to_string()), Bytes::from(value.to_string())).unwrap()
}

/// Delivery callback recording every block it accepts.
fn recording_delivery(log: Arc<Mutex<Vec<Block>>>) -> DeliveryFn {
    Arc::new(move |_ct, block| {
        let log = log.clone();
        Box::pin(async move {
            log.lock().unwrap().push(block);
            Ok(())
        })
    })
}

/// Delivery callback failing with `BrokerDown` forever.
fn broker_down_delivery(calls: Arc<AtomicU32>) -> DeliveryFn {
    Arc::new(move |_ct, _block| {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::BrokerDown("connection refused".into()))
        })
    })
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < timeout,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------
// Queue: append / drain
// ---------------------------------------------------------------

#[tokio::test]
async fn test_append_drain_round_trip() {
    let dir = TempDir::new().unwrap();
    let qdir = dir.path().join("c1").join("t1");
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let queue = Queue::new(
        ClusterTopic::new("c1", "t1"),
        qdir.clone(),
        test_config(dir.path()),
        recording_delivery(delivered.clone()),
    );
    queue.open().await.unwrap();
    queue.append(&block("k", "hello")).await.unwrap();
    assert_eq!(queue.inflights(), 1);

    queue.start().unwrap();
    wait_until(Duration::from_secs(5), || delivered.lock().unwrap().len() == 1).await;
    assert_eq!(delivered.lock().unwrap()[0], block("k", "hello"));

    // give the drain loop a moment to confirm EOF, then close
    wait_until(Duration::from_secs(5), || queue.inflights() == 0).await;
    queue.close().await;
    assert_eq!(queue.state(), QueueState::Closed);

    // cursor persisted past the single 16-byte block
    let cursor = Cursor::open(&qdir, 1).await.unwrap();
    assert_eq!(cursor.segment_id(), 1);
    assert_eq!(cursor.offset(), 16);
}

#[tokio::test]
async fn test_roll_over_preserves_order() {
    let dir = TempDir::new().unwrap();
    let qdir = dir.path().join("c1").join("t1");
    let mut cfg = test_config(dir.path());
    cfg.max_segment_bytes = 32;

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let queue = Queue::new(
        ClusterTopic::new("c1", "t1"),
        qdir.clone(),
        cfg,
        recording_delivery(delivered.clone()),
    );
    queue.open().await.unwrap();

    // 15 bytes each: two fit under the 32-byte cap, the third rolls
    let blocks = [block("", "11111"), block("", "22222"), block("", "33333")];
    for b in &blocks {
        queue.append(b).await.unwrap();
    }

    let first = tokio::fs::metadata(qdir.join("0000000001")).await.unwrap();
    let second = tokio::fs::metadata(qdir.join("0000000002")).await.unwrap();
    assert_eq!(first.len(), 30);
    assert_eq!(second.len(), 15);

    queue.start().unwrap();
    wait_until(Duration::from_secs(5), || delivered.lock().unwrap().len() == 3).await;
    assert_eq!(*delivered.lock().unwrap(), blocks.to_vec());
    queue.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_broker_down_backs_off_exponentially() {
    let dir = TempDir::new().unwrap();
    let qdir = dir.path().join("c1").join("t1");
    let mut cfg = test_config(dir.path());
    cfg.initial_backoff = Duration::from_millis(200);
    cfg.max_backoff = Duration::from_secs(31);

    // fail with BrokerDown four times, then accept; record call instants
    let instants: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let delivery: DeliveryFn = {
        let instants = instants.clone();
        let delivered = delivered.clone();
        Arc::new(move |_ct, b| {
            let instants = instants.clone();
            let delivered = delivered.clone();
            Box::pin(async move {
                let mut calls = instants.lock().unwrap();
                calls.push(tokio::time::Instant::now());
                if calls.len() <= 4 {
                    Err(DeliveryError::BrokerDown("no leader".into()))
                } else {
                    delivered.lock().unwrap().push(b);
                    Ok(())
                }
            })
        })
    };

    let queue = Queue::new(ClusterTopic::new("c1", "t1"), qdir, cfg, delivery);
    queue.open().await.unwrap();
    queue.append(&block("k", "hello")).await.unwrap();
    queue.start().unwrap();

    wait_until(Duration::from_secs(120), || {
        delivered.lock().unwrap().len() == 1
    })
    .await;
    queue.close().await;

    let calls = instants.lock().unwrap();
    assert_eq!(calls.len(), 5);
    // parked on the block the whole time: 200 + 400 + 800 + 1600 ms
    let total = calls[4] - calls[0];
    assert!(total >= Duration::from_millis(3000), "total backoff {total:?}");
    assert!(total < Duration::from_millis(3500), "total backoff {total:?}");
    assert_eq!(queue.inflights(), 0);
}

#[tokio::test]
async fn test_rejected_block_skipped_after_max_retries() {
    let dir = TempDir::new().unwrap();
    let qdir = dir.path().join("c1").join("t1");
    let cfg = test_config(dir.path()); // max_retries = 3

    let calls = Arc::new(AtomicU32::new(0));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let delivery: DeliveryFn = {
        let calls = calls.clone();
        let delivered = delivered.clone();
        Arc::new(move |_ct, b| {
            let calls = calls.clone();
            let delivered = delivered.clone();
            Box::pin(async move {
                // first block is poison, second goes through
                if b.value.as_ref() == b"poison" {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DeliveryError::Rejected("schema mismatch".into()))
                } else {
                    delivered.lock().unwrap().push(b);
                    Ok(())
                }
            })
        })
    };

    let queue = Queue::new(ClusterTopic::new("c1", "t1"), qdir, cfg, delivery);
    queue.open().await.unwrap();
    queue.append(&block("", "poison")).await.unwrap();
    queue.append(&block("", "good")).await.unwrap();
    queue.start().unwrap();

    wait_until(Duration::from_secs(5), || delivered.lock().unwrap().len() == 1).await;
    queue.close().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(delivered.lock().unwrap()[0], block("", "good"));
    assert_eq!(queue.inflights(), 0);
}

// ---------------------------------------------------------------
// Queue: durability across restart
// ---------------------------------------------------------------

#[tokio::test]
async fn test_blocks_survive_restart_in_order() {
    let dir = TempDir::new().unwrap();
    let qdir = dir.path().join("c1").join("t1");
    let cfg = test_config(dir.path());
    let ct = ClusterTopic::new("c1", "t1");

    // first incarnation: append and vanish without close (crash)
    {
        let queue = Queue::new(
            ct.clone(),
            qdir.clone(),
            cfg.clone(),
            recording_delivery(Arc::new(Mutex::new(Vec::new()))),
        );
        queue.open().await.unwrap();
        for i in 0..5 {
            queue.append(&block("", &format!("msg-{i}"))).await.unwrap();
        }
    }

    // second incarnation drains everything that was appended
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let queue = Queue::new(ct, qdir, cfg, recording_delivery(delivered.clone()));
    queue.open().await.unwrap();
    assert_eq!(queue.inflights(), 5);

    queue.start().unwrap();
    wait_until(Duration::from_secs(5), || delivered.lock().unwrap().len() == 5).await;
    queue.close().await;

    let got: Vec<_> = delivered
        .lock()
        .unwrap()
        .iter()
        .map(|b| String::from_utf8_lossy(&b.value).into_owned())
        .collect();
    assert_eq!(got, ["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
}

// ---------------------------------------------------------------
// Queue: retention
// ---------------------------------------------------------------

#[tokio::test]
async fn test_purge_removes_only_consumed_segments() {
    let dir = TempDir::new().unwrap();
    let qdir = dir.path().join("c1").join("t1");
    let mut cfg = test_config(dir.path());
    cfg.max_segment_bytes = 32;
    cfg.purge_interval = Duration::from_millis(50);
    cfg.max_age = Duration::ZERO;

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let queue = Queue::new(
        ClusterTopic::new("c1", "t1"),
        qdir.clone(),
        cfg,
        recording_delivery(delivered.clone()),
    );
    queue.open().await.unwrap();
    for i in 0..4 {
        queue.append(&block("", &format!("bbb-{i}"))).await.unwrap();
    }
    assert!(qdir.join("0000000001").exists());
    assert!(qdir.join("0000000002").exists());

    queue.start().unwrap();
    wait_until(Duration::from_secs(5), || delivered.lock().unwrap().len() == 4).await;

    // reader now sits in the tail segment; older ones age out
    wait_until(Duration::from_secs(5), || !qdir.join("0000000001").exists()).await;
    assert!(qdir.join("0000000002").exists(), "tail never purged");
    queue.close().await;
}

#[tokio::test]
async fn test_unconsumed_segment_never_purged() {
    let dir = TempDir::new().unwrap();
    let qdir = dir.path().join("c1").join("t1");
    let mut cfg = test_config(dir.path());
    cfg.purge_interval = Duration::from_millis(20);
    cfg.max_age = Duration::ZERO;

    let calls = Arc::new(AtomicU32::new(0));
    let queue = Queue::new(
        ClusterTopic::new("c1", "t1"),
        qdir.clone(),
        cfg,
        broker_down_delivery(calls.clone()),
    );
    queue.open().await.unwrap();
    queue.append(&block("", "stuck")).await.unwrap();
    queue.start().unwrap();

    wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        qdir.join("0000000001").exists(),
        "partially consumed segment must survive the purge pass"
    );
    queue.close().await;
    assert_eq!(queue.inflights(), 1);
}

// ---------------------------------------------------------------
// Service lifecycle
// ---------------------------------------------------------------

#[tokio::test]
async fn test_append_on_closed_service() {
    let dir = TempDir::new().unwrap();
    let service = DiskHandoff::new(
        test_config(dir.path()),
        recording_delivery(Arc::new(Mutex::new(Vec::new()))),
    )
    .unwrap();

    let err = service
        .append("c1", "t1", Bytes::new(), Bytes::from("v"))
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::NotOpen));
}

#[tokio::test]
async fn test_append_rejects_invalid_blocks() {
    let dir = TempDir::new().unwrap();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let service =
        DiskHandoff::new(test_config(dir.path()), recording_delivery(delivered)).unwrap();
    service.start().await.unwrap();

    let err = service
        .append("c1", "t1", Bytes::new(), Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HandoffError::Block(gatehouse_core::Error::EmptyValue)
    ));

    let huge = Bytes::from(vec![0u8; gatehouse_core::MAX_BLOCK_SIZE + 1]);
    let err = service.append("c1", "t1", Bytes::new(), huge).await.unwrap_err();
    assert!(matches!(
        err,
        HandoffError::Block(gatehouse_core::Error::BlockTooLarge { .. })
    ));

    service.stop().await;
}

#[tokio::test]
async fn test_service_creates_queues_on_demand() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let service =
        DiskHandoff::new(test_config(dir.path()), broker_down_delivery(calls)).unwrap();
    service.start().await.unwrap();

    service
        .append("c1", "t1", Bytes::new(), Bytes::from("a"))
        .await
        .unwrap();
    service
        .append("c1", "t2", Bytes::new(), Bytes::from("b"))
        .await
        .unwrap();
    service
        .append("c2", "t1", Bytes::new(), Bytes::from("c"))
        .await
        .unwrap();

    assert!(dir.path().join("c1").join("t1").join("0000000001").exists());
    assert!(dir.path().join("c1").join("t2").join("0000000001").exists());
    assert!(dir.path().join("c2").join("t1").join("0000000001").exists());
    assert_eq!(service.inflights().await, 3);
    assert!(!service.empty("c1", "t1").await);
    assert!(service.empty("c9", "t9").await, "unknown pair is empty");

    service.stop().await;
    service.stop().await; // second stop is a no-op
}

#[tokio::test]
async fn test_flush_inflights_rejected_while_running() {
    let dir = TempDir::new().unwrap();
    let service = DiskHandoff::new(
        test_config(dir.path()),
        recording_delivery(Arc::new(Mutex::new(Vec::new()))),
    )
    .unwrap();
    service.start().await.unwrap();

    let err = service.flush_inflights().await.unwrap_err();
    assert!(matches!(err, HandoffError::StillRunning));
    service.stop().await;
}

#[tokio::test]
async fn test_flush_inflights_drains_buffered_blocks() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(dir.path());

    // broker down for the whole first life: everything stays buffered
    {
        let calls = Arc::new(AtomicU32::new(0));
        let service = DiskHandoff::new(cfg.clone(), broker_down_delivery(calls)).unwrap();
        service.start().await.unwrap();
        for i in 0..3 {
            service
                .append("c1", "t1", Bytes::new(), Bytes::from(format!("j-{i}")))
                .await
                .unwrap();
        }
        service.stop().await;
    }

    // offline drain against a recovered broker
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let service = DiskHandoff::new(cfg, recording_delivery(delivered.clone())).unwrap();
    service.flush_inflights().await.unwrap();

    let got: Vec<_> = delivered
        .lock()
        .unwrap()
        .iter()
        .map(|b| String::from_utf8_lossy(&b.value).into_owned())
        .collect();
    assert_eq!(got, ["j-0", "j-1", "j-2"]);
}
