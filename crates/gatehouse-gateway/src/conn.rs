//! Connection Tracker
//!
//! Tracks every subscribe-side HTTP connection through its lifecycle so the
//! server can tell idle keep-alive sockets from ones carrying a request, and
//! drain cleanly on shutdown.
//!
//! ## State Transitions
//!
//! ```text
//! New ──▶ Active ──▶ Idle ──▶ Active ─▶ ... ──▶ Closed
//!              │
//!              └──▶ Hijacked (WebSocket take-over) ──▶ Closed
//! ```
//!
//! - `New` raises the in-flight count
//! - `Idle` parks the conn in the idle set - unless shutdown has begun, in
//!   which case the conn is closed immediately and never parked
//! - `Active` and `Hijacked` pull the conn out of the idle set
//! - `Hijacked` moves the conn from HTTP to WebSocket gauge accounting
//!   without touching the in-flight count
//! - `Closed` lowers the in-flight count and emits the remote address on a
//!   bounded channel so fetcher state keyed by it can be torn down
//!
//! The in-flight count covers a connection from `New` to `Closed`; for
//! hijacked conns `Closed` is reported by the WebSocket task when its stream
//! ends, so a shutdown drain waits for sockets, not just HTTP exchanges.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Active,
    Idle,
    Hijacked,
    Closed,
}

/// Per-connection identity plus the handle that closes it
#[derive(Clone)]
pub struct ConnHandle {
    pub id: u64,
    pub remote: String,
    close: Arc<Notify>,
    // Closed may race between the conn task and a WebSocket task; only the
    // first report counts
    closed_reported: Arc<AtomicBool>,
}

impl ConnHandle {
    pub fn new(id: u64, remote: String) -> Self {
        Self {
            id,
            remote,
            close: Arc::new(Notify::new()),
            closed_reported: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Resolves when the tracker wants this connection gone.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

/// A connection handle bundled with its tracker, carried through request
/// extensions so handlers and middleware can report transitions.
pub struct ConnCtx {
    pub handle: ConnHandle,
    pub tracker: Arc<ConnTracker>,
}

/// Count of live connections with a timeout-bounded wait for zero
pub struct InflightCounter {
    tx: watch::Sender<i64>,
}

impl InflightCounter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0i64);
        Self { tx }
    }

    pub fn add(&self) {
        self.tx.send_modify(|n| *n += 1);
    }

    pub fn done(&self) {
        self.tx.send_modify(|n| *n -= 1);
    }

    pub fn count(&self) -> i64 {
        *self.tx.borrow()
    }

    /// Wait until the count reaches zero. Returns true when the wait timed
    /// out with connections still live.
    pub async fn wait_zero(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow_and_update() <= 0 {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_err()
    }
}

impl Default for InflightCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnTracker {
    inflight: InflightCounter,
    http_conns: AtomicI64,
    ws_conns: AtomicI64,
    idle: Mutex<HashMap<u64, Arc<Notify>>>,
    hijacked: Mutex<HashSet<u64>>,
    shutting_down: AtomicBool,
    closed_tx: mpsc::Sender<String>,
}

impl ConnTracker {
    /// Build a tracker plus the closed-conn channel carrying remote
    /// addresses of connections that went away.
    pub fn new(closed_capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (closed_tx, closed_rx) = mpsc::channel(closed_capacity);
        let tracker = Arc::new(Self {
            inflight: InflightCounter::new(),
            http_conns: AtomicI64::new(0),
            ws_conns: AtomicI64::new(0),
            idle: Mutex::new(HashMap::new()),
            hijacked: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
            closed_tx,
        });
        (tracker, closed_rx)
    }

    pub fn transition(&self, handle: &ConnHandle, state: ConnState) {
        match state {
            ConnState::New => {
                self.inflight.add();
                self.http_conns.fetch_add(1, Ordering::Relaxed);
            }

            ConnState::Active => {
                self.idle.lock().expect("idle lock").remove(&handle.id);
            }

            ConnState::Idle => {
                if self.is_hijacked(handle.id) {
                    return; // the socket belongs to a WebSocket now
                }
                if self.shutting_down.load(Ordering::SeqCst) {
                    // IO is quiesced, close the client instead of parking it
                    handle.close.notify_one();
                    self.idle.lock().expect("idle lock").remove(&handle.id);
                } else {
                    self.idle
                        .lock()
                        .expect("idle lock")
                        .insert(handle.id, handle.close.clone());
                }
            }

            ConnState::Hijacked => {
                self.idle.lock().expect("idle lock").remove(&handle.id);
                self.hijacked.lock().expect("hijacked lock").insert(handle.id);
                self.http_conns.fetch_sub(1, Ordering::Relaxed);
                self.ws_conns.fetch_add(1, Ordering::Relaxed);
            }

            ConnState::Closed => {
                if handle.closed_reported.swap(true, Ordering::SeqCst) {
                    return;
                }
                self.idle.lock().expect("idle lock").remove(&handle.id);
                let was_ws = self.hijacked.lock().expect("hijacked lock").remove(&handle.id);
                if was_ws {
                    self.ws_conns.fetch_sub(1, Ordering::Relaxed);
                } else {
                    self.http_conns.fetch_sub(1, Ordering::Relaxed);
                }
                self.inflight.done();

                if self.closed_tx.try_send(handle.remote.clone()).is_err() {
                    debug!(remote = %handle.remote, "closed-conn channel full, teardown skipped");
                }
            }
        }
    }

    pub fn is_hijacked(&self, id: u64) -> bool {
        self.hijacked.lock().expect("hijacked lock").contains(&id)
    }

    /// Refuse new idle parks and close every idle connection right away.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let idle: Vec<_> = self
            .idle
            .lock()
            .expect("idle lock")
            .drain()
            .map(|(_, close)| close)
            .collect();
        debug!(count = idle.len(), "closing idle connections");
        for close in idle {
            close.notify_one();
        }
    }

    /// Wait for every connection to close; true when the timeout elapsed
    /// first.
    pub async fn wait_inflight(&self, timeout: Duration) -> bool {
        let timed_out = self.inflight.wait_zero(timeout).await;
        if timed_out {
            warn!(
                remaining = self.inflight.count(),
                ?timeout,
                "shutdown drain timed out with connections still live"
            );
        }
        timed_out
    }

    pub fn inflight_count(&self) -> i64 {
        self.inflight.count()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("idle lock").len()
    }

    pub fn http_count(&self) -> i64 {
        self.http_conns.load(Ordering::Relaxed)
    }

    pub fn ws_count(&self) -> i64 {
        self.ws_conns.load(Ordering::Relaxed)
    }
}
