//! Subscribe Server
//!
//! Long-poll and WebSocket surface consumers talk to. Unlike the pub side,
//! the sub server runs its own accept loop and serves every socket with a
//! per-connection hyper future, because draining cleanly requires knowing
//! which sockets are idle keep-alives and which carry a request - state a
//! shared serve loop does not expose.
//!
//! ## Connection Lifecycle
//!
//! Each accepted socket gets a `ConnHandle` carried through request
//! extensions. Middleware marks the conn Active when a request enters and
//! Idle when the response leaves; the WebSocket route marks it Hijacked
//! before the protocol switch and reports Closed when its stream ends.
//!
//! ## Shutdown
//!
//! 1. Stop accepting: the listener is dropped, new connections are refused
//! 2. Idle keep-alive conns are closed immediately
//! 3. In-flight requests get `sub_timeout` to finish; exceeding it logs a
//!    warning but never blocks forever
//! 4. The ack sender is dropped, letting the committer drain and exit
//! 5. Completion is signalled so the coordinator can tear down the backing
//!    stores
//!
//! ## Group Policing
//!
//! Requests naming an unregistered consumer group are refused, and repeat
//! offenders are rate-limited per remote address with a leaky bucket.
//! Clients that have presented a valid group are remembered and ride out
//! manager hiccups.

use crate::ack::{AckBatch, AckOffset, ACK_CHANNEL_CAPACITY};
use crate::api::ApiError;
use crate::conn::{ConnCtx, ConnHandle, ConnState, ConnTracker};
use crate::throttle::LeakyBuckets;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures::{SinkExt, StreamExt};
use gatehouse_store::{ManagerStore, StoreError, SubMessage, SubStore};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tower::ServiceExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SubConfig {
    pub addr: SocketAddr,
    /// How long shutdown waits for in-flight connections (default: 30 s)
    pub sub_timeout: Duration,
    /// WebSocket read limit in bytes (default: 8 KiB)
    pub ws_read_limit: usize,
    /// A subscription socket missing the pong window is dropped (default: 60 s)
    pub ws_pong_wait: Duration,
    /// Messages per fetch batch cap (default: 100)
    pub fetch_limit: usize,
    /// Closed-conn notification channel capacity (default: 1024)
    pub closed_conn_capacity: usize,
}

impl Default for SubConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9192".parse().expect("static addr"),
            sub_timeout: Duration::from_secs(30),
            ws_read_limit: 8 << 10,
            ws_pong_wait: Duration::from_secs(60),
            fetch_limit: 100,
            closed_conn_capacity: 1 << 10,
        }
    }
}

#[derive(Clone)]
pub struct SubState {
    sub_store: Arc<dyn SubStore>,
    manager: Arc<dyn ManagerStore>,
    ack_tx: Arc<StdMutex<Option<mpsc::Sender<AckBatch>>>>,
    throttle: Arc<LeakyBuckets>,
    good_clients: Arc<StdMutex<HashSet<String>>>,
    cfg: Arc<SubConfig>,
    shutdown: watch::Receiver<bool>,
}

pub struct SubServer {
    cfg: SubConfig,
    state: SubState,
    tracker: Arc<ConnTracker>,
}

impl SubServer {
    /// Build the server plus its two outbound channels: closed-conn remote
    /// addresses (for fetcher teardown) and ack batches (for the committer).
    pub fn new(
        cfg: SubConfig,
        sub_store: Arc<dyn SubStore>,
        manager: Arc<dyn ManagerStore>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, mpsc::Receiver<String>, mpsc::Receiver<AckBatch>) {
        let (tracker, closed_rx) = ConnTracker::new(cfg.closed_conn_capacity);
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);

        let state = SubState {
            sub_store,
            manager,
            ack_tx: Arc::new(StdMutex::new(Some(ack_tx))),
            throttle: Arc::new(LeakyBuckets::new(3, Duration::from_secs(60))),
            good_clients: Arc::new(StdMutex::new(HashSet::new())),
            cfg: Arc::new(cfg.clone()),
            shutdown,
        };

        (
            Self {
                cfg,
                state,
                tracker,
            },
            closed_rx,
            ack_rx,
        )
    }

    pub fn tracker(&self) -> Arc<ConnTracker> {
        self.tracker.clone()
    }

    /// Bind the listener without serving yet; lets callers learn the local
    /// address when binding port 0.
    pub async fn bind(self) -> std::io::Result<BoundSubServer> {
        let listener = TcpListener::bind(self.cfg.addr).await?;
        info!(addr = %listener.local_addr()?, "sub server listening");
        Ok(BoundSubServer {
            server: self,
            listener,
        })
    }

    /// Accept and serve until shutdown, then drain per the shutdown
    /// sequence and signal `completion`.
    pub async fn run(self, completion: oneshot::Sender<()>) -> std::io::Result<()> {
        self.bind().await?.run(completion).await
    }
}

pub struct BoundSubServer {
    server: SubServer,
    listener: TcpListener,
}

impl BoundSubServer {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tracker(&self) -> Arc<ConnTracker> {
        self.server.tracker.clone()
    }

    pub async fn run(self, completion: oneshot::Sender<()>) -> std::io::Result<()> {
        let Self { server: this, listener } = self;

        let base_router = router(this.state.clone());
        let mut shutdown = this.state.shutdown.clone();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    next_id += 1;
                    let ctx = Arc::new(ConnCtx {
                        handle: ConnHandle::new(next_id, remote.to_string()),
                        tracker: this.tracker.clone(),
                    });
                    let conn_router = base_router.clone().layer(Extension(ctx.clone()));
                    let tracker = this.tracker.clone();
                    tokio::spawn(async move {
                        tracker.transition(&ctx.handle, ConnState::New);
                        serve_conn(stream, conn_router, ctx.clone()).await;
                        // a hijacked socket reports Closed from its WebSocket task
                        if !tracker.is_hijacked(ctx.handle.id) {
                            tracker.transition(&ctx.handle, ConnState::Closed);
                        }
                    });
                }
            }
        }

        drop(listener); // refuse new connections from here on
        info!("sub listener closed");

        this.tracker.begin_shutdown();
        this.tracker.wait_inflight(this.cfg.sub_timeout).await;

        // handlers are done; dropping the sender lets the committer drain
        this.state.ack_tx.lock().expect("ack sender lock").take();

        let _ = completion.send(());
        info!("sub server stopped");
        Ok(())
    }
}

fn router(state: SubState) -> Router {
    Router::new()
        .route("/v1/msgs/:cluster/:topic", get(fetch_messages))
        .route("/v1/ws/msgs/:cluster/:topic", get(ws_subscribe))
        .route("/v1/offsets/:cluster/:topic", post(ack_offsets))
        .layer(axum::middleware::from_fn(track_request))
        .with_state(state)
}

/// Serve one socket; `closed()` firing means the tracker wants it gone.
async fn serve_conn(stream: TcpStream, conn_router: Router, ctx: Arc<ConnCtx>) {
    let io = TokioIo::new(stream);
    let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        conn_router.clone().oneshot(request)
    });
    let conn = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(remote = %ctx.handle.remote, error = %e, "connection ended");
            }
        }
        _ = ctx.handle.closed() => {
            // unblocks a parked keep-alive read immediately
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!(remote = %ctx.handle.remote, error = %e, "connection close");
            }
        }
    }
}

async fn track_request(
    Extension(ctx): Extension<Arc<ConnCtx>>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    ctx.tracker.transition(&ctx.handle, ConnState::Active);
    let response = next.run(request).await;
    ctx.tracker.transition(&ctx.handle, ConnState::Idle);
    response
}

async fn validate_group(state: &SubState, remote: &str, group: &str) -> Result<(), ApiError> {
    if state.manager.group_registered(group).await {
        state
            .good_clients
            .lock()
            .expect("good clients lock")
            .insert(remote.to_string());
        return Ok(());
    }

    // a client that has presented valid groups rides out manager hiccups
    if state
        .good_clients
        .lock()
        .expect("good clients lock")
        .contains(remote)
    {
        return Ok(());
    }

    if !state.throttle.pour(remote) {
        return Err(ApiError::Throttled);
    }
    Err(ApiError::InvalidGroup(group.to_string()))
}

#[derive(Debug, Deserialize)]
struct SubQuery {
    group: String,
    limit: Option<usize>,
    /// Long-poll wait in seconds; absent means return immediately.
    wait: Option<u64>,
}

async fn fetch_messages(
    State(state): State<SubState>,
    Extension(ctx): Extension<Arc<ConnCtx>>,
    Path((cluster, topic)): Path<(String, String)>,
    Query(query): Query<SubQuery>,
) -> Result<Json<Vec<SubMessage>>, ApiError> {
    let remote = ctx.handle.remote.clone();
    validate_group(&state, &remote, &query.group).await?;

    let limit = query
        .limit
        .unwrap_or(state.cfg.fetch_limit)
        .min(state.cfg.fetch_limit);
    let deadline = query
        .wait
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs.min(30)));

    loop {
        match state
            .sub_store
            .fetch(&cluster, &topic, &query.group, &remote, limit)
            .await
        {
            Ok(batch) if batch.is_empty() => match deadline {
                Some(deadline) if tokio::time::Instant::now() < deadline => {
                    let mut shutdown = state.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        _ = shutdown.changed() => return Ok(Json(Vec::new())),
                    }
                }
                _ => return Ok(Json(Vec::new())),
            },
            Ok(batch) => return Ok(Json(batch)),
            Err(StoreError::BrokerDown(_)) => return Err(ApiError::NotOpen),
            Err(e) => {
                debug!(%cluster, %topic, error = %e, "fetch failed");
                return Err(ApiError::Internal);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct AckQuery {
    group: String,
}

#[derive(Debug, Deserialize)]
struct AckEntry {
    partition: i32,
    offset: i64,
}

async fn ack_offsets(
    State(state): State<SubState>,
    Extension(ctx): Extension<Arc<ConnCtx>>,
    Path((cluster, topic)): Path<(String, String)>,
    Query(query): Query<AckQuery>,
    Json(entries): Json<Vec<AckEntry>>,
) -> Result<StatusCode, ApiError> {
    validate_group(&state, &ctx.handle.remote, &query.group).await?;

    let batch: AckBatch = entries
        .into_iter()
        .map(|entry| AckOffset {
            cluster: cluster.clone(),
            topic: topic.clone(),
            group: query.group.clone(),
            partition: entry.partition,
            offset: entry.offset,
        })
        .collect();

    let sender = state.ack_tx.lock().expect("ack sender lock").clone();
    let Some(sender) = sender else {
        return Err(ApiError::NotOpen);
    };
    sender.send(batch).await.map_err(|_| ApiError::NotOpen)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_subscribe(
    State(state): State<SubState>,
    Extension(ctx): Extension<Arc<ConnCtx>>,
    Path((cluster, topic)): Path<(String, String)>,
    Query(query): Query<SubQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let remote = ctx.handle.remote.clone();
    validate_group(&state, &remote, &query.group).await?;
    let limit = query
        .limit
        .unwrap_or(state.cfg.fetch_limit)
        .min(state.cfg.fetch_limit);

    ctx.tracker.transition(&ctx.handle, ConnState::Hijacked);
    let ws = ws.max_message_size(state.cfg.ws_read_limit);
    Ok(ws.on_upgrade(move |socket| {
        ws_stream(socket, state, ctx, cluster, topic, query.group, remote, limit)
    }))
}

#[allow(clippy::too_many_arguments)]
async fn ws_stream(
    socket: WebSocket,
    state: SubState,
    ctx: Arc<ConnCtx>,
    cluster: String,
    topic: String,
    group: String,
    remote: String,
    limit: usize,
) {
    let (mut sink, mut source) = socket.split();
    let mut fetch_tick = tokio::time::interval(Duration::from_millis(100));
    let mut ping_tick = tokio::time::interval(state.cfg.ws_pong_wait / 2);
    let mut last_pong = tokio::time::Instant::now();
    let mut shutdown = state.shutdown.clone();

    'stream: loop {
        tokio::select! {
            _ = shutdown.changed() => break 'stream,

            _ = fetch_tick.tick() => {
                match state.sub_store.fetch(&cluster, &topic, &group, &remote, limit).await {
                    Ok(batch) => {
                        for msg in batch {
                            let payload = match serde_json::to_string(&msg) {
                                Ok(payload) => payload,
                                Err(e) => {
                                    debug!(error = %e, "encoding sub message");
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(payload)).await.is_err() {
                                break 'stream;
                            }
                        }
                    }
                    Err(e) => debug!(%cluster, %topic, error = %e, "ws fetch failed"),
                }
            }

            _ = ping_tick.tick() => {
                if last_pong.elapsed() > state.cfg.ws_pong_wait {
                    debug!(%remote, "pong deadline missed, dropping subscription");
                    break 'stream;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break 'stream;
                }
            }

            msg = source.next() => match msg {
                Some(Ok(Message::Pong(_))) => last_pong = tokio::time::Instant::now(),
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break 'stream;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break 'stream,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%remote, error = %e, "ws read failed");
                    break 'stream;
                }
            }
        }
    }

    ctx.tracker.transition(&ctx.handle, ConnState::Closed);
}
