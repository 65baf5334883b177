//! Publish Server
//!
//! The HTTP surface producers talk to. A publish goes to the broker store
//! synchronously; when the broker refuses it, the message is appended to the
//! hinted-handoff buffer instead and the client still gets an accept - the
//! drain loop replays it once the broker recovers. Delayed publishes
//! (`?delay=<secs>`) become job rows fired later by the executor.
//!
//! The pub side has no keep-alive bookkeeping to do, so it runs on a plain
//! `axum::serve` loop with graceful shutdown.

use crate::api::ApiError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use gatehouse_core::MAX_BLOCK_SIZE;
use gatehouse_hh::{Handoff, HandoffError};
use gatehouse_jobs::{next_job_id, JobError, JobItem, JobStore};
use gatehouse_store::{ManagerStore, PubStore};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct PubState {
    pub pub_store: Arc<dyn PubStore>,
    pub handoff: Arc<dyn Handoff>,
    pub manager: Arc<dyn ManagerStore>,
    pub job_store: Arc<dyn JobStore>,
}

#[derive(Debug, Deserialize)]
pub struct PubQuery {
    pub key: Option<String>,
    /// Delay in seconds; a delayed publish becomes a job row.
    pub delay: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PubResponse {
    partition: i32,
    offset: i64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    buffered: bool,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    job_id: i64,
}

pub fn router(state: PubState) -> Router {
    Router::new()
        .route("/v1/msgs/:cluster/:topic", post(publish))
        .route("/v1/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn publish(
    State(state): State<PubState>,
    Path((cluster, topic)): Path<(String, String)>,
    Query(query): Query<PubQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError::EmptyMessage);
    }
    if body.len() > MAX_BLOCK_SIZE {
        return Err(ApiError::MessageTooLarge);
    }
    if state.manager.topic_appid(&topic).await.is_none() {
        return Err(ApiError::UnknownTopic(topic));
    }

    if let Some(delay) = query.delay {
        return add_job(&state, &topic, body, delay).await;
    }

    let key = query.key.map(Bytes::from);
    match state
        .pub_store
        .sync_pub(&cluster, &topic, key.clone(), body.clone())
        .await
    {
        Ok((partition, offset)) => Ok((
            StatusCode::CREATED,
            Json(PubResponse {
                partition,
                offset,
                buffered: false,
            }),
        )
            .into_response()),
        Err(e) => {
            warn!(%cluster, %topic, error = %e, "publish failed, buffering");
            match state
                .handoff
                .append(&cluster, &topic, key.unwrap_or_default(), body)
                .await
            {
                Ok(()) => Ok((
                    StatusCode::CREATED,
                    Json(PubResponse {
                        partition: -1,
                        offset: -1,
                        buffered: true,
                    }),
                )
                    .into_response()),
                Err(HandoffError::NotOpen) => Err(ApiError::NotOpen),
                Err(HandoffError::Block(gatehouse_core::Error::BlockTooLarge { .. })) => {
                    Err(ApiError::MessageTooLarge)
                }
                Err(_) => Err(ApiError::Internal),
            }
        }
    }
}

async fn add_job(
    state: &PubState,
    topic: &str,
    payload: Bytes,
    delay: u64,
) -> Result<Response, ApiError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let item = JobItem {
        job_id: next_job_id(),
        payload: payload.to_vec(),
        ctime: now,
        due_time: now + delay as i64,
    };

    state
        .job_store
        .setup_topic(topic)
        .await
        .map_err(|_| ApiError::Internal)?;
    match state.job_store.add(topic, &item).await {
        Ok(()) => Ok((StatusCode::CREATED, Json(JobResponse { job_id: item.job_id }))
            .into_response()),
        Err(JobError::UnknownTopic(t)) => Err(ApiError::UnknownTopic(t)),
        Err(_) => Err(ApiError::Internal),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    handoff: &'static str,
    inflights: i64,
}

async fn status(State(state): State<PubState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        handoff: state.handoff.name(),
        inflights: state.handoff.inflights().await,
    })
}

/// Serve the pub router until shutdown fires; resolves once in-flight
/// requests finish.
pub async fn serve(
    addr: SocketAddr,
    state: PubState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "pub server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    info!(%addr, "pub server stopped");
    Ok(())
}
