//! Gatehouse Gateway
//!
//! The HTTP pub/sub gateway proper: publish and subscribe servers, the
//! connection tracker that makes subscribe-side draining possible, the ack
//! committer batching consumer offsets into the coordination store, and the
//! lifecycle coordinator that starts and stops everything in dependency
//! order.
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────┐   publish    ┌───────────┐
//! clients ──▶│ pub server │ ───────────▶ │ PubStore  │─▶ broker
//!            └─────┬──────┘   on error   └───────────┘
//!                  └────────────────────▶ hinted handoff
//!
//!            ┌────────────┐   fetch      ┌───────────┐
//! clients ──▶│ sub server │ ───────────▶ │ SubStore  │─▶ broker
//!            └─────┬──────┘              └───────────┘
//!                  │ acks (bounded channel)
//!                  ▼
//!            ┌──────────────┐  batched   ┌─────────────┐
//!            │ ack committer│ ─────────▶ │ OffsetStore │
//!            └──────────────┘            └─────────────┘
//! ```

pub mod ack;
pub mod api;
pub mod config;
pub mod conn;
pub mod gateway;
pub mod pub_server;
pub mod sub_server;
pub mod throttle;

pub use ack::{AckBatch, AckCommitter, AckOffset, ACK_CHANNEL_CAPACITY};
pub use conn::{ConnCtx, ConnHandle, ConnState, ConnTracker, InflightCounter};
pub use gateway::{broker_delivery, shutdown_signal, Gateway, GatewayConfig, ShutdownSignal};
pub use sub_server::{SubConfig, SubServer};
pub use throttle::LeakyBuckets;
