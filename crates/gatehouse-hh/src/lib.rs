//! Gatehouse Hinted Handoff
//!
//! This crate implements the durable local buffer that absorbs publishes
//! when the upstream broker is unavailable and drains them back when it
//! recovers. It is the only subsystem providing at-least-once durability
//! through broker failures.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  broker down   ┌──────────────┐
//! │  Pub path    │ ─────────────▶ │ DiskHandoff  │
//! └──────────────┘    append      └──────┬───────┘
//!                                        │ one Queue per (cluster, topic)
//!                                        ▼
//!                                 ┌──────────────┐
//!                                 │   Queue      │  segments + cursor
//!                                 │  drain loop  │ ─────────────▶ broker
//!                                 └──────────────┘   (injected callback)
//! ```
//!
//! Replay order equals append order within a queue; across queues there is
//! no ordering. Delivery is at-least-once: a crash replays at most one
//! cursor window of already-delivered blocks.

pub mod config;
pub mod cursor;
pub mod error;
pub mod queue;
pub mod segment;
pub mod service;

pub use config::HandoffConfig;
pub use cursor::Cursor;
pub use error::{DeliveryError, HandoffError, Result};
pub use queue::{DeliveryFn, DeliveryFuture, Queue, QueueState};
pub use segment::{Segment, SegmentReader};
pub use service::{DiskHandoff, DummyHandoff, Handoff};
