//! Hinted-Handoff Error Types
//!
//! ## Error Categories
//!
//! ### Lifecycle Errors
//! - `NotOpen`: Append on a service or queue that is not running
//! - `StillRunning`: `flush_inflights` invoked against a live service
//!
//! ### Disk Errors
//! - `SegmentFull`: the tail segment cannot take the block (the queue rolls
//!   and retries, callers never see this)
//! - `CursorRegress`: an attempt to move the read pointer backward
//! - `Corrupt`: framing damage that is not a simple torn tail
//!
//! All handoff operations return `Result<T>` aliased to
//! `Result<T, HandoffError>`, so `?` propagation works throughout the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HandoffError>;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Block(#[from] gatehouse_core::Error),

    #[error("Segment full")]
    SegmentFull,

    #[error("Cursor regress: {from_segment}/{from_offset} -> {to_segment}/{to_offset}")]
    CursorRegress {
        from_segment: u64,
        from_offset: u64,
        to_segment: u64,
        to_offset: u64,
    },

    #[error("Service not open")]
    NotOpen,

    #[error("Service still running")]
    StillRunning,

    #[error("Corrupt segment: {0}")]
    Corrupt(String),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Invalid config: {0}")]
    Config(String),
}

/// Error classes a delivery callback can report back to the drain loop.
///
/// `BrokerDown` parks the reader on the current block and retries forever;
/// `Rejected` is retried a bounded number of times, then the block is skipped
/// and recorded to the audit log.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("broker down: {0}")]
    BrokerDown(String),

    #[error("delivery rejected: {0}")]
    Rejected(String),
}
