//! Store Error Types
//!
//! ## Error Categories
//!
//! ### Broker Errors
//! - `BrokerDown`: transient; callers fall back to hinted handoff
//! - `UnknownTopic`: permanent input error, surfaced to the caller
//!
//! ### Coordination Errors
//! - `OffsetError::NodeMissing`: the coordination store has no node for the
//!   (group, topic, partition); the commit is invalid and never retried
//! - `OffsetError::Backend`: transient; the slot is retried on the next flush

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("broker down: {0}")]
    BrokerDown(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("store error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("node missing")]
    NodeMissing,

    #[error("offset backend: {0}")]
    Backend(String),
}
