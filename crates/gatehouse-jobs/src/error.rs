//! Job Error Types
//!
//! All job-store and executor operations return `Result<T>` aliased to
//! `Result<T, JobError>`. Database errors convert automatically via
//! `#[from]`, so `?` propagation works throughout the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("job store error: {0}")]
    Internal(String),
}
