//! Error Types for Gatehouse Core
//!
//! This module defines the error types shared by every gatehouse crate that
//! touches blocks or their wire form.
//!
//! ## Error Categories
//!
//! ### Input Errors
//! - `BlockTooLarge`: Block value exceeds the 1 MiB cap
//! - `EmptyValue`: Block value is empty (keys may be empty, values may not)
//!
//! ### Wire Errors
//! - `Torn`: A partial block was found at the end of a file; readers treat
//!   this as end-of-file and writers truncate the tail
//! - `BadMagic`: Block starts with an unknown magic pair
//!
//! ## Usage
//!
//! All codec operations return `Result<T>` which is aliased to
//! `Result<T, Error>`. This allows clean error propagation with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Block value too large: {size} bytes (max {max})")]
    BlockTooLarge { size: usize, max: usize },

    #[error("Block value is empty")]
    EmptyValue,

    #[error("Torn block at offset {0}")]
    Torn(u64),

    #[error("Bad block magic: {0:?}")]
    BadMagic([u8; 2]),
}
