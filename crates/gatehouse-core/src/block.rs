//! Block Data Structure
//!
//! This module defines the core `Block` type - the unit of durability in the
//! hinted-handoff path, and `ClusterTopic`, the key every queue and store
//! operation is addressed by.
//!
//! ## What is a Block?
//!
//! A block is one buffered publish: the message key and value captured at the
//! moment the upstream broker refused the write. Blocks carry no timestamp;
//! their age is derived from the mtime of the segment file holding them.
//!
//! ## Wire Format
//!
//! Blocks are serialized as a raw concatenation, big-endian lengths:
//!
//! ```text
//! ┌──────────┬───────────────┬─────────┬─────────────────┬───────────┐
//! │ magic    │ key_len       │ key     │ value_len       │ value     │
//! │ (2 bytes)│ (u32 BE)      │ (N)     │ (u32 BE)        │ (M)       │
//! └──────────┴───────────────┴─────────┴─────────────────┴───────────┘
//! ```
//!
//! The magic pair is `{0, 0}` today and is reserved for format evolution.
//! Keys may be empty; values may not, and are capped at 1 MiB.
//!
//! ## Design Decisions
//!
//! - Uses `bytes::Bytes` for zero-copy hand-off between the HTTP layer, the
//!   broker client, and the disk queue
//! - No per-block checksum: a torn tail is detected by truncated framing and
//!   cut off, which is the only corruption mode an append-only file has

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Current block magic. Reserved for format evolution.
pub const BLOCK_MAGIC: [u8; 2] = [0, 0];

/// Maximum block value size accepted by `Append` (1 MiB).
pub const MAX_BLOCK_SIZE: usize = 1 << 20;

const LEN_FIELD: usize = 4;

/// A single buffered publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Format magic, `{0, 0}` today
    pub magic: [u8; 2],

    /// Message key, may be empty
    pub key: Bytes,

    /// Message value, never empty
    pub value: Bytes,
}

impl Block {
    /// Build a block, enforcing the value constraints.
    pub fn new(key: Bytes, value: Bytes) -> Result<Self> {
        if value.is_empty() {
            return Err(Error::EmptyValue);
        }
        if value.len() > MAX_BLOCK_SIZE {
            return Err(Error::BlockTooLarge {
                size: value.len(),
                max: MAX_BLOCK_SIZE,
            });
        }

        Ok(Self {
            magic: BLOCK_MAGIC,
            key,
            value,
        })
    }

    /// Size of this block on the wire.
    pub fn encoded_len(&self) -> usize {
        BLOCK_MAGIC.len() + LEN_FIELD + self.key.len() + LEN_FIELD + self.value.len()
    }

    /// Serialize into `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.value);
    }

    /// Serialize into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode one block from the front of `buf`.
    ///
    /// Returns the block and the number of bytes consumed. A truncated buffer
    /// yields `Error::Torn` with the offset the partial block starts at set
    /// to 0 relative to `buf`; callers translate to a file offset.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0;

        let magic: [u8; 2] = take(buf, &mut pos, 2)?
            .try_into()
            .expect("slice length checked");
        if magic != BLOCK_MAGIC {
            return Err(Error::BadMagic(magic));
        }

        let key_len = read_u32(buf, &mut pos)? as usize;
        let key = Bytes::copy_from_slice(take(buf, &mut pos, key_len)?);

        let value_len = read_u32(buf, &mut pos)? as usize;
        let value = Bytes::copy_from_slice(take(buf, &mut pos, value_len)?);

        Ok((Self { magic, key, value }, pos))
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if buf.len() < *pos + n {
        return Err(Error::Torn(*pos as u64));
    }
    let out = &buf[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let raw: [u8; 4] = take(buf, pos, 4)?.try_into().expect("slice length checked");
    Ok(u32::from_be_bytes(raw))
}

/// The (cluster, topic) pair every queue and store operation is keyed by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterTopic {
    pub cluster: String,
    pub topic: String,
}

impl ClusterTopic {
    pub fn new(cluster: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            topic: topic.into(),
        }
    }
}

impl std::fmt::Display for ClusterTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.cluster, self.topic)
    }
}
