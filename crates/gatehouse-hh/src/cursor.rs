//! Cursor
//!
//! The persisted read pointer of one queue: `{segment_id, offset_in_segment}`
//! as two big-endian u64s in `cursor.dmp`. The cursor only ever moves
//! forward; the drain loop persists it every `dump_per_blocks` replays and on
//! clean shutdown, so a crash replays at most one cursor window of
//! already-delivered blocks (duplicates, never loss).
//!
//! Persistence is atomic: the pair is written to a temp file and renamed over
//! the old dump.

use crate::error::{HandoffError, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CURSOR_FILE: &str = "cursor.dmp";

#[derive(Debug)]
pub struct Cursor {
    path: PathBuf,
    segment_id: u64,
    offset: u64,
}

impl Cursor {
    /// Load the cursor for a queue directory.
    ///
    /// A missing dump starts at `{oldest_segment, 0}`. A present-but-corrupt
    /// dump logs and restarts at the oldest segment, which trades duplicate
    /// delivery for not losing blocks.
    pub async fn open(dir: &Path, oldest_segment: u64) -> Result<Self> {
        let path = dir.join(CURSOR_FILE);

        let (segment_id, offset) = match tokio::fs::read(&path).await {
            Ok(raw) if raw.len() == 16 => {
                let segment_id = u64::from_be_bytes(raw[..8].try_into().expect("len checked"));
                let offset = u64::from_be_bytes(raw[8..].try_into().expect("len checked"));
                (segment_id, offset)
            }
            Ok(raw) => {
                warn!(
                    path = %path.display(),
                    len = raw.len(),
                    "corrupt cursor dump, restarting at oldest segment"
                );
                (oldest_segment, 0)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (oldest_segment, 0),
            Err(e) => return Err(e.into()),
        };

        // a dump pointing below the oldest surviving segment is stale
        let (segment_id, offset) = if segment_id < oldest_segment {
            warn!(
                segment_id,
                oldest_segment, "cursor dump behind oldest segment, resetting"
            );
            (oldest_segment, 0)
        } else {
            (segment_id, offset)
        };

        Ok(Self {
            path,
            segment_id,
            offset,
        })
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move the pointer forward. Any non-monotone call is rejected.
    pub fn advance(&mut self, segment_id: u64, offset: u64) -> Result<()> {
        if segment_id < self.segment_id || (segment_id == self.segment_id && offset < self.offset)
        {
            return Err(HandoffError::CursorRegress {
                from_segment: self.segment_id,
                from_offset: self.offset,
                to_segment: segment_id,
                to_offset: offset,
            });
        }

        self.segment_id = segment_id;
        self.offset = offset;
        Ok(())
    }

    /// Pull an over-advanced pointer back to a real boundary.
    ///
    /// Only used when a torn tail was truncated below a persisted dump;
    /// everything else goes through `advance`.
    pub fn reset(&mut self, segment_id: u64, offset: u64) {
        self.segment_id = segment_id;
        self.offset = offset;
    }

    /// Write the pair atomically via write-to-tmp-then-rename.
    pub async fn persist(&self) -> Result<()> {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.segment_id.to_be_bytes());
        buf[8..].copy_from_slice(&self.offset.to_be_bytes());

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, buf).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
