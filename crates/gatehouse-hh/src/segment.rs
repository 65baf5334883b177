//! Segment Files
//!
//! A segment is a fixed-cap, append-only chunk of one queue's log: a raw
//! concatenation of encoded blocks with no per-segment header. The filename
//! is the segment id as a zero-padded decimal, so a directory listing sorts
//! into log order:
//!
//! ```text
//! <dir>/<cluster>/<topic>/
//!   0000000001
//!   0000000002
//!   cursor.dmp
//! ```
//!
//! ## Durability
//!
//! Appends are written straight to the file descriptor (no userspace
//! buffering), and `sync` is called when the segment rolls and when the queue
//! closes. A crash therefore loses at most what the OS page cache held.
//!
//! ## Torn Tails
//!
//! A crash mid-append can leave a partial block at the end of the tail
//! segment. `Segment::open` scans the file and truncates anything past the
//! last whole block; rolled segments are immutable and never rescanned.

use crate::error::{HandoffError, Result};
use gatehouse_core::{Block, Error as BlockError, BLOCK_MAGIC};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

/// Render a segment id as its on-disk file name.
pub fn segment_file_name(id: u64) -> String {
    format!("{:010}", id)
}

/// Parse a file name back into a segment id. Non-segment files yield None.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    if name.len() != 10 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// An open segment positioned for appends
pub struct Segment {
    id: u64,
    path: PathBuf,
    file: File,
    size: u64,
    max_bytes: u64,
}

impl Segment {
    /// Create a fresh segment file.
    pub async fn create(dir: &Path, id: u64, max_bytes: u64) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            id,
            path,
            file,
            size: 0,
            max_bytes,
        })
    }

    /// Open an existing segment for appends, truncating any torn tail.
    pub async fn open(dir: &Path, id: u64, max_bytes: u64) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let valid = scan_valid_len(&path, id).await?;

        let file = OpenOptions::new().append(true).open(&path).await?;
        let len = file.metadata().await?.len();
        if valid < len {
            warn!(segment = id, valid, len, "truncating torn segment tail");
            file.set_len(valid).await?;
            file.sync_all().await?;
        }

        Ok(Self {
            id,
            path,
            file,
            size: valid,
            max_bytes,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one block, returning the bytes written.
    ///
    /// Fails with `SegmentFull` when the post-append size would exceed the
    /// cap. An empty segment always accepts one block, so a block can never
    /// outgrow the queue.
    pub async fn append(&mut self, block: &Block) -> Result<u64> {
        let len = block.encoded_len() as u64;
        if self.size > 0 && self.size + len > self.max_bytes {
            return Err(HandoffError::SegmentFull);
        }

        let buf = block.encode();
        self.file.write_all(&buf).await?;
        self.size += len;
        Ok(len)
    }

    /// Fsync the segment to disk.
    pub async fn sync(&mut self) -> Result<()> {
        self.file.sync_all().await?;
        Ok(())
    }
}

/// Modification time of a segment file, used to derive block age.
pub async fn segment_mtime(path: &Path) -> Result<SystemTime> {
    Ok(tokio::fs::metadata(path).await?.modified()?)
}

/// Walk a segment and return the byte length of its whole-block prefix.
async fn scan_valid_len(path: &Path, id: u64) -> Result<u64> {
    let mut reader = SegmentReader::open_path(path, id).await?;
    while reader.next().await?.is_some() {}
    Ok(reader.position())
}

/// Sequential block reader over one segment file
pub struct SegmentReader {
    segment_id: u64,
    file: File,
    pos: u64,
}

impl SegmentReader {
    pub async fn open(dir: &Path, id: u64) -> Result<Self> {
        Self::open_path(&dir.join(segment_file_name(id)), id).await
    }

    async fn open_path(path: &Path, id: u64) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            segment_id: id,
            file,
            pos: 0,
        })
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Byte offset of the next block boundary.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub async fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.pos = offset;
        Ok(())
    }

    /// Read the next block.
    ///
    /// Returns `Ok(None)` at end-of-file and on a torn tail; the file cursor
    /// is rewound to the last whole-block boundary so a later call can pick
    /// up bytes appended in the meantime. Framing damage that is not a
    /// simple truncation surfaces as `Corrupt`.
    pub async fn next(&mut self) -> Result<Option<Block>> {
        let mut magic = [0u8; 2];
        match self.file.read_exact(&mut magic).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.rewind().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        if magic != BLOCK_MAGIC {
            return Err(HandoffError::Block(BlockError::BadMagic(magic)));
        }

        let key = match self.read_prefixed().await? {
            Some(buf) => buf,
            None => return Ok(None),
        };
        let value = match self.read_prefixed().await? {
            Some(buf) => buf,
            None => return Ok(None),
        };
        if value.is_empty() {
            return Err(HandoffError::Corrupt(format!(
                "empty block value at {}/{}",
                self.segment_id, self.pos
            )));
        }

        let block = Block {
            magic,
            key: key.into(),
            value: value.into(),
        };
        self.pos += block.encoded_len() as u64;
        Ok(Some(block))
    }

    /// Read one length-prefixed field; None means the frame is torn.
    async fn read_prefixed(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.file.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.rewind().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > gatehouse_core::MAX_BLOCK_SIZE {
            return Err(HandoffError::Corrupt(format!(
                "field length {} at {}/{}",
                len, self.segment_id, self.pos
            )));
        }

        let mut buf = vec![0u8; len];
        match self.file.read_exact(&mut buf).await {
            Ok(_) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(
                    segment = self.segment_id,
                    offset = self.pos,
                    "torn block, treating as end of segment"
                );
                self.rewind().await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn rewind(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.pos)).await?;
        Ok(())
    }
}
