//! Hinted-Handoff Configuration
//!
//! Controls how queues segment, replay, and purge their on-disk buffers:
//!
//! - **dirs**: data directories; each (cluster, topic) queue lives in exactly
//!   one of them, picked round-robin at creation
//! - **max_segment_bytes**: soft cap before a segment rolls (default: 10 MiB)
//! - **purge_interval**: how often the retention pass runs (default: 10 min)
//! - **max_age**: segments wholly behind the cursor and older than this are
//!   removed (default: 7 days)
//! - **initial_backoff / max_backoff / max_retries**: delivery retry shape
//!   (default: 200 ms doubling to 31 s, 8 attempts before a block is skipped)
//! - **poll_eof_sleep**: reader sleep at true end-of-log (default: 1 s)
//! - **dump_per_blocks**: cursor persistence cadence (default: every 100
//!   replayed blocks)

use crate::error::{HandoffError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Data directories queues are spread across
    pub dirs: Vec<PathBuf>,

    /// Soft segment size cap in bytes before rolling (default: 10 MiB)
    #[serde(default = "default_segment_bytes")]
    pub max_segment_bytes: u64,

    /// Retention pass interval (default: 10 minutes)
    #[serde(default = "default_purge_interval", with = "duration_ms")]
    pub purge_interval: Duration,

    /// Maximum age of a fully-consumed segment (default: 7 days)
    #[serde(default = "default_max_age", with = "duration_ms")]
    pub max_age: Duration,

    /// First delivery back-off step (default: 200 ms)
    #[serde(default = "default_initial_backoff", with = "duration_ms")]
    pub initial_backoff: Duration,

    /// Delivery back-off ceiling (default: 31 s)
    #[serde(default = "default_max_backoff", with = "duration_ms")]
    pub max_backoff: Duration,

    /// Delivery attempts before a rejected block is skipped (default: 8)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Reader sleep at end-of-log (default: 1 s)
    #[serde(default = "default_poll_eof_sleep", with = "duration_ms")]
    pub poll_eof_sleep: Duration,

    /// Persist the cursor every N replayed blocks (default: 100)
    #[serde(default = "default_dump_per_blocks")]
    pub dump_per_blocks: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            dirs: vec![PathBuf::from("hh")],
            max_segment_bytes: default_segment_bytes(),
            purge_interval: default_purge_interval(),
            max_age: default_max_age(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            max_retries: default_max_retries(),
            poll_eof_sleep: default_poll_eof_sleep(),
            dump_per_blocks: default_dump_per_blocks(),
        }
    }
}

impl HandoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dirs.is_empty() {
            return Err(HandoffError::Config("no data dirs configured".into()));
        }
        if self.max_segment_bytes == 0 {
            return Err(HandoffError::Config("max_segment_bytes must be > 0".into()));
        }
        if self.initial_backoff.is_zero() || self.max_backoff < self.initial_backoff {
            return Err(HandoffError::Config(
                "backoff range must satisfy 0 < initial <= max".into(),
            ));
        }
        if self.dump_per_blocks == 0 {
            return Err(HandoffError::Config("dump_per_blocks must be > 0".into()));
        }
        Ok(())
    }
}

fn default_segment_bytes() -> u64 {
    10 << 20 // 10 MiB
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_max_age() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(31)
}

fn default_max_retries() -> u32 {
    8
}

fn default_poll_eof_sleep() -> Duration {
    Duration::from_secs(1)
}

fn default_dump_per_blocks() -> u64 {
    100
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = HandoffConfig::default();
        assert_eq!(cfg.max_segment_bytes, 10 << 20);
        assert_eq!(cfg.purge_interval, Duration::from_secs(600));
        assert_eq!(cfg.max_age, Duration::from_secs(604_800));
        assert_eq!(cfg.initial_backoff, Duration::from_millis(200));
        assert_eq!(cfg.max_backoff, Duration::from_secs(31));
        assert_eq!(cfg.max_retries, 8);
        assert_eq!(cfg.poll_eof_sleep, Duration::from_secs(1));
        assert_eq!(cfg.dump_per_blocks, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_dirs() {
        let cfg = HandoffConfig {
            dirs: vec![],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let cfg = HandoffConfig {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let cfg = HandoffConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let parsed: HandoffConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.max_segment_bytes, cfg.max_segment_bytes);
        assert_eq!(parsed.initial_backoff, cfg.initial_backoff);
    }
}
