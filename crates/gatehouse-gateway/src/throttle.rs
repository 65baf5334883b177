//! Bad-Group Throttle
//!
//! A per-key leaky bucket limiting how fast a client can hammer the
//! subscribe surface with unknown consumer groups. Each key (remote
//! address) gets `capacity` tokens refilled linearly over `window`; a pour
//! with no token available is refused.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct LeakyBuckets {
    capacity: f64,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl LeakyBuckets {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity as f64,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`. Returns false when the bucket is dry.
    pub fn pour(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("buckets lock");
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let refill =
            now.duration_since(bucket.last_refill).as_secs_f64() / self.window.as_secs_f64()
                * self.capacity;
        bucket.tokens = (bucket.tokens + refill).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
