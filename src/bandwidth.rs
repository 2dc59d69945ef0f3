//! # Bandwidth Throttling
//!
//! Token-bucket rate limiting applied by the transfer engine to file bodies.
//! Upload and download limits are independent; `None` disables throttling for
//! that direction.
//!
//! ```rust,no_run
//! use treesync::bandwidth::BandwidthManager;
//!
//! async fn throttled() {
//!     let manager = BandwidthManager::new(Some(1_048_576), None); // 1MB/s up
//!     manager.request_upload_quota(64 * 1024).await;
//! }
//! ```

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: f64, // tokens per second
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let rate = rate_bytes_per_sec.max(1);
        let capacity = rate.max(1024); // Minimum 1KB burst
        Self {
            capacity,
            refill_rate: rate as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until `bytes` tokens have been consumed.
    ///
    /// Requests larger than the bucket are drained in capacity-sized slices.
    pub async fn consume(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let slice = remaining.min(self.capacity);
            self.consume_slice(slice).await;
            remaining -= slice;
        }
    }

    async fn consume_slice(&self, bytes: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= bytes as f64 {
                    state.tokens -= bytes as f64;
                    return;
                }
                let needed = bytes as f64 - state.tokens;
                Duration::from_secs_f64(needed / self.refill_rate)
            };

            debug!("Waiting {:?} for {} bytes of bandwidth quota", wait, bytes);
            sleep(wait.min(Duration::from_millis(100))).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity as f64);
        state.last_refill = now;
    }
}

/// Bytes moved through a manager since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthStats {
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

/// Upload/download throttles shared by every transfer on a connection.
#[derive(Debug, Default)]
pub struct BandwidthManager {
    upload_bucket: Option<TokenBucket>,
    download_bucket: Option<TokenBucket>,
    stats: Mutex<BandwidthStats>,
}

impl BandwidthManager {
    /// Limits are in bytes per second. `None` or `Some(0)` means unlimited.
    pub fn new(upload_limit: Option<u64>, download_limit: Option<u64>) -> Self {
        Self {
            upload_bucket: upload_limit.filter(|l| *l > 0).map(TokenBucket::new),
            download_bucket: download_limit.filter(|l| *l > 0).map(TokenBucket::new),
            stats: Mutex::new(BandwidthStats::default()),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub async fn request_upload_quota(&self, bytes: u64) {
        if let Some(bucket) = &self.upload_bucket {
            bucket.consume(bytes).await;
        }
        self.stats.lock().bytes_uploaded += bytes;
    }

    pub async fn request_download_quota(&self, bytes: u64) {
        if let Some(bucket) = &self.download_bucket {
            bucket.consume(bytes).await;
        }
        self.stats.lock().bytes_downloaded += bytes;
    }

    pub fn get_stats(&self) -> BandwidthStats {
        *self.stats.lock()
    }
}
