//! Token-bucket bandwidth throttle shared by all transfers of a coordinator.
//!
//! Tokens are bytes. A request larger than the bucket is admitted once the
//! bucket is full and leaves it in debt, so large snapshot blobs are paced
//! instead of rejected. A wait abandoned part way, as when its transfer is
//! cancelled, hands the unspent part of the debt back.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Byte-rate throttle. A rate of 0 disables throttling.
#[derive(Debug)]
pub struct Throttle {
    rate: u64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl Throttle {
    /// Throttle to `bytes_per_sec` with a one second burst.
    pub fn new(bytes_per_sec: u64) -> Self {
        let capacity = bytes_per_sec as f64;
        Self {
            rate: bytes_per_sec,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A throttle that never waits.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Configured rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Whether throttling is disabled.
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Reserve `bytes` and return how long the caller must wait before
    /// sending them.
    pub fn reserve(&self, bytes: u64) -> Duration {
        if self.is_unlimited() || bytes == 0 {
            return Duration::ZERO;
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate as f64).min(self.capacity);
        bucket.last_refill = now;

        bucket.tokens -= bytes as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.rate as f64)
        }
    }

    /// Wait until `bytes` may be sent. Returns the time waited.
    pub async fn acquire(&self, bytes: u64) -> Duration {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            let pending = Pending {
                throttle: self,
                bytes,
                deadline: Instant::now() + wait,
                done: false,
            };
            tokio::time::sleep(wait).await;
            pending.finish();
        }
        wait
    }

    fn refund(&self, tokens: f64) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = (bucket.tokens + tokens).min(self.capacity);
    }
}

/// A reservation still being waited out. Dropped early, it returns the
/// tokens the bucket has not yet refilled.
struct Pending<'a> {
    throttle: &'a Throttle,
    bytes: u64,
    deadline: Instant,
    done: bool,
}

impl Pending<'_> {
    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let left = self.deadline.saturating_duration_since(Instant::now());
        let unspent = (left.as_secs_f64() * self.throttle.rate as f64).min(self.bytes as f64);
        self.throttle.refund(unspent);
    }
}
