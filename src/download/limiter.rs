//! Token-bucket rate limiter for outbound requests.
//!
//! One limiter is shared across all download workers, so effective request
//! admission is bounded by the configured requests-per-minute regardless of
//! worker count. `acquire()` suspends until a token is available; it never
//! fails or times out.

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::trace;

/// The rolling window over which the bucket refills.
const WINDOW: Duration = Duration::from_secs(60);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: `requests_per_minute` operations per rolling 60-second
/// window, refilled continuously.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let capacity = f64::from(requests_per_minute.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / WINDOW.as_secs_f64(),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, suspending until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - bucket.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            trace!(?wait, "rate limiter saturated");
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity_immediately() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn delays_once_bucket_is_empty() {
        let limiter = RateLimiter::new(60); // one token per second
        for _ in 0..60 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        limiter.acquire().await;
        // Under paused time the sleep advances the clock by the deficit.
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_the_window() {
        let limiter = RateLimiter::new(60);
        for _ in 0..60 {
            limiter.acquire().await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        // Ten seconds back at one token per second.
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
