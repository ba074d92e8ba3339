//! Global token bucket for provider calls.
//!
//! One bucket is shared by every caller in the process. A provider 429 pauses
//! the whole bucket, not just the caller that hit it.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    paused_until: Option<Instant>,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A full bucket refilling at `calls_per_sec`, holding at most `burst`.
    pub fn new(calls_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: calls_per_sec.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
                paused_until: None,
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.calls_per_sec, config.burst)
    }

    /// Wait until one call may be issued, then consume a token.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();

                match bucket.paused_until {
                    Some(until) if until > now => until - now,
                    _ => {
                        bucket.paused_until = None;
                        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                        bucket.last_refill = now;

                        if bucket.tokens >= 1.0 {
                            bucket.tokens -= 1.0;
                            return;
                        }
                        Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
                    }
                }
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Stop handing out tokens for `pause`. Overlapping pauses keep the later
    /// deadline.
    pub async fn penalize(&self, pause: Duration) {
        let mut bucket = self.bucket.lock().await;
        let until = Instant::now() + pause;
        if bucket.paused_until.is_none_or(|current| current < until) {
            bucket.paused_until = Some(until);
        }
        bucket.tokens = 0.0;
    }

    /// Tokens currently available, for diagnostics.
    pub async fn available(&self) -> f64 {
        self.bucket.lock().await.tokens
    }
}
