//! Token bucket rate limiter.
//!
//! A bucket holds up to `burst` tokens (one token per byte) and refills
//! continuously at `rate` tokens per second. `consume(n)` suspends the
//! caller until `n` tokens are available and then debits them.
//!
//! The bucket state lives behind a `tokio::sync::Mutex`, which hands the lock
//! out in FIFO order. A waiter keeps the lock while it sleeps for its deficit,
//! so concurrent callers are admitted in arrival order and the token count
//! never goes negative.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// A token bucket shared by reference between transfer tasks.
#[derive(Debug)]
pub struct TokenBucket {
    /// Refill rate in bytes per second
    rate: u64,
    /// Bucket capacity in bytes
    burst: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, rate: f64, burst: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }
}

impl TokenBucket {
    /// Create a bucket that starts full.
    ///
    /// A zero burst is raised to the rate, and at least one byte.
    pub fn new(rate: u64, burst: u64) -> Self {
        let burst = if burst == 0 { rate.max(1) } else { burst };
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until `n` tokens are available and take them.
    ///
    /// Requests larger than the burst are split into sub-requests of at most
    /// `burst` tokens, each admitted separately.
    pub async fn consume(&self, n: u64) {
        if self.rate == 0 {
            return;
        }

        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(self.burst);
            self.consume_chunk(chunk).await;
            remaining -= chunk;
        }
    }

    async fn consume_chunk(&self, n: u64) {
        let rate = self.rate as f64;
        let burst = self.burst as f64;
        let needed = n as f64;

        let mut state = self.state.lock().await;
        state.refill(rate, burst);

        if state.tokens < needed {
            let deficit = needed - state.tokens;
            let wait = Duration::from_secs_f64(deficit / rate);
            trace!(tokens = n, wait_us = wait.as_micros() as u64, "Waiting for tokens");
            tokio::time::sleep(wait).await;
            state.refill(rate, burst);
        }

        // Sleep granularity can leave us a hair short; never go below zero.
        state.tokens = (state.tokens - needed).max(0.0);
    }

    /// Tokens currently available, after refilling.
    #[cfg(test)]
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(self.rate as f64, self.burst as f64);
        state.tokens
    }
}

/// How limiters are handed to new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPolicy {
    /// One bucket caps the aggregate throughput of every session
    Shared,
    /// Each session gets its own bucket
    PerClient,
}

/// Chooses the limiter for each accepted connection.
#[derive(Debug, Clone)]
pub struct Limiter {
    rate: u64,
    burst: u64,
    policy: LimitPolicy,
    shared: Option<Arc<TokenBucket>>,
}

impl Limiter {
    pub fn new(rate: u64, burst: u64, policy: LimitPolicy) -> Self {
        let shared = (rate > 0 && policy == LimitPolicy::Shared)
            .then(|| Arc::new(TokenBucket::new(rate, burst)));
        Self {
            rate,
            burst,
            policy,
            shared,
        }
    }

    pub fn policy(&self) -> LimitPolicy {
        self.policy
    }

    /// Bucket for a newly accepted connection, `None` when unlimited.
    pub fn for_session(&self) -> Option<Arc<TokenBucket>> {
        if self.rate == 0 {
            return None;
        }
        match self.policy {
            LimitPolicy::Shared => self.shared.clone(),
            LimitPolicy::PerClient => Some(Arc::new(TokenBucket::new(self.rate, self.burst))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_immediate() {
        let bucket = TokenBucket::new(1000, 1000);
        let start = Instant::now();
        bucket.consume(1000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_waits_for_deficit() {
        let bucket = TokenBucket::new(1000, 1000);
        bucket.consume(1000).await;

        let start = Instant::now();
        bucket.consume(500).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(499), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(510), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_request_is_split_by_burst() {
        let bucket = TokenBucket::new(1000, 100);
        let start = Instant::now();
        // 100 from the full bucket, then 900 more at 1000 B/s.
        bucket.consume(1000).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(899), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(950), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_capped_at_burst() {
        let bucket = TokenBucket::new(1000, 200);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bucket.available().await, 200.0);

        bucket.consume(200).await;
        assert!(bucket.available().await >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_rate_bounded() {
        let bucket = TokenBucket::new(10_000, 1_000);
        let start = Instant::now();
        let mut sent = 0u64;
        while start.elapsed() < Duration::from_secs(10) {
            bucket.consume(700).await;
            sent += 700;
        }
        let secs = start.elapsed().as_secs_f64();
        assert!(sent as f64 <= 10_000.0 * secs + 1_000.0 + 700.0, "sent {sent} in {secs}s");
    }

    #[tokio::test]
    async fn test_zero_rate_never_blocks() {
        let bucket = TokenBucket::new(0, 0);
        let mut fut = task::spawn(bucket.consume(u64::MAX));
        assert_ready!(fut.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_bucket_is_pending() {
        let bucket = TokenBucket::new(10, 10);
        bucket.consume(10).await;
        let mut fut = task::spawn(bucket.consume(5));
        assert_pending!(fut.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_policy_reuses_bucket() {
        let limiter = Limiter::new(1000, 1000, LimitPolicy::Shared);
        let a = limiter.for_session().unwrap();
        let b = limiter.for_session().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // Two sessions draining one bucket share its rate.
        let start = Instant::now();
        tokio::join!(a.consume(1000), b.consume(1000));
        assert!(start.elapsed() >= Duration::from_millis(999));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_client_policy_isolates_buckets() {
        let limiter = Limiter::new(1000, 1000, LimitPolicy::PerClient);
        let a = limiter.for_session().unwrap();
        let b = limiter.for_session().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        let start = Instant::now();
        tokio::join!(a.consume(1000), b.consume(1000));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_unlimited_hands_out_nothing() {
        assert!(Limiter::new(0, 0, LimitPolicy::Shared).for_session().is_none());
        assert!(Limiter::new(0, 100, LimitPolicy::PerClient)
            .for_session()
            .is_none());
    }
}
