//! Token-aware rate limiting
//!
//! One token bucket per provider, refilled continuously at `limit / 60` tokens per
//! second up to `limit`. Each bucket also keeps a 60 second usage window that feeds
//! the response telemetry headers.

use crate::error::{GatewayError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Length of the usage window
pub const USAGE_WINDOW: Duration = Duration::from_secs(60);

/// Shortest sleep between admission attempts
pub const MIN_WAIT: Duration = Duration::from_millis(10);

/// Outcome of a single admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Tokens were deducted
    Granted,
    /// Not enough tokens; retry after this long
    Wait(Duration),
}

/// Usage in the trailing window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Tokens consumed in the last 60 seconds
    pub used: u64,
    /// Remaining headroom under the per-minute limit
    pub available: u64,
}

/// Per-provider token bucket rate limiter
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or resize a bucket without consuming tokens
    pub fn register_limit(&self, key: &str, limit_per_minute: u64) {
        if limit_per_minute == 0 {
            return;
        }
        let bucket = self.bucket(key, limit_per_minute);
        bucket.lock().set_capacity(limit_per_minute);
    }

    /// Wait until `tokens` can be deducted from the bucket for `key`
    ///
    /// Returns immediately when the limit is zero, no tokens are requested, or the
    /// request could never fit under the limit. Cancelling `cancel` aborts the wait
    /// with [`GatewayError::Cancelled`].
    pub async fn wait_for_tokens(
        &self,
        key: &str,
        limit_per_minute: u64,
        tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            match self.try_acquire(key, limit_per_minute, tokens) {
                Admission::Granted => return Ok(()),
                Admission::Wait(wait) => {
                    debug!(provider = %key, tokens, wait_ms = wait.as_millis() as u64, "Waiting for rate limit tokens");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Single admission attempt: refill, then deduct or report the wait
    pub fn try_acquire(&self, key: &str, limit_per_minute: u64, tokens: u64) -> Admission {
        if limit_per_minute == 0 || tokens == 0 || tokens > limit_per_minute {
            return Admission::Granted;
        }

        let bucket = self.bucket(key, limit_per_minute);
        let mut bucket = bucket.lock();
        bucket.set_capacity(limit_per_minute);

        let now = Instant::now();
        let admission = bucket.try_consume(tokens, now);
        if admission == Admission::Granted {
            let usage = bucket.snapshot(now);
            debug!(
                provider = %key,
                tokens,
                used = usage.used,
                limit = limit_per_minute,
                "Rate limit tokens consumed"
            );
        }
        admission
    }

    /// Usage in the trailing window, `None` for keys never seen
    pub fn usage_snapshot(&self, key: &str) -> Option<UsageSnapshot> {
        let bucket = self.buckets.get(key)?.clone();
        let snapshot = bucket.lock().snapshot(Instant::now());
        Some(snapshot)
    }

    fn bucket(&self, key: &str, limit_per_minute: u64) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.clone();
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(provider = %key, limit = limit_per_minute, "Creating token bucket");
                Arc::new(Mutex::new(TokenBucket::new(limit_per_minute, Instant::now())))
            })
            .clone()
    }
}

/// Token bucket with a sliding usage window
struct TokenBucket {
    capacity: f64,
    available: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    window: VecDeque<(Instant, u64)>,
    used_in_window: u64,
}

impl TokenBucket {
    /// New buckets start full
    fn new(limit_per_minute: u64, now: Instant) -> Self {
        let capacity = limit_per_minute as f64;
        Self {
            capacity,
            available: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
            window: VecDeque::new(),
            used_in_window: 0,
        }
    }

    fn set_capacity(&mut self, limit_per_minute: u64) {
        let capacity = limit_per_minute as f64;
        if capacity != self.capacity {
            self.capacity = capacity;
            self.refill_per_sec = capacity / 60.0;
            self.available = self.available.min(capacity);
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, tokens: u64, now: Instant) -> Admission {
        self.refill(now);

        let needed = tokens as f64;
        if self.available >= needed {
            self.available -= needed;
            self.window.push_back((now, tokens));
            self.used_in_window += tokens;
            return Admission::Granted;
        }

        let deficit = needed - self.available;
        let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
        Admission::Wait(wait.max(MIN_WAIT))
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, tokens)) = self.window.front() {
            if now.saturating_duration_since(at) < USAGE_WINDOW {
                break;
            }
            self.window.pop_front();
            self.used_in_window -= tokens;
        }
    }

    fn snapshot(&mut self, now: Instant) -> UsageSnapshot {
        self.prune(now);
        let limit = self.capacity as u64;
        UsageSnapshot {
            used: self.used_in_window,
            available: limit.saturating_sub(self.used_in_window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_full_bucket_admits_immediately() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.try_acquire("openai", 60, 60), Admission::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_bucket_computes_wait() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.try_acquire("openai", 60, 60), Admission::Granted);

        match limiter.try_acquire("openai", 60, 60) {
            Admission::Wait(wait) => {
                let secs = wait.as_secs_f64();
                assert!((secs - 60.0).abs() < 0.01, "wait was {}", secs);
            }
            Admission::Granted => panic!("drained bucket admitted request"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tokens_sleeps_for_refill() {
        let limiter = RateLimiter::new();
        let cancel = CancellationToken::new();

        limiter.wait_for_tokens("openai", 60, 60, &cancel).await.unwrap();

        let start = Instant::now();
        limiter.wait_for_tokens("openai", 60, 60, &cancel).await.unwrap();
        let waited = start.elapsed().as_secs_f64();
        assert!((59.9..=60.1).contains(&waited), "waited {}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refill() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.try_acquire("p", 60, 60), Admission::Granted);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(limiter.try_acquire("p", 60, 30), Admission::Granted);
        assert!(matches!(limiter.try_acquire("p", 60, 1), Admission::Wait(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_wait() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.try_acquire("p", 6000, 6000), Admission::Granted);
        // 100 tokens/sec: one token refills in 10ms, a fraction in less
        tokio::time::advance(Duration::from_millis(9)).await;
        match limiter.try_acquire("p", 6000, 1) {
            Admission::Wait(wait) => assert_eq!(wait, MIN_WAIT),
            Admission::Granted => panic!("expected wait"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_escape_valve_and_no_ops() {
        let limiter = RateLimiter::new();
        let cancel = CancellationToken::new();
        assert_eq!(limiter.try_acquire("p", 60, 60), Admission::Granted);

        // Larger than the limit: admitted regardless of the drained bucket
        assert_eq!(limiter.try_acquire("p", 60, 61), Admission::Granted);
        assert_eq!(limiter.try_acquire("p", 60, 0), Admission::Granted);
        assert_eq!(limiter.try_acquire("unlimited", 0, 1_000), Admission::Granted);
        limiter.wait_for_tokens("p", 60, 500, &cancel).await.unwrap();

        assert!(limiter.usage_snapshot("unlimited").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_wait() {
        let limiter = Arc::new(RateLimiter::new());
        let cancel = CancellationToken::new();
        assert_eq!(limiter.try_acquire("p", 60, 60), Admission::Granted);

        let task = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait_for_tokens("p", 60, 30, &cancel).await })
        };

        tokio::time::advance(Duration::from_secs(1)).await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Cancelled)));
    }

    #[test]
    fn test_concurrent_acquires_never_overdraw() {
        let limiter = Arc::new(RateLimiter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.try_acquire("p", 100, 40))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| *a == Admission::Granted)
            .count();
        assert_eq!(admitted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_window_expires() {
        let limiter = RateLimiter::new();
        limiter.register_limit("p", 100);
        assert_eq!(
            limiter.usage_snapshot("p"),
            Some(UsageSnapshot { used: 0, available: 100 })
        );

        assert_eq!(limiter.try_acquire("p", 100, 25), Admission::Granted);
        assert_eq!(
            limiter.usage_snapshot("p"),
            Some(UsageSnapshot { used: 25, available: 75 })
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            limiter.usage_snapshot("p"),
            Some(UsageSnapshot { used: 0, available: 100 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_limit_resizes_bucket() {
        let limiter = RateLimiter::new();
        limiter.register_limit("p", 100);
        limiter.register_limit("p", 10);

        assert!(matches!(limiter.try_acquire("p", 10, 10), Admission::Granted));
        assert_eq!(limiter.usage_snapshot("p").unwrap().available, 0);
    }
}
