// =============================================================================
// Token-Bucket Rate Limiter — continuous refill, per-category composition
// =============================================================================
//
// One bucket per venue API category ("orders", "market", "account"). Refill
// happens lazily on every operation: tokens accrue at `rate` per second and
// cap at `burst`. All waiting is done on the tokio clock, so tests drive
// the limiter deterministically under a paused runtime.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Default refill rate in tokens per second.
pub const DEFAULT_RATE: f64 = 10.0;

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

struct Inner {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    burst: f64,
}

impl Inner {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

/// Continuous-refill token bucket. Safe for concurrent use.
pub struct TokenBucket {
    inner: Mutex<Inner>,
}

impl TokenBucket {
    /// Create a bucket with an explicit rate and burst capacity.
    pub fn new(rate: f64, burst: f64) -> Self {
        let rate = rate.max(f64::MIN_POSITIVE);
        let burst = burst.max(1.0);
        Self {
            inner: Mutex::new(Inner {
                tokens: burst,
                last_refill: Instant::now(),
                rate,
                burst,
            }),
        }
    }

    /// Create a bucket from a rate alone; burst defaults to `2 * rate`.
    pub fn with_rate(rate: f64) -> Self {
        Self::new(rate, rate.max(2.0 * rate))
    }

    /// Atomically take one token if available. Never waits.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.refill(Instant::now());
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, sleeping until the bucket refills. Returns
    /// `cancelled` if the token is revoked while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let wait = {
                let mut inner = self.inner.lock();
                inner.refill(Instant::now());
                if inner.tokens >= 1.0 {
                    inner.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - inner.tokens) / inner.rate)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Take `n` tokens serially. Intended for small `n` (at most the burst
    /// in practice).
    pub async fn acquire_n(&self, n: u32, cancel: &CancellationToken) -> Result<()> {
        for _ in 0..n {
            self.acquire(cancel).await?;
        }
        Ok(())
    }

    /// Take one token immediately, allowing the balance to go negative.
    /// The returned reservation reports how long the caller should wait
    /// before acting on it.
    pub fn reserve(&self) -> Reservation<'_> {
        let mut inner = self.inner.lock();
        inner.refill(Instant::now());
        inner.tokens -= 1.0;
        let delay = if inner.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-inner.tokens / inner.rate)
        };
        Reservation {
            bucket: self,
            delay,
        }
    }

    /// Change the refill rate. Accrued tokens are settled first.
    pub fn set_rate(&self, rate: f64) {
        let mut inner = self.inner.lock();
        inner.refill(Instant::now());
        inner.rate = rate.max(f64::MIN_POSITIVE);
    }

    /// Change the burst capacity. Accrued tokens are settled first, then
    /// clamped to the new cap.
    pub fn set_burst(&self, burst: f64) {
        let mut inner = self.inner.lock();
        inner.refill(Instant::now());
        inner.burst = burst.max(1.0);
        inner.tokens = inner.tokens.min(inner.burst);
    }

    /// Current token balance after settling refill. Primarily for tests
    /// and diagnostics.
    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock();
        inner.refill(Instant::now());
        inner.tokens
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::with_rate(DEFAULT_RATE)
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TokenBucket")
            .field("tokens", &inner.tokens)
            .field("rate", &inner.rate)
            .field("burst", &inner.burst)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

/// A token taken in advance. Cancelling returns the token (clamped to the
/// bucket's burst).
pub struct Reservation<'a> {
    bucket: &'a TokenBucket,
    delay: Duration,
}

impl Reservation<'_> {
    /// How long the holder must wait before the reserved token is covered
    /// by refill. Zero when the bucket had capacity.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Give the token back.
    pub fn cancel(self) {
        let mut inner = self.bucket.inner.lock();
        inner.refill(Instant::now());
        inner.tokens = (inner.tokens + 1.0).min(inner.burst);
    }
}

// ---------------------------------------------------------------------------
// CompositeLimiter
// ---------------------------------------------------------------------------

/// Category name buckets fall back to when their own is missing.
const FALLBACK_CATEGORY: &str = "default";

/// A map of category name to bucket. An unknown category with no default
/// bucket is unlimited.
pub struct CompositeLimiter {
    buckets: HashMap<String, TokenBucket>,
}

impl CompositeLimiter {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    pub fn with_bucket(mut self, category: &str, bucket: TokenBucket) -> Self {
        self.buckets.insert(category.to_string(), bucket);
        self
    }

    fn lookup(&self, category: &str) -> Option<&TokenBucket> {
        self.buckets
            .get(category)
            .or_else(|| self.buckets.get(FALLBACK_CATEGORY))
    }

    /// Acquire one token from the category's bucket (or the default
    /// bucket). Unlimited when neither exists.
    pub async fn acquire(&self, category: &str, cancel: &CancellationToken) -> Result<()> {
        match self.lookup(category) {
            Some(bucket) => bucket.acquire(cancel).await,
            None => {
                debug!(category, "no bucket configured — unlimited");
                Ok(())
            }
        }
    }

    /// Non-blocking variant. Unlimited categories always succeed.
    pub fn try_acquire(&self, category: &str) -> bool {
        match self.lookup(category) {
            Some(bucket) => bucket.try_acquire(),
            None => true,
        }
    }
}

impl Default for CompositeLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_drains_then_refills() {
        let bucket = TokenBucket::new(10.0, 10.0);
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        // After one second the bucket has recovered the full rate's worth.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((bucket.available() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_clamps_to_burst() {
        let bucket = TokenBucket::new(10.0, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((bucket.available() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_acquires_take_one_second() {
        // Scenario: rate 10, burst 10, 20 sequential acquires. The first
        // ten are free; the next ten wait 100 ms each.
        let bucket = TokenBucket::new(10.0, 10.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..20 {
            bucket.acquire(&cancel).await.unwrap();
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_respects_cancellation() {
        let bucket = Arc::new(TokenBucket::new(1.0, 1.0));
        assert!(bucket.try_acquire());

        let cancel = CancellationToken::new();
        let waiter = {
            let bucket = bucket.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bucket.acquire(&cancel).await })
        };

        tokio::time::advance(Duration::from_millis(10)).await;
        cancel.cancel();
        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(EngineError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_goes_negative_and_cancel_returns_token() {
        let bucket = TokenBucket::new(10.0, 1.0);
        assert!(bucket.try_acquire());

        let reservation = bucket.reserve();
        assert!(reservation.delay() > Duration::ZERO);
        assert!(bucket.available() < 0.0);

        reservation.cancel();
        assert!(bucket.available() >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_change_clamps_tokens() {
        let bucket = TokenBucket::new(10.0, 10.0);
        bucket.set_burst(3.0);
        assert!((bucket.available() - 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn composite_unknown_category_is_unlimited() {
        let limiter = CompositeLimiter::new().with_bucket("orders", TokenBucket::new(1.0, 1.0));
        let cancel = CancellationToken::new();

        // Unknown category, no default bucket: always allowed.
        for _ in 0..100 {
            limiter.acquire("market", &cancel).await.unwrap();
        }

        // Known category drains normally.
        assert!(limiter.try_acquire("orders"));
        assert!(!limiter.try_acquire("orders"));
    }

    #[tokio::test(start_paused = true)]
    async fn composite_falls_back_to_default_bucket() {
        let limiter = CompositeLimiter::new().with_bucket("default", TokenBucket::new(1.0, 1.0));
        assert!(limiter.try_acquire("anything"));
        assert!(!limiter.try_acquire("anything"));
    }
}
