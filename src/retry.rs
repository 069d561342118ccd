// =============================================================================
// Retry Coordinator — exponential backoff with jitter and error classing
// =============================================================================
//
// An operation runs up to `max_retries` times. Errors classified permanent
// short-circuit immediately; transient ones sleep
// `min(max_delay, initial * multiplier^attempt) * (1 ± jitter)` and try
// again. Cancellation interrupts the sleep and surfaces as `cancelled`.
//
// The venue gateway picks a preset per call kind: order placement retries
// aggressively, cancels tolerate flaky networks, reads back off politely.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Backoff parameters. Construct via the presets or struct literal update.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Uniform jitter factor applied multiplicatively, e.g. 0.1 for ±10 %.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Baseline: 4 attempts from 100 ms, doubling, capped at 30 s, ±10 %.
    pub fn standard() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Fast and persistent, for order placement.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 6,
            initial_delay: Duration::from_millis(50),
            ..Self::standard()
        }
    }

    /// Few, widely spaced attempts, for read paths.
    pub fn conservative() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            ..Self::standard()
        }
    }

    /// Tolerant of lossy links, for cancels and liveness probes.
    pub fn network() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_secs(1),
            jitter: 0.2,
            ..Self::standard()
        }
    }

    /// Jittered backoff before attempt `attempt + 1`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((capped * (1.0 + spread)).max(0.0))
    }

    /// Run `op` under this policy.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_hook(cancel, op, |_, _, _| {}).await
    }

    /// Like [`execute`](Self::execute), invoking `on_retry(attempt, err,
    /// delay)` before each backoff sleep.
    pub async fn execute_with_hook<T, F, Fut, H>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: H,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        H: FnMut(u32, &EngineError, Duration),
    {
        let attempts = self.max_retries.max(1);
        let mut last_err = EngineError::Cancelled;

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_permanent() => {
                    debug!(attempt, error = %err, "permanent error — not retrying");
                    return Err(err);
                }
                Err(err) => {
                    if attempt + 1 == attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "transient error — backing off");
                    on_retry(attempt, &err, delay);
                    last_err = err;

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Err(last_err)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting_op(
        calls: Arc<AtomicU32>,
        fail_first: u32,
    ) -> impl FnMut() -> std::future::Ready<Result<u32>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < fail_first {
                std::future::ready(Err(EngineError::Network("flap".into())))
            } else {
                std::future::ready(Ok(n))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::standard();
        let cancel = CancellationToken::new();

        let out = policy
            .execute(&cancel, counting_op(calls.clone(), 2))
            .await
            .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_max_retries_invocations() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::standard();
        let cancel = CancellationToken::new();

        let out = policy
            .execute(&cancel, counting_op(calls.clone(), 100))
            .await;
        assert!(matches!(out, Err(EngineError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), policy.max_retries);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::aggressive();
        let cancel = CancellationToken::new();

        let calls2 = calls.clone();
        let out: Result<()> = policy
            .execute(&cancel, move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(EngineError::Auth("bad key".into())))
            })
            .await;

        assert!(matches!(out, Err(EngineError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::network();
        let cancel = CancellationToken::new();

        let handle = {
            let policy = policy.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                policy
                    .execute::<(), _, _>(&cancel, || {
                        std::future::ready(Err(EngineError::Timeout("slow".into())))
                    })
                    .await
            })
        };

        tokio::time::advance(Duration::from_millis(10)).await;
        cancel.cancel();
        let out = handle.await.unwrap();
        assert!(matches!(out, Err(EngineError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn hook_sees_each_backoff() {
        let policy = RetryPolicy::standard();
        let cancel = CancellationToken::new();
        let mut observed: Vec<(u32, Duration)> = Vec::new();

        let _ = policy
            .execute_with_hook::<(), _, _, _>(
                &cancel,
                || std::future::ready(Err(EngineError::Network("down".into()))),
                |attempt, _err, delay| observed.push((attempt, delay)),
            )
            .await;

        // max_retries attempts means max_retries - 1 sleeps.
        assert_eq!(observed.len(), (policy.max_retries - 1) as usize);

        // Jitter keeps each delay within ±10 % of the exponential base.
        for (attempt, delay) in observed {
            let base = 0.1 * 2f64.powi(attempt as i32);
            assert!(delay.as_secs_f64() >= base * 0.9 - 1e-9);
            assert!(delay.as_secs_f64() <= base * 1.1 + 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delay_caps_at_max() {
        let policy = RetryPolicy {
            max_retries: 12,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        };
        // attempt 4 would be 160 s uncapped.
        assert_eq!(policy.delay_for(4), Duration::from_secs(30));
    }
}
