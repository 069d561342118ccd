// =============================================================================
// Venue Gateway — rate-limited, retried, credential-guarded venue access
// =============================================================================
//
// Every adapter call goes through the same composition:
//   1. take a token from the per-category bucket ("orders" | "market" |
//      "account"), falling back to the default bucket;
//   2. decrypt stored credentials — cleartext lives on the stack for the
//      duration of the call only;
//   3. run the adapter call under the retry preset for the call kind
//      (placement: aggressive, cancel: network, reads: conservative);
//   4. record latency/outcome metrics and update the liveness signal.
//
// A panic inside an adapter is caught at this boundary and surfaced as a
// venue error; the process never dies on a misbehaving venue client.
// =============================================================================

pub mod adapter;
pub mod bybit;
pub mod paper;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::metrics::Metrics;
use crate::rate_limit::{CompositeLimiter, TokenBucket};
use crate::retry::RetryPolicy;
use crate::vault::Vault;

pub use adapter::{
    AssetBalance, CancelOutcome, OrderAck, OrderBook, OrderRequest, SymbolMeta, VenueAdapter,
    VenueCredentials,
};

/// Consecutive transient failures before the liveness signal drops.
const LIVENESS_FAILURE_THRESHOLD: u32 = 3;

/// Vault ciphertext for one venue's credentials.
#[derive(Debug, Clone)]
pub struct EncryptedCredentials {
    pub api_key_enc: String,
    pub api_secret_enc: String,
    pub passphrase_enc: Option<String>,
}

/// The operational wrapper around one venue adapter. Safe for concurrent
/// callers.
pub struct VenueGateway {
    name: String,
    adapter: Arc<dyn VenueAdapter>,
    limiter: CompositeLimiter,
    vault: Arc<Vault>,
    creds: EncryptedCredentials,
    metrics: Arc<Metrics>,
    consecutive_failures: AtomicU32,
    alive: AtomicBool,
}

impl VenueGateway {
    pub fn new(
        adapter: Arc<dyn VenueAdapter>,
        vault: Arc<Vault>,
        creds: EncryptedCredentials,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name: adapter.name().to_string(),
            adapter,
            limiter: default_limiter(),
            vault,
            creds,
            metrics,
            consecutive_failures: AtomicU32::new(0),
            alive: AtomicBool::new(true),
        }
    }

    /// Replace the default per-category buckets (tests, venue overrides).
    pub fn with_limiter(mut self, limiter: CompositeLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Liveness signal: false after repeated transient failures, restored
    /// by the next success.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    // ── Calls ───────────────────────────────────────────────────────────

    pub async fn place_order(
        &self,
        req: &OrderRequest,
        cancel: &CancellationToken,
    ) -> Result<OrderAck> {
        let creds = self.decrypt_creds()?;
        self.call("orders", "place_order", RetryPolicy::aggressive(), cancel, || {
            self.adapter.place_order(&creds, req)
        })
        .await
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CancelOutcome> {
        let creds = self.decrypt_creds()?;
        self.call("orders", "cancel_order", RetryPolicy::network(), cancel, || {
            self.adapter.cancel_order(&creds, symbol, order_id)
        })
        .await
    }

    pub async fn order_book(
        &self,
        symbol: &str,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Result<OrderBook> {
        self.call(
            "market",
            "order_book",
            RetryPolicy::conservative(),
            cancel,
            || self.adapter.order_book(symbol, depth),
        )
        .await
    }

    pub async fn balance(&self, asset: &str, cancel: &CancellationToken) -> Result<AssetBalance> {
        let creds = self.decrypt_creds()?;
        self.call("account", "balance", RetryPolicy::conservative(), cancel, || {
            self.adapter.balance(&creds, asset)
        })
        .await
    }

    pub async fn symbol_meta(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<SymbolMeta> {
        self.call(
            "market",
            "symbol_meta",
            RetryPolicy::conservative(),
            cancel,
            || self.adapter.symbol_meta(symbol),
        )
        .await
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.call("market", "ping", RetryPolicy::network(), cancel, || {
            self.adapter.ping()
        })
        .await
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn decrypt_creds(&self) -> Result<VenueCredentials> {
        let api_key = self.vault.decrypt(&self.creds.api_key_enc)?;
        let api_secret = self.vault.decrypt(&self.creds.api_secret_enc)?;
        let passphrase = match &self.creds.passphrase_enc {
            Some(enc) => Some(self.vault.decrypt(enc)?),
            None => None,
        };
        Ok(VenueCredentials {
            api_key,
            api_secret,
            passphrase,
        })
    }

    async fn call<T, F, Fut>(
        &self,
        category: &str,
        call_name: &str,
        policy: RetryPolicy,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.limiter.acquire(category, cancel).await?;

        let started = Instant::now();
        let outcome = std::panic::AssertUnwindSafe(policy.execute(cancel, &mut op))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!(venue = %self.name, call = call_name, "adapter panicked — converted to venue error");
                Err(EngineError::Venue(format!("{call_name} panicked")))
            });

        let ok = outcome.is_ok();
        self.metrics
            .record_gateway_call(&self.name, call_name, ok, started.elapsed());
        self.track_liveness(ok, call_name);
        outcome
    }

    fn track_liveness(&self, ok: bool, call_name: &str) {
        if ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            if !self.alive.swap(true, Ordering::Relaxed) {
                debug!(venue = %self.name, "venue recovered");
            }
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= LIVENESS_FAILURE_THRESHOLD && self.alive.swap(false, Ordering::Relaxed) {
                warn!(
                    venue = %self.name,
                    call = call_name,
                    failures,
                    "venue marked unhealthy after repeated failures"
                );
            }
        }
    }
}

impl std::fmt::Debug for VenueGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueGateway")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Per-category defaults sized for typical venue REST limits.
fn default_limiter() -> CompositeLimiter {
    CompositeLimiter::new()
        .with_bucket("orders", TokenBucket::new(10.0, 20.0))
        .with_bucket("market", TokenBucket::new(20.0, 40.0))
        .with_bucket("account", TokenBucket::new(5.0, 10.0))
        .with_bucket("default", TokenBucket::default())
}
