// =============================================================================
// Venue Adapter Contract — the uniform surface every venue must provide
// =============================================================================
//
// Adapters are thin wire-protocol translators. Everything operational
// (rate limiting, retries, credential decryption, error metrics) lives in
// the gateway wrapper; adapters only speak their venue's dialect and map
// its errors onto the engine's semantic kinds.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{BookLevel, Side};

/// Decrypted credentials, alive only for the duration of one call.
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for VenueCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// An order as the engine wants it placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    /// None means a market order.
    pub price: Option<f64>,
    /// Only reduces an existing position; used for every unwind path.
    pub reduce_only: bool,
    /// Resent unchanged on retries so the venue can deduplicate.
    pub idempotency_key: String,
}

/// Venue acknowledgement of a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub filled_qty: f64,
    pub avg_price: f64,
}

/// Outcome of a cancel attempt. A cancel racing a fill is not an error;
/// the engine needs to know which way the race went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFilled,
}

/// Snapshot of one venue's book: bids descending, asks ascending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Mid-price, when both sides have depth.
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((a + b) / 2.0),
            _ => None,
        }
    }
}

/// Free and total balance of one asset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub available: f64,
    pub total: f64,
}

/// Per-symbol venue metadata fetched at connect time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolMeta {
    /// Quantity quantum for orders.
    pub lot_step: f64,
    /// Maker fee as a fraction (0.0002 = 2 bps).
    pub maker_fee: f64,
    /// Taker fee as a fraction.
    pub taker_fee: f64,
}

impl Default for SymbolMeta {
    fn default() -> Self {
        // Conservative fallback when a venue does not publish metadata.
        Self {
            lot_step: 0.001,
            maker_fee: 0.0004,
            taker_fee: 0.0004,
        }
    }
}

/// The uniform venue contract.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(
        &self,
        creds: &VenueCredentials,
        req: &OrderRequest,
    ) -> Result<OrderAck>;

    async fn cancel_order(
        &self,
        creds: &VenueCredentials,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome>;

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook>;

    async fn balance(&self, creds: &VenueCredentials, asset: &str) -> Result<AssetBalance>;

    async fn symbol_meta(&self, symbol: &str) -> Result<SymbolMeta>;

    async fn ping(&self) -> Result<()>;
}
