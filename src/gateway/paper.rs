// =============================================================================
// Paper Venue — deterministic simulated venue for tests and demo mode
// =============================================================================
//
// Fills are simulated by walking the scripted book with the VWAP walker, so
// slippage behaves like a real market order against the posted depth. Tests
// script failure injection (error kinds, hanging orders, cancel outcomes)
// to drive the engine's unhappy paths deterministically.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::gateway::adapter::{
    AssetBalance, CancelOutcome, OrderAck, OrderBook, OrderRequest, SymbolMeta, VenueAdapter,
    VenueCredentials,
};
use crate::math;
use crate::types::{BookLevel, Side};

struct PaperState {
    books: HashMap<String, OrderBook>,
    balances: HashMap<String, AssetBalance>,
    meta: SymbolMeta,
    // Failure injection.
    fail_remaining: u32,
    fail_with: EngineError,
    hang_remaining: u32,
    cancel_outcome: CancelOutcome,
    // Journals.
    placed: Vec<OrderRequest>,
    acks: HashMap<String, OrderAck>,
    order_attempts: u32,
    cancel_calls: u32,
    last_api_key: Option<String>,
    next_order_id: u64,
}

/// In-process venue with scripted books and failure injection.
pub struct PaperVenue {
    name: String,
    state: Mutex<PaperState>,
}

impl PaperVenue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(PaperState {
                books: HashMap::new(),
                balances: HashMap::new(),
                meta: SymbolMeta::default(),
                fail_remaining: 0,
                fail_with: EngineError::Network("paper".into()),
                hang_remaining: 0,
                cancel_outcome: CancelOutcome::Cancelled,
                placed: Vec::new(),
                acks: HashMap::new(),
                order_attempts: 0,
                cancel_calls: 0,
                last_api_key: None,
                next_order_id: 1,
            }),
        }
    }

    // ── Scripting ───────────────────────────────────────────────────────

    pub fn set_book(&self, symbol: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) {
        let book = OrderBook {
            bids: bids.iter().map(|&(p, v)| BookLevel::new(p, v)).collect(),
            asks: asks.iter().map(|&(p, v)| BookLevel::new(p, v)).collect(),
        };
        self.state.lock().books.insert(symbol.to_string(), book);
    }

    pub fn set_balance(&self, asset: &str, available: f64, total: f64) {
        self.state
            .lock()
            .balances
            .insert(asset.to_string(), AssetBalance { available, total });
    }

    pub fn set_meta(&self, meta: SymbolMeta) {
        self.state.lock().meta = meta;
    }

    /// The next `n` order placements fail with `err`.
    pub fn fail_next_orders(&self, n: u32, err: EngineError) {
        let mut s = self.state.lock();
        s.fail_remaining = n;
        s.fail_with = err;
    }

    /// The next `n` order placements hang until the caller's deadline fires.
    pub fn hang_next_orders(&self, n: u32) {
        self.state.lock().hang_remaining = n;
    }

    pub fn set_cancel_outcome(&self, outcome: CancelOutcome) {
        self.state.lock().cancel_outcome = outcome;
    }

    // ── Inspection ──────────────────────────────────────────────────────

    pub fn order_attempts(&self) -> u32 {
        self.state.lock().order_attempts
    }

    pub fn cancel_calls(&self) -> u32 {
        self.state.lock().cancel_calls
    }

    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().placed.clone()
    }

    pub fn last_api_key(&self) -> Option<String> {
        self.state.lock().last_api_key.clone()
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_order(
        &self,
        creds: &VenueCredentials,
        req: &OrderRequest,
    ) -> Result<OrderAck> {
        let hang = {
            let mut s = self.state.lock();
            s.order_attempts += 1;
            s.last_api_key = Some(creds.api_key.clone());

            if s.hang_remaining > 0 {
                s.hang_remaining -= 1;
                true
            } else {
                false
            }
        };
        if hang {
            // Pend past any realistic deadline; the caller's timeout fires.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Err(EngineError::Timeout("paper hang elapsed".into()));
        }

        let mut s = self.state.lock();
        if s.fail_remaining > 0 {
            s.fail_remaining -= 1;
            return Err(s.fail_with.clone());
        }

        // Idempotent replays return the original ack.
        if let Some(ack) = s.acks.get(&req.idempotency_key) {
            return Ok(ack.clone());
        }

        let book = s
            .books
            .get(&req.symbol)
            .cloned()
            .ok_or_else(|| EngineError::Venue(format!("no book for {}", req.symbol)))?;

        // Market-fill against the scripted depth.
        let fill = match req.side {
            Side::Long => math::vwap_buy(&book.asks, req.qty),
            Side::Short => math::vwap_sell(&book.bids, req.qty),
        };
        if fill.filled_volume <= 0.0 {
            return Err(EngineError::Venue(format!("empty book for {}", req.symbol)));
        }

        let order_id = format!("{}-{}", self.name, s.next_order_id);
        s.next_order_id += 1;

        let ack = OrderAck {
            order_id,
            filled_qty: fill.filled_volume,
            avg_price: fill.avg_price,
        };
        s.placed.push(req.clone());
        s.acks.insert(req.idempotency_key.clone(), ack.clone());
        Ok(ack)
    }

    async fn cancel_order(
        &self,
        _creds: &VenueCredentials,
        _symbol: &str,
        _order_id: &str,
    ) -> Result<CancelOutcome> {
        let mut s = self.state.lock();
        s.cancel_calls += 1;
        Ok(s.cancel_outcome)
    }

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        let s = self.state.lock();
        let book = s
            .books
            .get(symbol)
            .ok_or_else(|| EngineError::Venue(format!("no book for {symbol}")))?;
        Ok(OrderBook {
            bids: book.bids.iter().take(depth).cloned().collect(),
            asks: book.asks.iter().take(depth).cloned().collect(),
        })
    }

    async fn balance(&self, _creds: &VenueCredentials, asset: &str) -> Result<AssetBalance> {
        Ok(self
            .state
            .lock()
            .balances
            .get(asset)
            .copied()
            .unwrap_or_default())
    }

    async fn symbol_meta(&self, _symbol: &str) -> Result<SymbolMeta> {
        Ok(self.state.lock().meta)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> VenueCredentials {
        VenueCredentials {
            api_key: "k".into(),
            api_secret: "s".into(),
            passphrase: None,
        }
    }

    fn order(qty: f64, key: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty,
            price: None,
            reduce_only: false,
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn fills_at_book_vwap() {
        let venue = PaperVenue::new("paper");
        venue.set_book("BTCUSDT", &[(99.0, 1.0)], &[(100.0, 0.5), (101.0, 1.0)]);

        let ack = venue.place_order(&creds(), &order(1.0, "a")).await.unwrap();
        assert!((ack.filled_qty - 1.0).abs() < 1e-9);
        assert!((ack.avg_price - 100.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn idempotency_key_replays_same_ack() {
        let venue = PaperVenue::new("paper");
        venue.set_book("BTCUSDT", &[(99.0, 5.0)], &[(100.0, 5.0)]);

        let first = venue.place_order(&creds(), &order(1.0, "dup")).await.unwrap();
        let second = venue.place_order(&creds(), &order(1.0, "dup")).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(venue.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn failure_injection_counts_down() {
        let venue = PaperVenue::new("paper");
        venue.set_book("BTCUSDT", &[(99.0, 5.0)], &[(100.0, 5.0)]);
        venue.fail_next_orders(1, EngineError::RateLimited("429".into()));

        assert!(venue.place_order(&creds(), &order(1.0, "x")).await.is_err());
        assert!(venue.place_order(&creds(), &order(1.0, "y")).await.is_ok());
    }
}
