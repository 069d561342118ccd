// =============================================================================
// Shared types used across the Aurora arbitrage engine
// =============================================================================
//
// Everything here is plain data: symbols, pair configuration, per-pair
// runtime state, notifications, and the records the persistence layer
// stores. Validation happens at ingress (`PairConfig::validate`,
// `Symbol::parse`); engines assume the data they receive is well-formed.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::state_machine::PairState;

// ---------------------------------------------------------------------------
// Symbol
// ---------------------------------------------------------------------------

/// Ordered quote-asset suffixes used to split a canonical symbol.
const QUOTE_ASSETS: [&str; 6] = ["USDT", "USDC", "USD", "BUSD", "BTC", "ETH"];

/// A canonical trading symbol: uppercase alphanumeric `BASE` + `QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    full: String,
    base: String,
    quote: String,
}

impl Symbol {
    /// Parse and canonicalize a symbol.
    ///
    /// Canonicalization uppercases the input and strips `-`, `_` and `/`.
    /// The result must be 4–30 alphanumeric characters and end in one of
    /// the known quote assets (checked in order).
    pub fn parse(raw: &str) -> Result<Self> {
        let full: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | '/'))
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if full.len() < 4 || full.len() > 30 {
            return Err(EngineError::Validation(format!(
                "symbol '{raw}' normalizes to {} chars, expected 4-30",
                full.len()
            )));
        }
        if !full.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EngineError::Validation(format!(
                "symbol '{raw}' contains non-alphanumeric characters"
            )));
        }

        for quote in QUOTE_ASSETS {
            if let Some(base) = full.strip_suffix(quote) {
                if base.is_empty() {
                    break;
                }
                return Ok(Self {
                    full: full.clone(),
                    base: base.to_string(),
                    quote: quote.to_string(),
                });
            }
        }

        Err(EngineError::Validation(format!(
            "symbol '{raw}' has no recognised quote asset"
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full)
    }
}

// ---------------------------------------------------------------------------
// Sides and book levels
// ---------------------------------------------------------------------------

/// Direction of one leg of a hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The mirror side, used when flattening a leg.
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub volume: f64,
}

impl BookLevel {
    pub fn new(price: f64, volume: f64) -> Self {
        Self { price, volume }
    }
}

// ---------------------------------------------------------------------------
// Pair configuration
// ---------------------------------------------------------------------------

/// Whether a configured pair should be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Paused,
    Active,
}

impl Default for PairStatus {
    fn default() -> Self {
        Self::Paused
    }
}

/// Immutable configuration of one arbitrage pair. Updates replace the whole
/// record and re-seed the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub id: i64,
    pub symbol: Symbol,
    pub venue_a: String,
    pub venue_b: String,
    /// Net-of-fee spread (percent) required to start entering.
    pub entry_spread_pct: f64,
    /// Raw spread (percent) at or below which the hedge unwinds.
    pub exit_spread_pct: f64,
    /// Total volume in the base asset, split across `n_orders` slices.
    pub volume: f64,
    pub n_orders: u32,
    /// Stop-loss as percent of position notional, if set.
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub status: PairStatus,
}

impl PairConfig {
    /// Validate all ingress bounds. Engines never see a config that fails
    /// this check.
    pub fn validate(&self) -> Result<()> {
        if self.venue_a.eq_ignore_ascii_case(&self.venue_b) {
            return Err(EngineError::Validation(format!(
                "pair {}: venue A and venue B must differ ({})",
                self.id, self.venue_a
            )));
        }
        if !(self.entry_spread_pct > 0.0 && self.entry_spread_pct <= 100.0) {
            return Err(EngineError::Validation(format!(
                "pair {}: entry spread {} outside (0, 100]",
                self.id, self.entry_spread_pct
            )));
        }
        if !(self.exit_spread_pct > 0.0 && self.exit_spread_pct <= self.entry_spread_pct) {
            return Err(EngineError::Validation(format!(
                "pair {}: exit spread {} outside (0, entry={}]",
                self.id, self.exit_spread_pct, self.entry_spread_pct
            )));
        }
        if self.volume <= 0.0 {
            return Err(EngineError::Validation(format!(
                "pair {}: volume must be positive, got {}",
                self.id, self.volume
            )));
        }
        if !(1..=100).contains(&self.n_orders) {
            return Err(EngineError::Validation(format!(
                "pair {}: n_orders {} outside [1, 100]",
                self.id, self.n_orders
            )));
        }
        if let Some(sl) = self.stop_loss_pct {
            if !(sl > 0.0 && sl <= 100.0) {
                return Err(EngineError::Validation(format!(
                    "pair {}: stop loss {} outside (0, 100]",
                    self.id, sl
                )));
            }
        }
        if let Some(lev) = self.leverage {
            if !(1..=100).contains(&lev) {
                return Err(EngineError::Validation(format!(
                    "pair {}: leverage {} outside [1, 100]",
                    self.id, lev
                )));
            }
        }
        Ok(())
    }

    /// Stop-loss expressed as an absolute quote-asset amount at `mark`.
    /// Zero when no stop-loss is configured.
    pub fn stop_loss_abs(&self, mark: f64) -> f64 {
        match self.stop_loss_pct {
            Some(pct) => self.volume * mark * pct / 100.0,
            None => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Pair runtime
// ---------------------------------------------------------------------------

/// One venue-side of an open hedge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub venue: String,
    pub side: Side,
    /// VWAP of fills so far.
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub unrealized_pnl: f64,
}

impl Leg {
    pub fn flat(venue: &str) -> Self {
        Self {
            venue: venue.to_string(),
            side: Side::Long,
            entry_price: 0.0,
            mark_price: 0.0,
            quantity: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity <= 0.0
    }

    /// Fold a new fill into the leg. The first fill of a position pins
    /// the side; same-side fills blend into the VWAP entry price, and an
    /// opposite-side fill nets the position down without touching the
    /// entry price — a blend across directions would be meaningless.
    pub fn apply_fill(&mut self, side: Side, price: f64, qty: f64) {
        if qty <= 0.0 {
            return;
        }
        if self.is_flat() {
            self.side = side;
            self.entry_price = price;
            self.quantity = qty;
        } else if side == self.side {
            let prev_notional = self.entry_price * self.quantity;
            self.quantity += qty;
            self.entry_price = (prev_notional + price * qty) / self.quantity;
        } else {
            self.reduce(qty);
        }
    }

    /// Reduce the leg by `qty` (flattening). Quantity never goes negative.
    pub fn reduce(&mut self, qty: f64) {
        self.quantity = (self.quantity - qty).max(0.0);
        if self.is_flat() {
            self.entry_price = 0.0;
            self.unrealized_pnl = 0.0;
        }
    }
}

/// Mutable per-pair state owned by exactly one engine, guarded by its mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRuntime {
    pub pair_id: i64,
    pub state: PairState,
    /// Last observed spread, percent, net of fees.
    pub current_spread: f64,
    pub leg_a: Leg,
    pub leg_b: Leg,
    /// Entry slices completed, in `[0, n_orders]`.
    pub filled_parts: u32,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub last_update: DateTime<Utc>,
}

impl PairRuntime {
    pub fn new(pair_id: i64, venue_a: &str, venue_b: &str) -> Self {
        Self {
            pair_id,
            state: PairState::Paused,
            current_spread: 0.0,
            leg_a: Leg::flat(venue_a),
            leg_b: Leg::flat(venue_b),
            filled_parts: 0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            last_update: Utc::now(),
        }
    }

    /// Zero both legs and the fill counter. Called on the PAUSED/READY edges.
    pub fn reset_position(&mut self) {
        let venue_a = self.leg_a.venue.clone();
        let venue_b = self.leg_b.venue.clone();
        self.leg_a = Leg::flat(&venue_a);
        self.leg_b = Leg::flat(&venue_b);
        self.filled_parts = 0;
        self.unrealized_pnl = 0.0;
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Open,
    Close,
    Sl,
    Liquidation,
    Error,
    Margin,
    Pause,
    SecondLegFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// An operator-visible event. Persisted and broadcast over the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Assigned by the store on insert; 0 until then.
    #[serde(default)]
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub severity: Severity,
    #[serde(default)]
    pub pair_id: Option<i64>,
    pub message: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        severity: Severity,
        pair_id: Option<i64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            kind,
            severity,
            pair_id,
            message: message.into(),
            meta: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = &mut self.meta {
            map.insert(key.to_string(), value);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Venue credential record. Secrets are stored as vault ciphertext only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub id: i64,
    pub name: String,
    pub api_key_enc: String,
    pub secret_key_enc: String,
    #[serde(default)]
    pub passphrase_enc: Option<String>,
    pub connected: bool,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One order sent to a venue, journaled for the operator audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    #[serde(default)]
    pub id: i64,
    pub pair_id: i64,
    pub exchange: String,
    pub side: Side,
    pub quantity: f64,
    /// "filled", "partial", "cancelled", "failed".
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A completed round trip for the trade journal and stats aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    #[serde(default)]
    pub id: i64,
    pub pair_id: i64,
    pub symbol: String,
    /// "venueA/venueB".
    pub exchanges: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: f64,
    pub was_stop_loss: bool,
    pub was_liquidation: bool,
}

/// Symbols barred from trading, consulted before engine start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub symbol: String,
    pub reason: String,
}

/// Singleton operator settings row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Present in the config surface but not wired into the fee model; the
    /// spread math ignores funding payments regardless of this flag.
    pub consider_funding: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            consider_funding: false,
        }
    }
}

/// Balance snapshot for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueBalance {
    pub venue: String,
    pub available: f64,
    pub total: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Symbol ----------------------------------------------------------

    #[test]
    fn symbol_canonicalizes_separators_and_case() {
        let s = Symbol::parse("btc-usdt").unwrap();
        assert_eq!(s.as_str(), "BTCUSDT");
        assert_eq!(s.base(), "BTC");
        assert_eq!(s.quote(), "USDT");

        let s = Symbol::parse("eth/usd").unwrap();
        assert_eq!(s.as_str(), "ETHUSD");
        assert_eq!(s.quote(), "USD");
    }

    #[test]
    fn symbol_quote_inference_is_ordered() {
        // USDT must win over USD even though both suffixes match.
        let s = Symbol::parse("SOLUSDT").unwrap();
        assert_eq!(s.quote(), "USDT");
        assert_eq!(s.base(), "SOL");
    }

    #[test]
    fn symbol_rejects_bad_input() {
        assert!(Symbol::parse("AB").is_err());
        assert!(Symbol::parse("BTC$USDT").is_err());
        assert!(Symbol::parse("NOQUOTEHERE").is_err());
        // Quote with empty base.
        assert!(Symbol::parse("USDT").is_err());
    }

    // ---- PairConfig validation ------------------------------------------

    fn config() -> PairConfig {
        PairConfig {
            id: 1,
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            venue_a: "bybit".into(),
            venue_b: "okx".into(),
            entry_spread_pct: 1.0,
            exit_spread_pct: 0.2,
            volume: 1.0,
            n_orders: 4,
            stop_loss_pct: Some(5.0),
            leverage: None,
            status: PairStatus::Paused,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn same_venue_rejected() {
        let mut c = config();
        c.venue_b = "ByBit".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn exit_above_entry_rejected() {
        let mut c = config();
        c.exit_spread_pct = 1.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn n_orders_bounds() {
        let mut c = config();
        c.n_orders = 0;
        assert!(c.validate().is_err());
        c.n_orders = 101;
        assert!(c.validate().is_err());
        c.n_orders = 100;
        assert!(c.validate().is_ok());
    }

    // ---- Leg -------------------------------------------------------------

    #[test]
    fn leg_vwap_accumulates_fills() {
        let mut leg = Leg::flat("bybit");
        leg.apply_fill(Side::Long, 100.0, 1.0);
        leg.apply_fill(Side::Long, 102.0, 1.0);
        assert!((leg.entry_price - 101.0).abs() < 1e-9);
        assert!((leg.quantity - 2.0).abs() < 1e-9);
    }

    #[test]
    fn leg_reduce_clamps_at_zero() {
        let mut leg = Leg::flat("okx");
        leg.apply_fill(Side::Short, 50.0, 0.5);
        leg.reduce(0.7);
        assert!(leg.is_flat());
        assert_eq!(leg.entry_price, 0.0);
    }

    #[test]
    fn leg_opposite_side_fill_nets_down() {
        let mut leg = Leg::flat("bybit");
        leg.apply_fill(Side::Long, 100.0, 1.0);
        // An opposite-side fill reduces the position; the side and the
        // entry VWAP of the remainder are untouched.
        leg.apply_fill(Side::Short, 105.0, 0.4);
        assert_eq!(leg.side, Side::Long);
        assert!((leg.quantity - 0.6).abs() < 1e-9);
        assert!((leg.entry_price - 100.0).abs() < 1e-9);

        // Netting all the way through leaves the leg flat.
        leg.apply_fill(Side::Short, 105.0, 0.6);
        assert!(leg.is_flat());
    }

    #[test]
    fn leg_first_fill_pins_the_side() {
        let mut leg = Leg::flat("okx");
        leg.apply_fill(Side::Short, 200.0, 0.3);
        leg.apply_fill(Side::Short, 210.0, 0.3);
        assert_eq!(leg.side, Side::Short);
        assert!((leg.entry_price - 205.0).abs() < 1e-9);
    }
}
