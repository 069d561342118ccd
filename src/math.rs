// =============================================================================
// Execution math — spreads, lot quantization, volume splitting, VWAP, PnL
// =============================================================================
//
// Every function here is total and pure. Floating-point throughout; equality
// is only ever tested through `approx_eq` with EPSILON = 1e-6.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{BookLevel, Side};

/// Tolerance for floating-point comparisons.
pub const EPSILON: f64 = 1e-6;

/// `true` when `a` and `b` differ by less than [`EPSILON`].
pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

// ---------------------------------------------------------------------------
// Spreads
// ---------------------------------------------------------------------------

/// Percent divergence of `p_high` over `p_low`. Zero when `p_low` is not
/// positive.
pub fn spread(p_high: f64, p_low: f64) -> f64 {
    if p_low > 0.0 {
        (p_high - p_low) / p_low * 100.0
    } else {
        0.0
    }
}

/// Spread between two prices in either order.
pub fn spread_from_prices(a: f64, b: f64) -> f64 {
    spread(a.max(b), a.min(b))
}

/// Spread minus the aggregate round-trip fee load of both venues.
///
/// Each leg pays its venue's fee twice (entry and exit), hence the factor
/// of two on the combined rate.
pub fn net_spread(raw_spread: f64, fee_a: f64, fee_b: f64) -> f64 {
    raw_spread - 2.0 * (fee_a + fee_b) * 100.0
}

// ---------------------------------------------------------------------------
// Lot quantization
// ---------------------------------------------------------------------------

/// Floor-quantize `v` to a multiple of `step` (sizing into a position).
/// A non-positive step leaves `v` unchanged.
pub fn round_to_lot(v: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return v;
    }
    (v / step).floor() * step
}

/// Ceiling variant, used when sizing out so a residual never lingers.
pub fn round_to_lot_up(v: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return v;
    }
    (v / step).ceil() * step
}

/// Nearest variant for display purposes.
pub fn round_to_lot_nearest(v: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return v;
    }
    (v / step).round() * step
}

// ---------------------------------------------------------------------------
// Volume splitting
// ---------------------------------------------------------------------------

/// Split `total` into `n` lot-quantized slices.
///
/// Each slice is `round_to_lot(total / n, step)`; the residual (at most
/// `(n-1) * step`) is discarded so slices stay symmetric across venues.
pub fn split_volume(total: f64, n: u32, step: f64) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let slice = round_to_lot(total / n as f64, step);
    vec![slice; n as usize]
}

// ---------------------------------------------------------------------------
// VWAP simulation
// ---------------------------------------------------------------------------

/// Result of walking an order book for a target volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VwapResult {
    /// Volume-weighted average fill price.
    pub avg_price: f64,
    /// Volume actually available (may be less than the target).
    pub filled_volume: f64,
    /// Percent difference between the average fill and the best level.
    pub slippage_pct: f64,
}

impl VwapResult {
    fn zero() -> Self {
        Self {
            avg_price: 0.0,
            filled_volume: 0.0,
            slippage_pct: 0.0,
        }
    }
}

/// Simulate a market buy walking `asks` (ascending) until `target` volume
/// is consumed. Empty book or non-positive target yields zeros.
pub fn vwap_buy(asks: &[BookLevel], target: f64) -> VwapResult {
    walk_book(asks, target)
}

/// Simulate a market sell walking `bids` (descending).
pub fn vwap_sell(bids: &[BookLevel], target: f64) -> VwapResult {
    walk_book(bids, target)
}

fn walk_book(levels: &[BookLevel], target: f64) -> VwapResult {
    if levels.is_empty() || target <= 0.0 {
        return VwapResult::zero();
    }

    let best = levels[0].price;
    let mut remaining = target;
    let mut notional = 0.0;
    let mut filled = 0.0;

    for level in levels {
        if remaining <= 0.0 {
            break;
        }
        let take = remaining.min(level.volume);
        notional += take * level.price;
        filled += take;
        remaining -= take;
    }

    if filled <= 0.0 {
        return VwapResult::zero();
    }

    let avg_price = notional / filled;
    VwapResult {
        avg_price,
        filled_volume: filled,
        slippage_pct: spread_from_prices(avg_price, best),
    }
}

// ---------------------------------------------------------------------------
// PnL and thresholds
// ---------------------------------------------------------------------------

/// Per-leg PnL. Long profits when the mark rises, short when it falls.
pub fn pnl(side: Side, entry: f64, current: f64, qty: f64) -> f64 {
    match side {
        Side::Long => (current - entry) * qty,
        Side::Short => (entry - current) * qty,
    }
}

/// Entry gate: net spread must meet the configured threshold.
pub fn is_spread_sufficient(net: f64, threshold: f64) -> bool {
    net >= threshold
}

/// Exit gate: raw spread collapsed to or below the exit threshold.
pub fn should_exit(raw: f64, exit_threshold: f64) -> bool {
    raw <= exit_threshold
}

/// Stop-loss gate. A non-positive `sl_abs` means no stop-loss configured.
pub fn is_sl_hit(total_pnl: f64, sl_abs: f64) -> bool {
    sl_abs > 0.0 && total_pnl <= -sl_abs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvl(price: f64, volume: f64) -> BookLevel {
        BookLevel::new(price, volume)
    }

    // ---- spread ----------------------------------------------------------

    #[test]
    fn spread_of_equal_prices_is_zero() {
        assert!(approx_eq(spread(100.0, 100.0), 0.0));
    }

    #[test]
    fn spread_zero_when_low_not_positive() {
        assert_eq!(spread(100.0, 0.0), 0.0);
        assert_eq!(spread(100.0, -1.0), 0.0);
    }

    #[test]
    fn spread_from_prices_is_symmetric() {
        assert!(approx_eq(
            spread_from_prices(101.5, 100.0),
            spread_from_prices(100.0, 101.5)
        ));
        assert!(approx_eq(spread_from_prices(101.0, 100.0), 1.0));
    }

    #[test]
    fn net_spread_subtracts_round_trip_fees() {
        // 0.04% per venue -> 2 * (0.0004 + 0.0004) * 100 = 0.16 off the top.
        assert!(approx_eq(net_spread(1.5, 0.0004, 0.0004), 1.34));
    }

    // ---- lot quantization ------------------------------------------------

    #[test]
    fn round_to_lot_floors() {
        assert!(approx_eq(round_to_lot(0.2599, 0.001), 0.259));
        assert!(approx_eq(round_to_lot_up(0.2591, 0.001), 0.26));
        assert!(approx_eq(round_to_lot_nearest(0.2596, 0.001), 0.26));
    }

    #[test]
    fn round_to_lot_zero_step_is_identity() {
        assert_eq!(round_to_lot(1.2345, 0.0), 1.2345);
        assert_eq!(round_to_lot(1.2345, -0.1), 1.2345);
    }

    #[test]
    fn round_to_lot_is_idempotent() {
        let v = round_to_lot(0.7777, 0.01);
        assert!(approx_eq(round_to_lot(v, 0.01), v));
    }

    #[test]
    fn round_to_lot_bounds() {
        // round_to_lot(v, s) <= v < round_to_lot(v, s) + s for s > 0.
        for &v in &[0.0, 0.1234, 1.0, 99.999] {
            let q = round_to_lot(v, 0.01);
            assert!(q <= v + EPSILON);
            assert!(v < q + 0.01 + EPSILON);
        }
    }

    // ---- split_volume ----------------------------------------------------

    #[test]
    fn split_volume_even() {
        let parts = split_volume(1.0, 4, 0.001);
        assert_eq!(parts.len(), 4);
        for p in &parts {
            assert!(approx_eq(*p, 0.25));
        }
    }

    #[test]
    fn split_volume_residual_bounded() {
        let total = 1.0;
        let n = 3;
        let step = 0.001;
        let parts = split_volume(total, n, step);
        let sum: f64 = parts.iter().sum();
        assert!(sum <= total + EPSILON);
        assert!(total - sum <= (n - 1) as f64 * step + EPSILON);
    }

    #[test]
    fn split_volume_zero_n() {
        assert!(split_volume(1.0, 0, 0.001).is_empty());
    }

    // ---- VWAP ------------------------------------------------------------

    #[test]
    fn vwap_buy_walks_levels() {
        let asks = [lvl(100.0, 0.5), lvl(101.0, 0.5), lvl(102.0, 1.0)];
        let r = vwap_buy(&asks, 1.0);
        assert!(approx_eq(r.filled_volume, 1.0));
        assert!(approx_eq(r.avg_price, 100.5));
        assert!(r.slippage_pct > 0.0);
    }

    #[test]
    fn vwap_buy_partial_fill_when_book_thin() {
        let asks = [lvl(100.0, 0.3)];
        let r = vwap_buy(&asks, 1.0);
        assert!(approx_eq(r.filled_volume, 0.3));
        assert!(approx_eq(r.avg_price, 100.0));
    }

    #[test]
    fn vwap_empty_book_is_zero() {
        let r = vwap_buy(&[], 1.0);
        assert_eq!(r, VwapResult::zero());
        let r = vwap_sell(&[], 1.0);
        assert_eq!(r.filled_volume, 0.0);
    }

    #[test]
    fn vwap_sell_descending_bids() {
        let bids = [lvl(100.0, 0.5), lvl(99.0, 0.5)];
        let r = vwap_sell(&bids, 1.0);
        assert!(approx_eq(r.avg_price, 99.5));
    }

    // ---- PnL -------------------------------------------------------------

    #[test]
    fn pnl_zero_at_entry_price() {
        assert!(approx_eq(pnl(Side::Long, 100.0, 100.0, 2.0), 0.0));
        assert!(approx_eq(pnl(Side::Short, 100.0, 100.0, 2.0), 0.0));
    }

    #[test]
    fn pnl_signs() {
        assert!(pnl(Side::Long, 100.0, 101.0, 1.0) > 0.0);
        assert!(pnl(Side::Long, 100.0, 99.0, 1.0) < 0.0);
        assert!(pnl(Side::Short, 100.0, 99.0, 1.0) > 0.0);
        assert!(pnl(Side::Short, 100.0, 101.0, 1.0) < 0.0);
    }

    // ---- thresholds ------------------------------------------------------

    #[test]
    fn threshold_predicates() {
        assert!(is_spread_sufficient(1.34, 1.0));
        assert!(!is_spread_sufficient(0.84, 1.0));
        assert!(should_exit(0.1, 0.2));
        assert!(!should_exit(0.3, 0.2));
    }

    #[test]
    fn sl_hit_requires_configured_stop() {
        assert!(!is_sl_hit(-100.0, 0.0));
        assert!(is_sl_hit(-60.0, 50.0));
        assert!(!is_sl_hit(-40.0, 50.0));
    }
}
