// =============================================================================
// Stats Aggregate — trade counts and PnL bucketed by day / week / month / all
// =============================================================================
//
// Closed trades are folded in as they happen; snapshots recompute the
// day/week/month windows on demand from a pruned recent-trade list, while
// the all-time totals are monotonic counters. "today" is the UTC calendar
// date; week and month are rolling 7- and 30-day windows.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::types::TradeRecord;

/// Recent trades older than this are pruned; the month window never looks
/// back further.
const RETENTION_DAYS: i64 = 31;

#[derive(Debug, Clone, Copy)]
struct TradeStamp {
    time: DateTime<Utc>,
    pnl: f64,
    was_stop_loss: bool,
    was_liquidation: bool,
}

struct Inner {
    recent: Vec<TradeStamp>,
    total_trades: u64,
    total_pnl: f64,
    dirty: bool,
}

/// Snapshot shape broadcast as `statsUpdate`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub today_trades: u64,
    pub week_trades: u64,
    pub month_trades: u64,
    pub total_trades: u64,
    pub today_pnl: f64,
    pub week_pnl: f64,
    pub month_pnl: f64,
    pub total_pnl: f64,
    pub stop_loss_today: u64,
    pub stop_loss_week: u64,
    pub stop_loss_month: u64,
    pub liquidations_today: u64,
    pub liquidations_week: u64,
    pub liquidations_month: u64,
}

/// Thread-safe aggregate of closed-trade statistics.
pub struct StatsAggregate {
    inner: RwLock<Inner>,
}

impl StatsAggregate {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                recent: Vec::new(),
                total_trades: 0,
                total_pnl: 0.0,
                dirty: false,
            }),
        }
    }

    /// Seed the aggregate from persisted trades at startup.
    pub fn seed(&self, trades: &[TradeRecord]) {
        let mut inner = self.inner.write();
        for t in trades {
            inner.recent.push(TradeStamp {
                time: t.exit_time,
                pnl: t.pnl,
                was_stop_loss: t.was_stop_loss,
                was_liquidation: t.was_liquidation,
            });
            inner.total_trades += 1;
            inner.total_pnl += t.pnl;
        }
        debug!(count = trades.len(), "stats aggregate seeded");
    }

    /// Fold one closed trade in and mark the aggregate dirty.
    pub fn record_trade(&self, trade: &TradeRecord) {
        let mut inner = self.inner.write();
        inner.recent.push(TradeStamp {
            time: trade.exit_time,
            pnl: trade.pnl,
            was_stop_loss: trade.was_stop_loss,
            was_liquidation: trade.was_liquidation,
        });
        inner.total_trades += 1;
        inner.total_pnl += trade.pnl;
        inner.dirty = true;

        let cutoff = Utc::now() - Duration::days(RETENTION_DAYS);
        inner.recent.retain(|t| t.time >= cutoff);
    }

    /// Swap the dirty flag out, returning whether anything changed since
    /// the last call. The orchestrator's stats loop polls this.
    pub fn take_dirty(&self) -> bool {
        std::mem::take(&mut self.inner.write().dirty)
    }

    /// Zero everything (operator `stats.reset`).
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.recent.clear();
        inner.total_trades = 0;
        inner.total_pnl = 0.0;
        inner.dirty = true;
    }

    /// Compute the bucketed snapshot as of `now`.
    pub fn snapshot(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let inner = self.inner.read();
        let today = now.date_naive();
        let week_cutoff = now - Duration::days(7);
        let month_cutoff = now - Duration::days(30);

        let mut snap = StatsSnapshot {
            total_trades: inner.total_trades,
            total_pnl: inner.total_pnl,
            ..StatsSnapshot::default()
        };

        for t in &inner.recent {
            if t.time >= month_cutoff {
                snap.month_trades += 1;
                snap.month_pnl += t.pnl;
                if t.was_stop_loss {
                    snap.stop_loss_month += 1;
                }
                if t.was_liquidation {
                    snap.liquidations_month += 1;
                }
            }
            if t.time >= week_cutoff {
                snap.week_trades += 1;
                snap.week_pnl += t.pnl;
                if t.was_stop_loss {
                    snap.stop_loss_week += 1;
                }
                if t.was_liquidation {
                    snap.liquidations_week += 1;
                }
            }
            if t.time.date_naive() == today {
                snap.today_trades += 1;
                snap.today_pnl += t.pnl;
                if t.was_stop_loss {
                    snap.stop_loss_today += 1;
                }
                if t.was_liquidation {
                    snap.liquidations_today += 1;
                }
            }
        }

        snap
    }
}

impl Default for StatsAggregate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(days_ago: i64, pnl: f64, sl: bool, liq: bool) -> TradeRecord {
        let exit = Utc::now() - Duration::days(days_ago);
        TradeRecord {
            id: 0,
            pair_id: 1,
            symbol: "BTCUSDT".into(),
            exchanges: "bybit/okx".into(),
            entry_time: exit - Duration::minutes(5),
            exit_time: exit,
            pnl,
            was_stop_loss: sl,
            was_liquidation: liq,
        }
    }

    #[test]
    fn buckets_are_windowed() {
        let stats = StatsAggregate::new();
        stats.record_trade(&trade(0, 10.0, false, false));
        stats.record_trade(&trade(3, 5.0, true, false));
        stats.record_trade(&trade(20, -2.0, false, true));

        let snap = stats.snapshot(Utc::now());
        assert_eq!(snap.today_trades, 1);
        assert_eq!(snap.week_trades, 2);
        assert_eq!(snap.month_trades, 3);
        assert_eq!(snap.total_trades, 3);
        assert!((snap.today_pnl - 10.0).abs() < 1e-9);
        assert!((snap.week_pnl - 15.0).abs() < 1e-9);
        assert!((snap.month_pnl - 13.0).abs() < 1e-9);
        assert_eq!(snap.stop_loss_week, 1);
        assert_eq!(snap.liquidations_month, 1);
        assert_eq!(snap.stop_loss_today, 0);
    }

    #[test]
    fn dirty_flag_swaps_once() {
        let stats = StatsAggregate::new();
        assert!(!stats.take_dirty());
        stats.record_trade(&trade(0, 1.0, false, false));
        assert!(stats.take_dirty());
        assert!(!stats.take_dirty());
    }

    #[test]
    fn reset_zeroes_everything() {
        let stats = StatsAggregate::new();
        stats.record_trade(&trade(0, 1.0, false, false));
        stats.reset();
        let snap = stats.snapshot(Utc::now());
        assert_eq!(snap.total_trades, 0);
        assert_eq!(snap.today_trades, 0);
        assert_eq!(snap.total_pnl, 0.0);
    }

    #[test]
    fn totals_survive_retention_pruning() {
        let stats = StatsAggregate::new();
        stats.seed(&[trade(60, 7.0, false, false)]);
        // A new trade triggers pruning of the 60-day-old record.
        stats.record_trade(&trade(0, 3.0, false, false));

        let snap = stats.snapshot(Utc::now());
        assert_eq!(snap.total_trades, 2);
        assert!((snap.total_pnl - 10.0).abs() < 1e-9);
        assert_eq!(snap.month_trades, 1);
    }
}
