// =============================================================================
// Outbound hub messages — the four typed payloads subscribers receive
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;

use crate::stats::StatsSnapshot;
use crate::types::{Notification, PairRuntime};

/// `pairUpdate` — per-pair runtime snapshot.
pub fn pair_update(runtime: &PairRuntime) -> serde_json::Value {
    json!({
        "type": "pairUpdate",
        "timestamp": Utc::now().timestamp_millis(),
        "pair_id": runtime.pair_id,
        "data": {
            "state": runtime.state,
            "current_spread": runtime.current_spread,
            "unrealized_pnl": runtime.unrealized_pnl,
            "realized_pnl": runtime.realized_pnl,
            "filled_parts": runtime.filled_parts,
            "legs": [&runtime.leg_a, &runtime.leg_b],
            "last_update": runtime.last_update,
        },
    })
}

/// `notification` — operator-visible event.
pub fn notification(n: &Notification) -> serde_json::Value {
    json!({
        "type": "notification",
        "timestamp": Utc::now().timestamp_millis(),
        "data": n,
    })
}

/// `balanceUpdate` — single-venue balance.
pub fn balance_update(venue: &str, balance: f64) -> serde_json::Value {
    json!({
        "type": "balanceUpdate",
        "timestamp": Utc::now().timestamp_millis(),
        "exchange": venue,
        "balance": balance,
    })
}

/// `balanceUpdate` — bulk snapshot across venues.
pub fn balance_snapshot(balances: &HashMap<String, f64>) -> serde_json::Value {
    json!({
        "type": "balanceUpdate",
        "timestamp": Utc::now().timestamp_millis(),
        "balances": balances,
    })
}

/// `statsUpdate` — aggregate trade statistics.
pub fn stats_update(snapshot: &StatsSnapshot) -> serde_json::Value {
    json!({
        "type": "statsUpdate",
        "timestamp": Utc::now().timestamp_millis(),
        "data": snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NotificationKind, Severity};

    #[test]
    fn pair_update_shape() {
        let rt = PairRuntime::new(7, "bybit", "okx");
        let msg = pair_update(&rt);
        assert_eq!(msg["type"], "pairUpdate");
        assert_eq!(msg["pair_id"], 7);
        assert_eq!(msg["data"]["state"], "PAUSED");
        assert_eq!(msg["data"]["legs"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn notification_carries_kind_tag() {
        let n = Notification::new(
            NotificationKind::SecondLegFail,
            Severity::Error,
            Some(3),
            "leg B timed out",
        );
        let msg = notification(&n);
        assert_eq!(msg["data"]["type"], "SECOND_LEG_FAIL");
        assert_eq!(msg["data"]["severity"], "error");
        assert_eq!(msg["data"]["pair_id"], 3);
    }

    #[test]
    fn balance_messages() {
        let single = balance_update("bybit", 1234.5);
        assert_eq!(single["exchange"], "bybit");

        let mut map = HashMap::new();
        map.insert("okx".to_string(), 10.0);
        let bulk = balance_snapshot(&map);
        assert_eq!(bulk["balances"]["okx"], 10.0);
    }
}
