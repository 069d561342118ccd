// =============================================================================
// Persistence Contract — the relational surface the engine depends on
// =============================================================================
//
// The core never talks SQL. It writes and reads through this trait; the
// production backend lives outside the crate. `MemoryStore` is a faithful
// in-process implementation (unique keys, cascade and set-null semantics)
// that backs tests and demo mode.
//
// Key constraints honoured here:
//   - UNIQUE on exchanges.name and blacklist.symbol
//   - orders.pair_id / trades.pair_id cascade on pair delete
//   - notifications.pair_id is nulled on pair delete
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{
    BlacklistEntry, ExchangeRecord, Notification, OrderRecord, PairConfig, PairStatus, Settings,
    TradeRecord,
};

/// Everything the engines and orchestrator persist or look up.
pub trait Store: Send + Sync {
    // ── pairs ───────────────────────────────────────────────────────────
    fn list_pairs(&self) -> Vec<PairConfig>;
    fn get_pair(&self, id: i64) -> Option<PairConfig>;
    /// Insert (id 0) or replace. Returns the record id.
    fn upsert_pair(&self, cfg: PairConfig) -> i64;
    /// Delete a pair; orders and trades cascade, notifications are nulled.
    fn delete_pair(&self, id: i64) -> bool;
    fn set_pair_status(&self, id: i64, status: PairStatus) -> bool;

    // ── exchanges ───────────────────────────────────────────────────────
    fn list_exchanges(&self) -> Vec<ExchangeRecord>;
    fn get_exchange(&self, name: &str) -> Option<ExchangeRecord>;
    /// Insert or replace by unique name. Returns the record id.
    fn upsert_exchange(&self, rec: ExchangeRecord) -> i64;
    fn delete_exchange(&self, name: &str) -> bool;
    fn set_exchange_status(&self, name: &str, connected: bool, last_error: Option<String>);
    fn set_exchange_balance(&self, name: &str, balance: f64);

    // ── orders ──────────────────────────────────────────────────────────
    fn insert_order(&self, order: OrderRecord) -> i64;
    fn list_orders(&self, pair_id: i64) -> Vec<OrderRecord>;

    // ── notifications ───────────────────────────────────────────────────
    /// Insert and return the record with its assigned id.
    fn insert_notification(&self, n: Notification) -> Notification;
    fn recent_notifications(&self, limit: usize) -> Vec<Notification>;
    fn clear_notifications(&self);

    // ── trades ──────────────────────────────────────────────────────────
    fn insert_trade(&self, t: TradeRecord) -> i64;
    fn list_trades(&self) -> Vec<TradeRecord>;

    // ── blacklist ───────────────────────────────────────────────────────
    /// Returns false when the symbol is already present (unique key).
    fn blacklist_add(&self, entry: BlacklistEntry) -> bool;
    fn blacklist_remove(&self, symbol: &str) -> bool;
    fn blacklist_contains(&self, symbol: &str) -> bool;
    fn list_blacklist(&self) -> Vec<BlacklistEntry>;

    // ── settings ────────────────────────────────────────────────────────
    fn settings(&self) -> Settings;
    fn update_settings(&self, s: Settings);
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    pairs: HashMap<i64, PairConfig>,
    exchanges: HashMap<String, ExchangeRecord>,
    orders: Vec<OrderRecord>,
    notifications: Vec<Notification>,
    trades: Vec<TradeRecord>,
    blacklist: Vec<BlacklistEntry>,
    settings: Settings,
    next_id: i64,
}

impl Tables {
    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store used by tests and demo mode.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    // ── pairs ───────────────────────────────────────────────────────────

    fn list_pairs(&self) -> Vec<PairConfig> {
        let mut pairs: Vec<_> = self.tables.read().pairs.values().cloned().collect();
        pairs.sort_by_key(|p| p.id);
        pairs
    }

    fn get_pair(&self, id: i64) -> Option<PairConfig> {
        self.tables.read().pairs.get(&id).cloned()
    }

    fn upsert_pair(&self, mut cfg: PairConfig) -> i64 {
        let mut t = self.tables.write();
        if cfg.id == 0 {
            cfg.id = t.next();
        }
        let id = cfg.id;
        t.pairs.insert(id, cfg);
        id
    }

    fn delete_pair(&self, id: i64) -> bool {
        let mut t = self.tables.write();
        let existed = t.pairs.remove(&id).is_some();
        if existed {
            t.orders.retain(|o| o.pair_id != id);
            t.trades.retain(|tr| tr.pair_id != id);
            for n in t.notifications.iter_mut() {
                if n.pair_id == Some(id) {
                    n.pair_id = None;
                }
            }
            debug!(pair_id = id, "pair deleted with cascade");
        }
        existed
    }

    fn set_pair_status(&self, id: i64, status: PairStatus) -> bool {
        let mut t = self.tables.write();
        match t.pairs.get_mut(&id) {
            Some(p) => {
                p.status = status;
                true
            }
            None => false,
        }
    }

    // ── exchanges ───────────────────────────────────────────────────────

    fn list_exchanges(&self) -> Vec<ExchangeRecord> {
        let mut out: Vec<_> = self.tables.read().exchanges.values().cloned().collect();
        out.sort_by_key(|e| e.id);
        out
    }

    fn get_exchange(&self, name: &str) -> Option<ExchangeRecord> {
        self.tables.read().exchanges.get(name).cloned()
    }

    fn upsert_exchange(&self, mut rec: ExchangeRecord) -> i64 {
        let mut t = self.tables.write();
        if let Some(existing) = t.exchanges.get(&rec.name) {
            rec.id = existing.id;
        } else if rec.id == 0 {
            rec.id = t.next();
        }
        let id = rec.id;
        t.exchanges.insert(rec.name.clone(), rec);
        id
    }

    fn delete_exchange(&self, name: &str) -> bool {
        self.tables.write().exchanges.remove(name).is_some()
    }

    fn set_exchange_status(&self, name: &str, connected: bool, last_error: Option<String>) {
        let mut t = self.tables.write();
        if let Some(e) = t.exchanges.get_mut(name) {
            e.connected = connected;
            e.last_error = last_error;
            e.updated_at = chrono::Utc::now();
        }
    }

    fn set_exchange_balance(&self, name: &str, balance: f64) {
        let mut t = self.tables.write();
        if let Some(e) = t.exchanges.get_mut(name) {
            e.balance = balance;
            e.updated_at = chrono::Utc::now();
        }
    }

    // ── orders ──────────────────────────────────────────────────────────

    fn insert_order(&self, mut order: OrderRecord) -> i64 {
        let mut t = self.tables.write();
        order.id = t.next();
        let id = order.id;
        t.orders.push(order);
        id
    }

    fn list_orders(&self, pair_id: i64) -> Vec<OrderRecord> {
        self.tables
            .read()
            .orders
            .iter()
            .filter(|o| o.pair_id == pair_id)
            .cloned()
            .collect()
    }

    // ── notifications ───────────────────────────────────────────────────

    fn insert_notification(&self, mut n: Notification) -> Notification {
        let mut t = self.tables.write();
        n.id = t.next();
        t.notifications.push(n.clone());
        n
    }

    fn recent_notifications(&self, limit: usize) -> Vec<Notification> {
        let t = self.tables.read();
        t.notifications.iter().rev().take(limit).cloned().collect()
    }

    fn clear_notifications(&self) {
        self.tables.write().notifications.clear();
    }

    // ── trades ──────────────────────────────────────────────────────────

    fn insert_trade(&self, mut trade: TradeRecord) -> i64 {
        let mut t = self.tables.write();
        trade.id = t.next();
        let id = trade.id;
        t.trades.push(trade);
        id
    }

    fn list_trades(&self) -> Vec<TradeRecord> {
        self.tables.read().trades.clone()
    }

    // ── blacklist ───────────────────────────────────────────────────────

    fn blacklist_add(&self, entry: BlacklistEntry) -> bool {
        let mut t = self.tables.write();
        if t.blacklist.iter().any(|b| b.symbol == entry.symbol) {
            return false;
        }
        t.blacklist.push(entry);
        true
    }

    fn blacklist_remove(&self, symbol: &str) -> bool {
        let mut t = self.tables.write();
        let before = t.blacklist.len();
        t.blacklist.retain(|b| b.symbol != symbol);
        t.blacklist.len() != before
    }

    fn blacklist_contains(&self, symbol: &str) -> bool {
        self.tables.read().blacklist.iter().any(|b| b.symbol == symbol)
    }

    fn list_blacklist(&self) -> Vec<BlacklistEntry> {
        self.tables.read().blacklist.clone()
    }

    // ── settings ────────────────────────────────────────────────────────

    fn settings(&self) -> Settings {
        self.tables.read().settings.clone()
    }

    fn update_settings(&self, s: Settings) {
        self.tables.write().settings = s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NotificationKind, Severity, Side, Symbol};
    use chrono::Utc;

    fn pair(id: i64) -> PairConfig {
        PairConfig {
            id,
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            venue_a: "bybit".into(),
            venue_b: "okx".into(),
            entry_spread_pct: 1.0,
            exit_spread_pct: 0.2,
            volume: 1.0,
            n_orders: 4,
            stop_loss_pct: None,
            leverage: None,
            status: PairStatus::Paused,
        }
    }

    #[test]
    fn pair_upsert_assigns_ids() {
        let store = MemoryStore::new();
        let id = store.upsert_pair(pair(0));
        assert!(id > 0);
        assert_eq!(store.list_pairs().len(), 1);

        // Replacing keeps the id.
        let mut updated = store.get_pair(id).unwrap();
        updated.entry_spread_pct = 2.0;
        assert_eq!(store.upsert_pair(updated), id);
        assert_eq!(store.get_pair(id).unwrap().entry_spread_pct, 2.0);
    }

    #[test]
    fn delete_pair_cascades_and_nulls() {
        let store = MemoryStore::new();
        let id = store.upsert_pair(pair(0));

        store.insert_order(OrderRecord {
            id: 0,
            pair_id: id,
            exchange: "bybit".into(),
            side: Side::Long,
            quantity: 0.25,
            status: "filled".into(),
            created_at: Utc::now(),
        });
        store.insert_trade(TradeRecord {
            id: 0,
            pair_id: id,
            symbol: "BTCUSDT".into(),
            exchanges: "bybit/okx".into(),
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            pnl: 1.0,
            was_stop_loss: false,
            was_liquidation: false,
        });
        store.insert_notification(Notification::new(
            NotificationKind::Open,
            Severity::Info,
            Some(id),
            "position opened",
        ));

        assert!(store.delete_pair(id));
        assert!(store.list_orders(id).is_empty());
        assert!(store.list_trades().is_empty());
        // Notification survives with pair_id nulled.
        let notes = store.recent_notifications(10);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].pair_id, None);
    }

    #[test]
    fn exchange_name_is_unique() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let rec = |name: &str| ExchangeRecord {
            id: 0,
            name: name.into(),
            api_key_enc: "enc".into(),
            secret_key_enc: "enc".into(),
            passphrase_enc: None,
            connected: false,
            balance: 0.0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let first = store.upsert_exchange(rec("bybit"));
        let second = store.upsert_exchange(rec("bybit"));
        assert_eq!(first, second);
        assert_eq!(store.list_exchanges().len(), 1);
    }

    #[test]
    fn blacklist_symbol_unique() {
        let store = MemoryStore::new();
        assert!(store.blacklist_add(BlacklistEntry {
            symbol: "SHIBUSDT".into(),
            reason: "illiquid".into(),
        }));
        assert!(!store.blacklist_add(BlacklistEntry {
            symbol: "SHIBUSDT".into(),
            reason: "dup".into(),
        }));
        assert!(store.blacklist_contains("SHIBUSDT"));
        assert!(store.blacklist_remove("SHIBUSDT"));
        assert!(!store.blacklist_contains("SHIBUSDT"));
    }
}
