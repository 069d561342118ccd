// =============================================================================
// Orchestrator — owns the engines, the gateways, and the periodic fan-outs
// =============================================================================
//
// Startup: rebuild venue gateways from stored credentials, spawn a pair
// engine for every active config that survives validation and the
// blacklist gate, then run the balance (60 s) and stats (5 s) fan-out
// loops. Operator commands arrive as typed structs and are applied here;
// engines are only ever addressed through their control channels.
//
// Shutdown: every engine gets a shutdown command and a 10 s flatten
// budget inside an overall 30 s deadline, then the hub and gateways close.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{EngineCommand, PairEngine};
use crate::error::{EngineError, Result};
use crate::gateway::{EncryptedCredentials, SymbolMeta, VenueAdapter, VenueGateway};
use crate::hub::{messages, Hub};
use crate::metrics::Metrics;
use crate::stats::StatsAggregate;
use crate::storage::Store;
use crate::types::{
    BlacklistEntry, ExchangeRecord, Notification, NotificationKind, PairConfig, PairStatus,
    Settings, Severity,
};
use crate::vault::Vault;

/// Balance poll period.
const BALANCE_POLL_PERIOD: Duration = Duration::from_secs(60);
/// Stats aggregation check period.
const STATS_PERIOD: Duration = Duration::from_secs(5);
/// Whole-process shutdown deadline.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);
/// Per-engine flatten budget inside the deadline.
const ENGINE_SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);
/// Engine control channels are small; commands are rare.
const CONTROL_CHANNEL_CAPACITY: usize = 8;

/// Builds a wire adapter for a venue name, or `None` when unsupported.
pub type AdapterFactory = Box<dyn Fn(&str) -> Option<Arc<dyn VenueAdapter>> + Send + Sync>;

/// Operator commands accepted by the orchestrator.
#[derive(Debug, Clone)]
pub enum Command {
    ExchangesConnect {
        name: String,
        api_key: String,
        api_secret: String,
        passphrase: Option<String>,
    },
    ExchangesDisconnect {
        name: String,
    },
    PairsCreate(PairConfig),
    PairsUpdate(PairConfig),
    PairsDelete {
        id: i64,
    },
    PairsStart {
        id: i64,
    },
    PairsPause {
        id: i64,
    },
    BlacklistAdd {
        symbol: String,
        reason: String,
    },
    BlacklistRemove {
        symbol: String,
    },
    StatsReset,
    NotificationsClear,
    SettingsUpdate(Settings),
}

struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Ties the whole engine together.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    vault: Arc<Vault>,
    metrics: Arc<Metrics>,
    stats: Arc<StatsAggregate>,
    adapter_factory: AdapterFactory,
    gateways: RwLock<HashMap<String, Arc<VenueGateway>>>,
    engines: Mutex<HashMap<i64, EngineHandle>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<Hub>,
        vault: Arc<Vault>,
        metrics: Arc<Metrics>,
        stats: Arc<StatsAggregate>,
        adapter_factory: AdapterFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            vault,
            metrics,
            stats,
            adapter_factory,
            gateways: RwLock::new(HashMap::new()),
            engines: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ── Startup ─────────────────────────────────────────────────────────

    /// Rebuild gateways, spawn engines for active pairs, start the
    /// periodic fan-out loops.
    pub async fn start(self: &Arc<Self>) {
        self.stats.seed(&self.store.list_trades());

        for record in self.store.list_exchanges() {
            if record.connected {
                if let Err(e) = self.build_gateway(&record) {
                    warn!(venue = %record.name, error = %e, "gateway rebuild failed at startup");
                    self.store
                        .set_exchange_status(&record.name, false, Some(e.to_string()));
                }
            }
        }

        for config in self.store.list_pairs() {
            if config.status == PairStatus::Active {
                self.spawn_engine(config).await;
            }
        }

        self.spawn_balance_loop();
        self.spawn_stats_loop();
        info!(engines = self.engines.lock().len(), "orchestrator started");
    }

    // ── Commands ────────────────────────────────────────────────────────

    pub async fn handle_command(self: &Arc<Self>, command: Command) -> Result<()> {
        match command {
            Command::ExchangesConnect {
                name,
                api_key,
                api_secret,
                passphrase,
            } => self.connect_exchange(&name, &api_key, &api_secret, passphrase.as_deref()),

            Command::ExchangesDisconnect { name } => {
                self.disconnect_exchange(&name).await;
                Ok(())
            }

            Command::PairsCreate(mut config) => {
                config.validate()?;
                config.id = self.store.upsert_pair(config.clone());
                if config.status == PairStatus::Active {
                    self.spawn_engine(config).await;
                }
                Ok(())
            }

            Command::PairsUpdate(config) => {
                config.validate()?;
                if self.store.get_pair(config.id).is_none() {
                    return Err(EngineError::Validation(format!(
                        "pair {} does not exist",
                        config.id
                    )));
                }
                self.store.upsert_pair(config.clone());
                // Updates re-seed: stop, then start fresh on the new config.
                self.stop_engine(config.id).await;
                if config.status == PairStatus::Active {
                    self.spawn_engine(config).await;
                }
                Ok(())
            }

            Command::PairsDelete { id } => {
                self.stop_engine(id).await;
                self.store.delete_pair(id);
                Ok(())
            }

            Command::PairsStart { id } => {
                let Some(mut config) = self.store.get_pair(id) else {
                    return Err(EngineError::Validation(format!("pair {id} does not exist")));
                };
                config.status = PairStatus::Active;
                self.store.set_pair_status(id, PairStatus::Active);

                let started = {
                    let engines = self.engines.lock();
                    match engines.get(&id) {
                        Some(handle) => handle.tx.try_send(EngineCommand::Start).is_ok(),
                        None => false,
                    }
                };
                if !started {
                    self.spawn_engine(config).await;
                }
                Ok(())
            }

            Command::PairsPause { id } => {
                self.store.set_pair_status(id, PairStatus::Paused);
                let engines = self.engines.lock();
                if let Some(handle) = engines.get(&id) {
                    let _ = handle.tx.try_send(EngineCommand::Pause);
                }
                Ok(())
            }

            Command::BlacklistAdd { symbol, reason } => {
                if !self.store.blacklist_add(BlacklistEntry {
                    symbol: symbol.clone(),
                    reason,
                }) {
                    return Err(EngineError::Validation(format!(
                        "symbol {symbol} already blacklisted"
                    )));
                }
                Ok(())
            }

            Command::BlacklistRemove { symbol } => {
                self.store.blacklist_remove(&symbol);
                Ok(())
            }

            Command::StatsReset => {
                self.stats.reset();
                self.hub
                    .broadcast(&messages::stats_update(&self.stats.snapshot(Utc::now())));
                Ok(())
            }

            Command::NotificationsClear => {
                self.store.clear_notifications();
                Ok(())
            }

            Command::SettingsUpdate(settings) => {
                self.store.update_settings(settings);
                Ok(())
            }
        }
    }

    // ── Exchanges ───────────────────────────────────────────────────────

    fn connect_exchange(
        &self,
        name: &str,
        api_key: &str,
        api_secret: &str,
        passphrase: Option<&str>,
    ) -> Result<()> {
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(EngineError::Validation(
                "api key and secret must be non-empty".into(),
            ));
        }

        let now = Utc::now();
        let record = ExchangeRecord {
            id: 0,
            name: name.to_string(),
            api_key_enc: self.vault.encrypt(api_key)?,
            secret_key_enc: self.vault.encrypt(api_secret)?,
            passphrase_enc: match passphrase {
                Some(p) => Some(self.vault.encrypt(p)?),
                None => None,
            },
            connected: true,
            balance: 0.0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.build_gateway(&record)?;
        self.store.upsert_exchange(record);
        info!(venue = name, "exchange connected");
        Ok(())
    }

    async fn disconnect_exchange(self: &Arc<Self>, name: &str) {
        self.gateways.write().remove(name);
        self.store.set_exchange_status(name, false, None);

        // Pause every pair that depends on the gone venue.
        let affected: Vec<i64> = self
            .store
            .list_pairs()
            .into_iter()
            .filter(|p| p.venue_a == name || p.venue_b == name)
            .map(|p| p.id)
            .collect();
        for id in affected {
            self.store.set_pair_status(id, PairStatus::Paused);
            let engines = self.engines.lock();
            if let Some(handle) = engines.get(&id) {
                let _ = handle.tx.try_send(EngineCommand::Pause);
            }
        }
        info!(venue = name, "exchange disconnected");
    }

    fn build_gateway(&self, record: &ExchangeRecord) -> Result<()> {
        let adapter = (self.adapter_factory)(&record.name).ok_or_else(|| {
            EngineError::Validation(format!("unsupported venue '{}'", record.name))
        })?;

        let creds = EncryptedCredentials {
            api_key_enc: record.api_key_enc.clone(),
            api_secret_enc: record.secret_key_enc.clone(),
            passphrase_enc: record.passphrase_enc.clone(),
        };
        let gateway = Arc::new(VenueGateway::new(
            adapter,
            self.vault.clone(),
            creds,
            self.metrics.clone(),
        ));
        self.gateways.write().insert(record.name.clone(), gateway);
        Ok(())
    }

    pub fn gateway(&self, name: &str) -> Option<Arc<VenueGateway>> {
        self.gateways.read().get(name).cloned()
    }

    // ── Engines ─────────────────────────────────────────────────────────

    /// Validate and spawn one pair engine. Failures park the pair with a
    /// PAUSE notification instead of propagating.
    pub async fn spawn_engine(self: &Arc<Self>, config: PairConfig) {
        let pair_id = config.id;

        if let Err(e) = config.validate() {
            self.park_pair(pair_id, format!("invalid configuration: {e}"));
            return;
        }
        if self.store.blacklist_contains(config.symbol.as_str()) {
            self.park_pair(pair_id, format!("symbol {} is blacklisted", config.symbol));
            return;
        }
        let (Some(gateway_a), Some(gateway_b)) =
            (self.gateway(&config.venue_a), self.gateway(&config.venue_b))
        else {
            self.park_pair(pair_id, "venue gateway missing or disconnected".to_string());
            return;
        };

        if self.engines.lock().contains_key(&pair_id) {
            debug!(pair_id, "engine already running — skipping spawn");
            return;
        }

        // Lot step and fees come from venue metadata at engine start.
        let symbol = config.symbol.as_str().to_string();
        let meta_a = self
            .fetch_meta(&gateway_a, &symbol)
            .await
            .unwrap_or_default();
        let meta_b = self
            .fetch_meta(&gateway_b, &symbol)
            .await
            .unwrap_or_default();

        let cancel = self.cancel.child_token();
        let engine = Arc::new(PairEngine::new(
            config,
            gateway_a,
            gateway_b,
            meta_a,
            meta_b,
            self.hub.clone(),
            self.store.clone(),
            self.stats.clone(),
            self.metrics.clone(),
            cancel.clone(),
        ));

        let (tx, rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let join = tokio::spawn(engine.clone().run(rx));
        let _ = tx.try_send(EngineCommand::Start);

        self.engines
            .lock()
            .insert(pair_id, EngineHandle { tx, cancel, join });
        info!(pair_id, "pair engine spawned");
    }

    async fn fetch_meta(&self, gateway: &Arc<VenueGateway>, symbol: &str) -> Option<SymbolMeta> {
        match gateway.symbol_meta(symbol, &self.cancel).await {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(venue = gateway.name(), symbol, error = %e, "metadata fetch failed — using defaults");
                None
            }
        }
    }

    /// Stop one engine and wait for it to flatten within its budget.
    pub async fn stop_engine(&self, pair_id: i64) {
        let Some(handle) = self.engines.lock().remove(&pair_id) else {
            return;
        };
        let _ = handle.tx.try_send(EngineCommand::Shutdown);
        drop(handle.tx);

        match tokio::time::timeout(ENGINE_SHUTDOWN_BUDGET, handle.join).await {
            Ok(_) => debug!(pair_id, "engine stopped"),
            Err(_) => {
                warn!(pair_id, "engine overshot shutdown budget — cancelling");
                handle.cancel.cancel();
            }
        }
    }

    fn park_pair(&self, pair_id: i64, reason: String) {
        warn!(pair_id, reason = %reason, "pair parked");
        self.store.set_pair_status(pair_id, PairStatus::Paused);
        let n = Notification::new(
            NotificationKind::Pause,
            Severity::Warn,
            Some(pair_id),
            reason,
        );
        let stored = self.store.insert_notification(n);
        self.hub.broadcast(&messages::notification(&stored));
    }

    pub fn engine_count(&self) -> usize {
        self.engines.lock().len()
    }

    // ── Periodic fan-outs ───────────────────────────────────────────────

    fn spawn_balance_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BALANCE_POLL_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = interval.tick() => this.poll_balances().await,
                }
            }
        });
    }

    async fn poll_balances(&self) {
        let gateways: Vec<Arc<VenueGateway>> = self.gateways.read().values().cloned().collect();
        if gateways.is_empty() {
            return;
        }

        let mut balances: HashMap<String, f64> = HashMap::new();
        for gateway in gateways {
            match gateway.balance("USDT", &self.cancel).await {
                Ok(balance) => {
                    self.store
                        .set_exchange_balance(gateway.name(), balance.total);
                    self.hub
                        .broadcast(&messages::balance_update(gateway.name(), balance.total));
                    balances.insert(gateway.name().to_string(), balance.total);
                }
                Err(e) => {
                    debug!(venue = gateway.name(), error = %e, "balance poll failed");
                    self.store
                        .set_exchange_status(gateway.name(), true, Some(e.to_string()));
                }
            }
        }
        if !balances.is_empty() {
            self.hub.broadcast(&messages::balance_snapshot(&balances));
        }
    }

    fn spawn_stats_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if this.stats.take_dirty() {
                            let snapshot = this.stats.snapshot(Utc::now());
                            this.hub.broadcast(&messages::stats_update(&snapshot));
                        }
                    }
                }
            }
        });
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Flatten everything and release resources inside the deadline.
    pub async fn shutdown(&self) {
        info!("orchestrator shutdown started");

        let drained: Vec<(i64, EngineHandle)> = self.engines.lock().drain().collect();
        let result = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
            for (_, handle) in &drained {
                let _ = handle.tx.try_send(EngineCommand::Shutdown);
            }
            for (pair_id, handle) in drained {
                drop(handle.tx);
                match tokio::time::timeout(ENGINE_SHUTDOWN_BUDGET, handle.join).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(pair_id, "engine overshot flatten budget — cancelling");
                        handle.cancel.cancel();
                    }
                }
            }
        })
        .await;
        if result.is_err() {
            error!("shutdown deadline exceeded — engines cancelled hard");
            self.cancel.cancel();
        }

        self.cancel.cancel();
        self.hub.stop();
        self.gateways.write().clear();

        let snapshot = self.metrics.snapshot();
        info!(
            transitions = snapshot.transitions.len(),
            hub_dropped = snapshot.hub_dropped_messages,
            "orchestrator shutdown complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper::PaperVenue;
    use crate::storage::MemoryStore;
    use crate::types::Symbol;

    fn paper_factory() -> AdapterFactory {
        Box::new(|name: &str| {
            let venue = Arc::new(PaperVenue::new(name));
            venue.set_book("BTCUSDT", &[(100.0, 100.0)], &[(100.0, 100.0)]);
            venue.set_balance("USDT", 5_000.0, 5_000.0);
            Some(venue as Arc<dyn VenueAdapter>)
        })
    }

    fn orchestrator() -> (Arc<Orchestrator>, Arc<MemoryStore>, Arc<Hub>) {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new(metrics.clone());
        let vault = Arc::new(Vault::new(&[3u8; 32]).unwrap());
        let stats = Arc::new(StatsAggregate::new());
        let orch = Orchestrator::new(
            store.clone(),
            hub.clone(),
            vault,
            metrics,
            stats,
            paper_factory(),
        );
        (orch, store, hub)
    }

    fn pair_config(status: PairStatus) -> PairConfig {
        PairConfig {
            id: 0,
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            venue_a: "bybit".into(),
            venue_b: "okx".into(),
            entry_spread_pct: 1.0,
            exit_spread_pct: 0.2,
            volume: 1.0,
            n_orders: 4,
            stop_loss_pct: None,
            leverage: None,
            status,
        }
    }

    async fn connect_both(orch: &Arc<Orchestrator>) {
        for venue in ["bybit", "okx"] {
            orch.handle_command(Command::ExchangesConnect {
                name: venue.into(),
                api_key: "key".into(),
                api_secret: "secret".into(),
                passphrase: None,
            })
            .await
            .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_stores_ciphertext_only() {
        let (orch, store, _) = orchestrator();
        connect_both(&orch).await;

        let record = store.get_exchange("bybit").unwrap();
        assert!(record.connected);
        assert_ne!(record.api_key_enc, "key");
        assert_ne!(record.secret_key_enc, "secret");
        assert!(orch.gateway("bybit").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn create_active_pair_spawns_engine() {
        let (orch, _store, _) = orchestrator();
        connect_both(&orch).await;

        orch.handle_command(Command::PairsCreate(pair_config(PairStatus::Active)))
            .await
            .unwrap();
        assert_eq!(orch.engine_count(), 1);

        orch.shutdown().await;
        assert_eq!(orch.engine_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_pair_config_rejected_at_ingress() {
        let (orch, _store, _) = orchestrator();
        connect_both(&orch).await;

        let mut bad = pair_config(PairStatus::Active);
        bad.exit_spread_pct = 2.0; // exit above entry
        let out = orch.handle_command(Command::PairsCreate(bad)).await;
        assert!(matches!(out, Err(EngineError::Validation(_))));
        assert_eq!(orch.engine_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blacklisted_pair_is_parked_with_notification() {
        let (orch, store, _) = orchestrator();
        connect_both(&orch).await;

        store.blacklist_add(BlacklistEntry {
            symbol: "BTCUSDT".into(),
            reason: "manipulated".into(),
        });
        let id = store.upsert_pair(pair_config(PairStatus::Active));

        orch.start().await;
        assert_eq!(orch.engine_count(), 0);
        assert_eq!(store.get_pair(id).unwrap().status, PairStatus::Paused);
        let notes = store.recent_notifications(5);
        assert!(notes.iter().any(|n| n.kind == NotificationKind::Pause));

        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_gateway_parks_pair() {
        let (orch, store, _) = orchestrator();
        // Only one venue connected.
        orch.handle_command(Command::ExchangesConnect {
            name: "bybit".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
            passphrase: None,
        })
        .await
        .unwrap();

        let id = store.upsert_pair(pair_config(PairStatus::Active));
        orch.start().await;

        assert_eq!(orch.engine_count(), 0);
        assert_eq!(store.get_pair(id).unwrap().status, PairStatus::Paused);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pair_update_restarts_engine() {
        let (orch, store, _) = orchestrator();
        connect_both(&orch).await;

        orch.handle_command(Command::PairsCreate(pair_config(PairStatus::Active)))
            .await
            .unwrap();
        let id = store.list_pairs()[0].id;

        let mut updated = store.get_pair(id).unwrap();
        updated.entry_spread_pct = 2.5;
        orch.handle_command(Command::PairsUpdate(updated))
            .await
            .unwrap();

        assert_eq!(orch.engine_count(), 1);
        assert_eq!(store.get_pair(id).unwrap().entry_spread_pct, 2.5);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_pauses_dependent_pairs() {
        let (orch, store, _) = orchestrator();
        connect_both(&orch).await;
        orch.handle_command(Command::PairsCreate(pair_config(PairStatus::Active)))
            .await
            .unwrap();
        let id = store.list_pairs()[0].id;

        orch.handle_command(Command::ExchangesDisconnect {
            name: "okx".into(),
        })
        .await
        .unwrap();

        assert!(orch.gateway("okx").is_none());
        assert_eq!(store.get_pair(id).unwrap().status, PairStatus::Paused);
        assert!(!store.get_exchange("okx").unwrap().connected);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reset_zeroes_aggregate() {
        let (orch, _store, _) = orchestrator();
        orch.stats.record_trade(&crate::types::TradeRecord {
            id: 0,
            pair_id: 1,
            symbol: "BTCUSDT".into(),
            exchanges: "bybit/okx".into(),
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            pnl: 5.0,
            was_stop_loss: false,
            was_liquidation: false,
        });

        orch.handle_command(Command::StatsReset).await.unwrap();
        assert_eq!(orch.stats.snapshot(Utc::now()).total_trades, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_pause_address_the_running_engine() {
        let (orch, store, _) = orchestrator();
        connect_both(&orch).await;

        // Created paused: no engine yet.
        orch.handle_command(Command::PairsCreate(pair_config(PairStatus::Paused)))
            .await
            .unwrap();
        assert_eq!(orch.engine_count(), 0);
        let id = store.list_pairs()[0].id;

        orch.handle_command(Command::PairsStart { id }).await.unwrap();
        assert_eq!(orch.engine_count(), 1);
        assert_eq!(store.get_pair(id).unwrap().status, PairStatus::Active);

        orch.handle_command(Command::PairsPause { id }).await.unwrap();
        assert_eq!(store.get_pair(id).unwrap().status, PairStatus::Paused);
        // The engine stays resident, parked, ready for the next start.
        assert_eq!(orch.engine_count(), 1);

        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_blacklist_add_rejected() {
        let (orch, _store, _) = orchestrator();
        orch.handle_command(Command::BlacklistAdd {
            symbol: "DOGEUSDT".into(),
            reason: "memes".into(),
        })
        .await
        .unwrap();
        let out = orch
            .handle_command(Command::BlacklistAdd {
                symbol: "DOGEUSDT".into(),
                reason: "still memes".into(),
            })
            .await;
        assert!(matches!(out, Err(EngineError::Validation(_))));
    }
}
