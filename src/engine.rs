// =============================================================================
// Pair Execution Engine — one long-running worker per configured pair
// =============================================================================
//
// The engine owns its PairRuntime behind a mutex and drives it through the
// lifecycle on a periodic tick: read both books, recompute spread and PnL,
// check the stop-loss, then dispatch on the current state. Entry places a
// slice as two simultaneous market orders with a shared deadline; exit
// mirrors the position out in reduceOnly slices.
//
// Lock discipline: the runtime mutex is held for in-memory work only. Every
// network call happens with the mutex released, against a snapshot taken
// before the call, and the state is re-checked when the result lands.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::gateway::{CancelOutcome, OrderAck, OrderRequest, SymbolMeta, VenueGateway};
use crate::hub::{messages, Hub};
use crate::math;
use crate::metrics::Metrics;
use crate::state_machine::{self, PairState};
use crate::stats::StatsAggregate;
use crate::storage::Store;
use crate::types::{
    Notification, NotificationKind, OrderRecord, PairConfig, PairRuntime, Severity, Side,
    TradeRecord,
};

/// Tick period while idle, READY or HOLDING.
const PASSIVE_TICK: Duration = Duration::from_secs(1);
/// Tick period while actively working an entry or exit.
const ACTIVE_TICK: Duration = Duration::from_millis(200);
/// Shared deadline for the two legs of one slice.
const LEG_FILL_WINDOW: Duration = Duration::from_secs(2);
/// Short window for the post-timeout idempotent re-check.
const FILL_RECHECK_WINDOW: Duration = Duration::from_millis(500);
/// Book depth requested per tick; comfortably covers several slices.
const BOOK_DEPTH: usize = 25;
/// Passive pair updates are throttled to one per this interval.
const PUBLISH_MIN_INTERVAL: Duration = Duration::from_millis(250);
/// Unrealized PnL move (as a fraction of notional) that forces a publish.
const PUBLISH_PNL_STEP: f64 = 0.001;
/// Grace the emergency-unwind reconciler allows before flagging.
const UNWIND_VERIFY_DELAY: Duration = Duration::from_secs(5);

/// Control commands delivered by the orchestrator.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Start,
    Pause,
    Update(PairConfig),
    Shutdown,
}

struct PublishState {
    last_at: Instant,
    last_state: PairState,
    last_pnl: f64,
    last_spread: f64,
}

/// One pair's execution worker.
pub struct PairEngine {
    config: Mutex<PairConfig>,
    gateway_a: Arc<VenueGateway>,
    gateway_b: Arc<VenueGateway>,
    meta_a: SymbolMeta,
    meta_b: SymbolMeta,
    /// Coarser of the two venue lot steps, so slices stay symmetric.
    lot_step: f64,
    runtime: Mutex<PairRuntime>,
    hub: Arc<Hub>,
    store: Arc<dyn Store>,
    stats: Arc<StatsAggregate>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    /// When set, the engine parks in PAUSED instead of READY once flat.
    pause_when_flat: AtomicBool,
    entry_time: Mutex<Option<DateTime<Utc>>>,
    publish: Mutex<PublishState>,
}

impl PairEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PairConfig,
        gateway_a: Arc<VenueGateway>,
        gateway_b: Arc<VenueGateway>,
        meta_a: SymbolMeta,
        meta_b: SymbolMeta,
        hub: Arc<Hub>,
        store: Arc<dyn Store>,
        stats: Arc<StatsAggregate>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        let runtime = PairRuntime::new(config.id, gateway_a.name(), gateway_b.name());
        let lot_step = meta_a.lot_step.max(meta_b.lot_step);
        Self {
            config: Mutex::new(config),
            gateway_a,
            gateway_b,
            meta_a,
            meta_b,
            lot_step,
            runtime: Mutex::new(runtime),
            hub,
            store,
            stats,
            metrics,
            cancel,
            pause_when_flat: AtomicBool::new(false),
            entry_time: Mutex::new(None),
            publish: Mutex::new(PublishState {
                last_at: Instant::now(),
                last_state: PairState::Paused,
                last_pnl: 0.0,
                last_spread: 0.0,
            }),
        }
    }

    pub fn pair_id(&self) -> i64 {
        self.config.lock().id
    }

    pub fn state(&self) -> PairState {
        self.runtime.lock().state
    }

    pub fn runtime_snapshot(&self) -> PairRuntime {
        self.runtime.lock().clone()
    }

    // ── Main loop ───────────────────────────────────────────────────────

    /// Run until shutdown. The control channel delivers operator commands;
    /// everything else happens on the tick.
    pub async fn run(self: Arc<Self>, mut control_rx: mpsc::Receiver<EngineCommand>) {
        info!(pair_id = self.pair_id(), "pair engine started");

        loop {
            let period = if matches!(self.state(), PairState::Entering | PairState::Exiting) {
                ACTIVE_TICK
            } else {
                PASSIVE_TICK
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.flatten_on_shutdown().await;
                    break;
                }
                cmd = control_rx.recv() => {
                    match cmd {
                        None | Some(EngineCommand::Shutdown) => {
                            self.flatten_on_shutdown().await;
                            break;
                        }
                        Some(EngineCommand::Start) => self.handle_start(),
                        Some(EngineCommand::Pause) => self.handle_pause().await,
                        Some(EngineCommand::Update(cfg)) => self.handle_update(cfg).await,
                    }
                }
                _ = tokio::time::sleep(period) => {
                    self.safe_tick().await;
                }
            }
        }

        info!(pair_id = self.pair_id(), "pair engine stopped");
    }

    /// Tick with a panic boundary: a panicking tick becomes an ERROR
    /// notification, never a dead process.
    async fn safe_tick(&self) {
        if std::panic::AssertUnwindSafe(self.tick())
            .catch_unwind()
            .await
            .is_err()
        {
            error!(pair_id = self.pair_id(), "tick panicked — pair moved to ERROR");
            {
                let mut rt = self.runtime.lock();
                state_machine::force_transition(&mut rt, PairState::Error, &self.metrics);
            }
            self.notify(
                NotificationKind::Error,
                Severity::Error,
                "internal error in pair engine tick".to_string(),
            );
            self.publish_update(true);
        }
    }

    // ── Control commands ────────────────────────────────────────────────

    pub(crate) fn handle_start(&self) {
        let mut rt = self.runtime.lock();
        if rt.state == PairState::Paused {
            if state_machine::try_transition(&mut rt, PairState::Ready, &self.metrics).is_ok() {
                self.pause_when_flat.store(false, Ordering::Relaxed);
            }
        } else {
            debug!(pair_id = rt.pair_id, state = %rt.state, "start ignored in current state");
        }
        drop(rt);
        self.publish_update(true);
    }

    /// Pause is idempotent. With no exposure the engine parks immediately;
    /// with exposure it flattens first and parks once flat.
    pub(crate) async fn handle_pause(&self) {
        #[derive(PartialEq)]
        enum PauseAction {
            Nothing,
            Parked,
            Flattening,
        }

        let action = {
            let mut rt = self.runtime.lock();
            match rt.state {
                PairState::Paused => PauseAction::Nothing,
                PairState::Ready | PairState::Error => {
                    // ERROR only leaves via this manual reset.
                    let _ = state_machine::try_transition(&mut rt, PairState::Paused, &self.metrics);
                    PauseAction::Parked
                }
                PairState::Entering | PairState::Holding => {
                    self.pause_when_flat.store(true, Ordering::Relaxed);
                    let _ =
                        state_machine::try_transition(&mut rt, PairState::Exiting, &self.metrics);
                    PauseAction::Flattening
                }
                PairState::Exiting => {
                    self.pause_when_flat.store(true, Ordering::Relaxed);
                    PauseAction::Nothing
                }
            }
        };

        if action == PauseAction::Flattening {
            // Kick the unwind immediately rather than waiting for the tick.
            self.run_exit_step().await;
        }
        if action != PauseAction::Nothing {
            self.notify(
                NotificationKind::Pause,
                Severity::Info,
                "pair paused by operator".to_string(),
            );
            self.publish_update(true);
        }
    }

    /// Replace the configuration: flatten if exposed, reset the runtime,
    /// then resume according to the new status.
    pub(crate) async fn handle_update(&self, new_config: PairConfig) {
        info!(pair_id = new_config.id, "pair configuration update — restarting engine state");
        self.handle_pause().await;

        // Wait for flatness bounded by the per-engine budget.
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.state() == PairState::Exiting && Instant::now() < deadline {
            self.run_exit_step().await;
        }

        {
            let mut cfg = self.config.lock();
            *cfg = new_config;
        }
        let active = { self.config.lock().status == crate::types::PairStatus::Active };
        if active {
            self.pause_when_flat.store(false, Ordering::Relaxed);
            self.handle_start();
        }
    }

    async fn flatten_on_shutdown(&self) {
        if !self.state().has_open_position() {
            return;
        }
        info!(pair_id = self.pair_id(), "shutdown with open position — flattening");
        self.pause_when_flat.store(true, Ordering::Relaxed);
        {
            let mut rt = self.runtime.lock();
            if rt.state != PairState::Exiting {
                let _ = state_machine::try_transition(&mut rt, PairState::Exiting, &self.metrics);
            }
        }

        let budget = Instant::now() + Duration::from_secs(10);
        while self.state() == PairState::Exiting && Instant::now() < budget {
            self.run_exit_step().await;
        }

        if self.state() == PairState::Exiting {
            let rt = self.runtime.lock();
            warn!(
                pair_id = rt.pair_id,
                qty_a = rt.leg_a.quantity,
                qty_b = rt.leg_b.quantity,
                "flatten budget exhausted — exposure remains"
            );
        }
    }

    // ── Tick pipeline ───────────────────────────────────────────────────

    pub(crate) async fn tick(&self) {
        // 1. Top of book on both venues, outside the lock.
        let symbol = { self.config.lock().symbol.as_str().to_string() };
        let (book_a, book_b) = tokio::join!(
            self.gateway_a.order_book(&symbol, BOOK_DEPTH, &self.cancel),
            self.gateway_b.order_book(&symbol, BOOK_DEPTH, &self.cancel),
        );
        let (book_a, book_b) = match (book_a, book_b) {
            (Ok(a), Ok(b)) => (a, b),
            (a, b) => {
                if let Err(e) = a.and(b) {
                    debug!(pair_id = self.pair_id(), error = %e, "book fetch failed — skipping tick");
                }
                return;
            }
        };
        let (Some(mid_a), Some(mid_b)) = (book_a.mid(), book_b.mid()) else {
            debug!(pair_id = self.pair_id(), "one-sided book — skipping tick");
            return;
        };

        // 2–3. Spread, marks, PnL under the lock.
        let (raw_spread, net, sl_hit, state) = {
            let cfg = self.config.lock();
            let mut rt = self.runtime.lock();

            let raw = math::spread_from_prices(mid_a, mid_b);
            let net = math::net_spread(raw, self.meta_a.taker_fee, self.meta_b.taker_fee);
            rt.current_spread = net;

            rt.leg_a.mark_price = mid_a;
            rt.leg_b.mark_price = mid_b;
            rt.leg_a.unrealized_pnl = math::pnl(
                rt.leg_a.side,
                rt.leg_a.entry_price,
                mid_a,
                rt.leg_a.quantity,
            );
            rt.leg_b.unrealized_pnl = math::pnl(
                rt.leg_b.side,
                rt.leg_b.entry_price,
                mid_b,
                rt.leg_b.quantity,
            );
            rt.unrealized_pnl = rt.leg_a.unrealized_pnl + rt.leg_b.unrealized_pnl;
            rt.touch();

            let sl_abs = cfg.stop_loss_abs(mid_a);
            let sl_hit = rt.state.has_open_position()
                && math::is_sl_hit(rt.unrealized_pnl + rt.realized_pnl, sl_abs);
            (raw, net, sl_hit, rt.state)
        };

        // 4. Stop-loss overrides everything.
        if sl_hit {
            self.emergency_unwind(NotificationKind::Sl).await;
            self.publish_update(true);
            return;
        }

        // 5. State dispatch.
        match state {
            PairState::Ready => self.run_ready_step(net).await,
            PairState::Entering => self.run_entry_step(mid_a, mid_b).await,
            PairState::Holding => {
                let exit_pct = { self.config.lock().exit_spread_pct };
                if math::should_exit(raw_spread, exit_pct) {
                    let mut rt = self.runtime.lock();
                    let _ = state_machine::try_transition(&mut rt, PairState::Exiting, &self.metrics);
                }
            }
            PairState::Exiting => self.run_exit_step().await,
            PairState::Paused | PairState::Error => {}
        }

        // 6. Throttled publication.
        self.publish_update(false);
    }

    // ── READY: entry gate ───────────────────────────────────────────────

    async fn run_ready_step(&self, net_spread: f64) {
        let (entry_pct, symbol) = {
            let cfg = self.config.lock();
            (cfg.entry_spread_pct, cfg.symbol.as_str().to_string())
        };
        if !math::is_spread_sufficient(net_spread, entry_pct) {
            return;
        }
        if self.store.blacklist_contains(&symbol) {
            debug!(pair_id = self.pair_id(), symbol = %symbol, "entry suppressed — symbol blacklisted");
            return;
        }

        let mut rt = self.runtime.lock();
        if rt.state == PairState::Ready {
            let _ = state_machine::try_transition(&mut rt, PairState::Entering, &self.metrics);
        }
    }

    // ── ENTERING: one slice per step ────────────────────────────────────

    async fn run_entry_step(&self, mid_a: f64, mid_b: f64) {
        // Snapshot everything the slice needs, then release the lock.
        let snapshot = {
            let cfg = self.config.lock();
            let rt = self.runtime.lock();
            if rt.state != PairState::Entering {
                return;
            }
            let slices = math::split_volume(cfg.volume, cfg.n_orders, self.lot_step);
            let index = rt.filled_parts as usize;
            let qty = slices.get(index).copied().unwrap_or(0.0);
            // The hedge direction is pinned by the first slice of a
            // position; later slices reuse it even if the spread crosses
            // mid-entry. Re-deriving from live mids would let one leg
            // accumulate fills on both sides.
            let long_is_a = if rt.leg_a.is_flat() && rt.leg_b.is_flat() {
                mid_a <= mid_b
            } else {
                rt.leg_a.side == Side::Long
            };
            (
                cfg.symbol.as_str().to_string(),
                cfg.n_orders,
                rt.filled_parts,
                qty,
                long_is_a,
            )
        };
        let (symbol, n_orders, filled_parts, qty, long_is_a) = snapshot;

        if qty <= 0.0 {
            warn!(
                pair_id = self.pair_id(),
                lot_step = self.lot_step,
                "slice quantizes to zero — pausing pair"
            );
            self.notify(
                NotificationKind::Error,
                Severity::Error,
                "slice volume quantizes to zero for venue lot step".to_string(),
            );
            self.park_via_ready();
            return;
        }

        // Cheap venue goes long, expensive venue goes short — decided on
        // the first slice, held for the rest of the position.
        let (long_gw, short_gw) = if long_is_a {
            (&self.gateway_a, &self.gateway_b)
        } else {
            (&self.gateway_b, &self.gateway_a)
        };

        let long_req = OrderRequest {
            symbol: symbol.clone(),
            side: Side::Long,
            qty,
            price: None,
            reduce_only: false,
            idempotency_key: Uuid::new_v4().to_string(),
        };
        let short_req = OrderRequest {
            symbol: symbol.clone(),
            side: Side::Short,
            qty,
            price: None,
            reduce_only: false,
            idempotency_key: Uuid::new_v4().to_string(),
        };

        // Simultaneous placement under one shared deadline.
        let (long_out, short_out) = tokio::join!(
            timeout(LEG_FILL_WINDOW, long_gw.place_order(&long_req, &self.cancel)),
            timeout(LEG_FILL_WINDOW, short_gw.place_order(&short_req, &self.cancel)),
        );
        let mut long_out = normalize_ack(flatten_timeout(long_out));
        let mut short_out = normalize_ack(flatten_timeout(short_out));

        // A transport failure may hide a fill: replay the same idempotency
        // key once — a deduplicating venue returns the original ack.
        if is_silent_fill_candidate(&long_out) {
            long_out = self.recheck_fill(long_gw, &long_req).await.or(long_out);
        }
        if is_silent_fill_candidate(&short_out) {
            short_out = self.recheck_fill(short_gw, &short_req).await.or(short_out);
        }

        match (long_out, short_out) {
            (Ok(long_ack), Ok(short_ack)) => {
                self.apply_slice_fill(long_gw, &long_req, &long_ack);
                self.apply_slice_fill(short_gw, &short_req, &short_ack);

                let mut rt = self.runtime.lock();
                if rt.state != PairState::Entering {
                    // Pause/shutdown landed while the orders were in flight;
                    // the exit path will unwind what just filled.
                    return;
                }
                rt.filled_parts += 1;
                let filled = rt.filled_parts;
                if filled_parts == 0 {
                    *self.entry_time.lock() = Some(Utc::now());
                }
                if filled >= n_orders {
                    let _ = state_machine::try_transition(&mut rt, PairState::Holding, &self.metrics);
                }
                drop(rt);

                if filled_parts == 0 {
                    self.notify(
                        NotificationKind::Open,
                        Severity::Info,
                        format!("entering hedge on {symbol}"),
                    );
                }
                self.publish_update(true);
            }

            (Ok(filled_ack), Err(other_err)) => {
                self.handle_one_leg_fill(long_gw, &long_req, &filled_ack, short_gw, &other_err)
                    .await;
            }
            (Err(other_err), Ok(filled_ack)) => {
                self.handle_one_leg_fill(short_gw, &short_req, &filled_ack, long_gw, &other_err)
                    .await;
            }

            (Err(e_long), Err(e_short)) => {
                self.handle_double_failure(&e_long, &e_short);
            }
        }
    }

    /// Replay an order with its original idempotency key to detect a fill
    /// hidden behind a transport error.
    async fn recheck_fill(
        &self,
        gateway: &Arc<VenueGateway>,
        req: &OrderRequest,
    ) -> Result<OrderAck> {
        match timeout(FILL_RECHECK_WINDOW, gateway.place_order(req, &self.cancel)).await {
            Ok(Ok(ack)) if ack.filled_qty > 0.0 => {
                info!(
                    pair_id = self.pair_id(),
                    venue = gateway.name(),
                    order_id = %ack.order_id,
                    "silent fill promoted after transport error"
                );
                Ok(ack)
            }
            Ok(Ok(_)) => Err(EngineError::Timeout("recheck returned no fill".into())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::Timeout("fill recheck timed out".into())),
        }
    }

    /// One leg filled, the other did not within the window. Cancel the
    /// filled side; if the cancel races a fill, exposure remains and the
    /// engine flattens through EXITING.
    async fn handle_one_leg_fill(
        &self,
        filled_gw: &Arc<VenueGateway>,
        filled_req: &OrderRequest,
        filled_ack: &OrderAck,
        failed_gw: &Arc<VenueGateway>,
        failed_err: &EngineError,
    ) {
        warn!(
            pair_id = self.pair_id(),
            filled_venue = filled_gw.name(),
            failed_venue = failed_gw.name(),
            error = %failed_err,
            "one-legged slice — cancelling the filled side"
        );

        let cancel_outcome = filled_gw
            .cancel_order(&filled_req.symbol, &filled_ack.order_id, &self.cancel)
            .await;

        match cancel_outcome {
            Ok(CancelOutcome::Cancelled) => {
                // No exposure. For permanent failures park the pair;
                // transient ones simply retry on the next active tick.
                self.journal_order(filled_gw.name(), filled_req, "cancelled");
                if failed_err.is_permanent() {
                    self.handle_permanent_entry_error(failed_err);
                }
            }
            Ok(CancelOutcome::AlreadyFilled) | Err(_) => {
                // Net exposure remains on the filled venue.
                self.apply_slice_fill(filled_gw, filled_req, filled_ack);
                {
                    let mut rt = self.runtime.lock();
                    rt.filled_parts += 1;
                    let _ = state_machine::try_transition(&mut rt, PairState::Exiting, &self.metrics);
                }
                self.notify_second_leg_fail(filled_gw.name(), failed_gw.name(), failed_err);
                self.publish_update(true);
            }
        }
    }

    fn handle_double_failure(&self, e_long: &EngineError, e_short: &EngineError) {
        let permanent = e_long.is_permanent() || e_short.is_permanent();
        debug!(
            pair_id = self.pair_id(),
            long_error = %e_long,
            short_error = %e_short,
            "both legs failed — no exposure"
        );
        if permanent {
            let err = if e_long.is_permanent() { e_long } else { e_short };
            self.handle_permanent_entry_error(err);
        }
        // Transient double failure: stay in ENTERING and retry next tick.
    }

    /// Permanent errors park the pair: rollback to READY (no exposure on
    /// this slice) and on through the legal edge to PAUSED.
    fn handle_permanent_entry_error(&self, err: &EngineError) {
        let (kind, severity, message) = match err {
            EngineError::InsufficientFunds(msg) => (
                NotificationKind::Margin,
                Severity::Error,
                format!("insufficient funds: {msg}"),
            ),
            EngineError::Auth(msg) => (
                NotificationKind::Error,
                Severity::Error,
                format!("venue authentication failed: {msg}"),
            ),
            other => (
                NotificationKind::Error,
                Severity::Error,
                format!("entry aborted: {other}"),
            ),
        };

        {
            let mut rt = self.runtime.lock();
            if rt.state == PairState::Entering && rt.filled_parts > 0 {
                // Earlier slices are live: flatten them before parking.
                self.pause_when_flat.store(true, Ordering::Relaxed);
                let _ = state_machine::try_transition(&mut rt, PairState::Exiting, &self.metrics);
            }
        }
        if self.state() != PairState::Exiting {
            self.park_via_ready();
        }
        self.notify(kind, severity, message);
        self.publish_update(true);
    }

    /// ENTERING -> READY -> PAUSED, both legal edges.
    fn park_via_ready(&self) {
        let mut rt = self.runtime.lock();
        if rt.state == PairState::Entering {
            let _ = state_machine::try_transition(&mut rt, PairState::Ready, &self.metrics);
        }
        if rt.state == PairState::Ready {
            let _ = state_machine::try_transition(&mut rt, PairState::Paused, &self.metrics);
        }
    }

    fn apply_slice_fill(&self, gateway: &Arc<VenueGateway>, req: &OrderRequest, ack: &OrderAck) {
        {
            let mut rt = self.runtime.lock();
            let leg = if rt.leg_a.venue == gateway.name() {
                &mut rt.leg_a
            } else {
                &mut rt.leg_b
            };
            leg.apply_fill(req.side, ack.avg_price, ack.filled_qty);
        }
        self.journal_order(gateway.name(), req, "filled");
    }

    fn journal_order(&self, venue: &str, req: &OrderRequest, status: &str) {
        self.store.insert_order(OrderRecord {
            id: 0,
            pair_id: self.pair_id(),
            exchange: venue.to_string(),
            side: req.side,
            quantity: req.qty,
            status: status.to_string(),
            created_at: Utc::now(),
        });
    }

    fn notify_second_leg_fail(&self, filled_venue: &str, failed_venue: &str, err: &EngineError) {
        let n = Notification::new(
            NotificationKind::SecondLegFail,
            Severity::Error,
            Some(self.pair_id()),
            format!("second leg failed on {failed_venue}; flattening {filled_venue}"),
        )
        .with_meta("error", serde_json::Value::String(err.to_string()));
        let stored = self.store.insert_notification(n);
        self.hub.broadcast(&messages::notification(&stored));
    }

    // ── EXITING: mirror out in slices ───────────────────────────────────

    async fn run_exit_step(&self) {
        let snapshot = {
            let cfg = self.config.lock();
            let rt = self.runtime.lock();
            if rt.state != PairState::Exiting {
                return;
            }
            let slices = math::split_volume(cfg.volume, cfg.n_orders, self.lot_step);
            let slice_qty = slices.first().copied().unwrap_or(0.0);
            (
                cfg.symbol.as_str().to_string(),
                slice_qty,
                rt.leg_a.clone(),
                rt.leg_b.clone(),
            )
        };
        let (symbol, slice_qty, leg_a, leg_b) = snapshot;

        // Already flat: settle the round trip.
        if leg_a.is_flat() && leg_b.is_flat() {
            self.settle_close(false, false).await;
            return;
        }

        let req_a = reduce_request(&symbol, &leg_a, exit_slice_qty(leg_a.quantity, slice_qty));
        let req_b = reduce_request(&symbol, &leg_b, exit_slice_qty(leg_b.quantity, slice_qty));

        let (out_a, out_b) = tokio::join!(
            place_optional(&self.gateway_a, req_a.as_ref(), &self.cancel),
            place_optional(&self.gateway_b, req_b.as_ref(), &self.cancel),
        );

        let flat = {
            let mut rt = self.runtime.lock();
            if rt.state != PairState::Exiting {
                return;
            }

            if let Some(Ok(ack)) = out_a.as_ref() {
                let realized =
                    math::pnl(rt.leg_a.side, rt.leg_a.entry_price, ack.avg_price, ack.filled_qty);
                rt.leg_a.reduce(ack.filled_qty);
                rt.realized_pnl += realized;
            }
            if let Some(Ok(ack)) = out_b.as_ref() {
                let realized =
                    math::pnl(rt.leg_b.side, rt.leg_b.entry_price, ack.avg_price, ack.filled_qty);
                rt.leg_b.reduce(ack.filled_qty);
                rt.realized_pnl += realized;
            }

            rt.touch();
            rt.leg_a.is_flat() && rt.leg_b.is_flat()
        };

        // Journal and log outside the runtime lock.
        let legs = [
            (self.gateway_a.name().to_string(), req_a, out_a),
            (self.gateway_b.name().to_string(), req_b, out_b),
        ];
        for (venue, req, out) in legs {
            match (req, out) {
                (Some(req), Some(Ok(_))) => self.journal_order(&venue, &req, "filled"),
                (Some(req), Some(Err(e))) => {
                    debug!(pair_id = self.pair_id(), venue = %venue, error = %e, "exit slice leg failed — retrying next tick");
                    self.journal_order(&venue, &req, "failed");
                }
                _ => {}
            }
        }

        if flat {
            self.settle_close(false, false).await;
        }
        self.publish_update(true);
    }

    /// Both legs flat: record the trade, notify, and park in READY or
    /// PAUSED depending on how the exit started.
    async fn settle_close(&self, was_stop_loss: bool, was_liquidation: bool) {
        let (pair_id, symbol, exchanges, realized) = {
            let cfg = self.config.lock();
            let rt = self.runtime.lock();
            (
                cfg.id,
                cfg.symbol.as_str().to_string(),
                format!("{}/{}", rt.leg_a.venue, rt.leg_b.venue),
                rt.realized_pnl,
            )
        };

        let entry_time = self.entry_time.lock().take().unwrap_or_else(Utc::now);
        let trade = TradeRecord {
            id: 0,
            pair_id,
            symbol: symbol.clone(),
            exchanges,
            entry_time,
            exit_time: Utc::now(),
            pnl: realized,
            was_stop_loss,
            was_liquidation,
        };
        self.store.insert_trade(trade.clone());
        self.stats.record_trade(&trade);

        {
            let mut rt = self.runtime.lock();
            let target = if self.pause_when_flat.swap(false, Ordering::Relaxed) {
                PairState::Paused
            } else {
                PairState::Ready
            };
            if rt.state == PairState::Exiting {
                let _ = state_machine::try_transition(&mut rt, target, &self.metrics);
            }
            // Realized PnL carries across round trips within one engine run.
        }

        if !was_stop_loss && !was_liquidation {
            self.notify(
                NotificationKind::Close,
                Severity::Info,
                format!("hedge closed on {symbol}, realized pnl {realized:.4}"),
            );
        }
        self.publish_update(true);
    }

    // ── Emergency unwind ────────────────────────────────────────────────

    /// Stop-loss / liquidation path: fire reduceOnly market closes on both
    /// legs without waiting, force the pair to PAUSED, and let a detached
    /// reconciler verify the fills actually landed.
    pub(crate) async fn emergency_unwind(&self, reason: NotificationKind) {
        let (symbol, leg_a, leg_b, realized, unrealized) = {
            let cfg = self.config.lock();
            let rt = self.runtime.lock();
            (
                cfg.symbol.as_str().to_string(),
                rt.leg_a.clone(),
                rt.leg_b.clone(),
                rt.realized_pnl,
                rt.unrealized_pnl,
            )
        };

        warn!(
            pair_id = self.pair_id(),
            realized,
            unrealized,
            "emergency unwind triggered"
        );

        let req_a = reduce_request(&symbol, &leg_a, leg_a.quantity);
        let req_b = reduce_request(&symbol, &leg_b, leg_b.quantity);

        // Fire-and-forget: the detached verification task reports missing
        // fills as LIQUIDATION.
        {
            let gateway_a = self.gateway_a.clone();
            let gateway_b = self.gateway_b.clone();
            let store = self.store.clone();
            let hub = self.hub.clone();
            let pair_id = self.pair_id();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let (out_a, out_b) = tokio::join!(
                    place_optional(&gateway_a, req_a.as_ref(), &cancel),
                    place_optional(&gateway_b, req_b.as_ref(), &cancel),
                );

                tokio::time::sleep(UNWIND_VERIFY_DELAY).await;

                let mut missing = Vec::new();
                if matches!(out_a, Some(Err(_))) {
                    missing.push(gateway_a.name().to_string());
                }
                if matches!(out_b, Some(Err(_))) {
                    missing.push(gateway_b.name().to_string());
                }
                if !missing.is_empty() {
                    error!(pair_id, venues = ?missing, "emergency unwind incomplete");
                    let n = Notification::new(
                        NotificationKind::Liquidation,
                        Severity::Error,
                        Some(pair_id),
                        format!("emergency unwind incomplete on {}", missing.join(", ")),
                    );
                    let stored = store.insert_notification(n);
                    hub.broadcast(&messages::notification(&stored));
                }
            });
        }

        // The book marks are the best estimate of the unwind fills.
        {
            let mut rt = self.runtime.lock();
            rt.realized_pnl += rt.unrealized_pnl;
            state_machine::force_transition(&mut rt, PairState::Paused, &self.metrics);
        }
        self.settle_emergency_trade(reason).await;

        let (kind, msg) = match reason {
            NotificationKind::Liquidation => (
                NotificationKind::Liquidation,
                format!("liquidation unwind on {symbol}"),
            ),
            _ => (
                NotificationKind::Sl,
                format!("stop loss hit on {symbol}, pnl {:.4}", realized + unrealized),
            ),
        };
        self.notify(kind, Severity::Error, msg);
    }

    async fn settle_emergency_trade(&self, reason: NotificationKind) {
        let (pair_id, symbol, exchanges, realized) = {
            let cfg = self.config.lock();
            let rt = self.runtime.lock();
            (
                cfg.id,
                cfg.symbol.as_str().to_string(),
                format!("{}/{}", rt.leg_a.venue, rt.leg_b.venue),
                rt.realized_pnl,
            )
        };
        let entry_time = self.entry_time.lock().take().unwrap_or_else(Utc::now);
        let trade = TradeRecord {
            id: 0,
            pair_id,
            symbol,
            exchanges,
            entry_time,
            exit_time: Utc::now(),
            pnl: realized,
            was_stop_loss: reason == NotificationKind::Sl,
            was_liquidation: reason == NotificationKind::Liquidation,
        };
        self.store.insert_trade(trade.clone());
        self.stats.record_trade(&trade);
    }

    // ── Publication ─────────────────────────────────────────────────────

    fn notify(&self, kind: NotificationKind, severity: Severity, message: String) {
        let n = Notification::new(kind, severity, Some(self.pair_id()), message);
        let stored = self.store.insert_notification(n);
        self.hub.broadcast(&messages::notification(&stored));
    }

    /// Publish a pairUpdate when something material changed, throttled to
    /// one per 250 ms for passive drift. Never blocks: the hub drops under
    /// overload.
    fn publish_update(&self, force: bool) {
        let rt = self.runtime.lock().clone();
        let mut publish = self.publish.lock();

        let notional = (rt.leg_a.quantity * rt.leg_a.mark_price).abs().max(1e-9);
        let material = force
            || rt.state != publish.last_state
            || (rt.unrealized_pnl - publish.last_pnl).abs() >= notional * PUBLISH_PNL_STEP;
        let drifted = (rt.current_spread - publish.last_spread).abs() > math::EPSILON
            || (rt.unrealized_pnl - publish.last_pnl).abs() > math::EPSILON;
        let now = Instant::now();

        let due = if material {
            true
        } else {
            drifted && now.saturating_duration_since(publish.last_at) >= PUBLISH_MIN_INTERVAL
        };
        if !due {
            return;
        }

        publish.last_at = now;
        publish.last_state = rt.state;
        publish.last_pnl = rt.unrealized_pnl;
        publish.last_spread = rt.current_spread;
        drop(publish);

        self.hub.broadcast(&messages::pair_update(&rt));
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn flatten_timeout(out: std::result::Result<Result<OrderAck>, tokio::time::error::Elapsed>) -> Result<OrderAck> {
    match out {
        Ok(inner) => inner,
        Err(_) => Err(EngineError::Timeout("leg fill window elapsed".into())),
    }
}

/// A slice leg only counts when the venue reports an actual fill; an ack
/// with zero executed quantity is a miss within the window.
fn normalize_ack(out: Result<OrderAck>) -> Result<OrderAck> {
    match out {
        Ok(ack) if ack.filled_qty <= 0.0 => {
            Err(EngineError::Timeout("order accepted but unfilled in window".into()))
        }
        other => other,
    }
}

/// A timeout or transport-shaped failure may hide a fill on the venue.
fn is_silent_fill_candidate(out: &Result<OrderAck>) -> bool {
    matches!(
        out,
        Err(EngineError::Timeout(_)) | Err(EngineError::Network(_))
    )
}

fn exit_slice_qty(remaining: f64, slice: f64) -> f64 {
    if slice <= 0.0 {
        remaining
    } else {
        remaining.min(slice)
    }
}

/// Mirror-side reduceOnly order for `qty` of the leg, or None when flat.
fn reduce_request(symbol: &str, leg: &crate::types::Leg, qty: f64) -> Option<OrderRequest> {
    if leg.is_flat() || qty <= 0.0 {
        return None;
    }
    Some(OrderRequest {
        symbol: symbol.to_string(),
        side: leg.side.opposite(),
        qty,
        price: None,
        reduce_only: true,
        idempotency_key: Uuid::new_v4().to_string(),
    })
}

async fn place_optional(
    gateway: &Arc<VenueGateway>,
    req: Option<&OrderRequest>,
    cancel: &CancellationToken,
) -> Option<Result<OrderAck>> {
    match req {
        Some(req) => Some(gateway.place_order(req, cancel).await),
        None => None,
    }
}
