// =============================================================================
// Metrics Registry — atomic counters behind a dependency-injected handle
// =============================================================================
//
// Created once at startup and handed to subsystems; tests build their own
// isolated instance. Counters are cheap to bump from any task and the
// whole registry serialises into a snapshot for diagnostics. Export wire
// formats are someone else's problem.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::state_machine::PairState;

/// Per-call-kind gateway statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CallStats {
    pub calls: u64,
    pub errors: u64,
    pub total_latency_ms: u64,
}

/// One `(from, to, forced)` transition counter for the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionCount {
    pub from: PairState,
    pub to: PairState,
    pub forced: bool,
    pub count: u64,
}

/// Serialisable snapshot of every counter in the registry.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub transitions: Vec<TransitionCount>,
    pub gateway_calls: HashMap<String, CallStats>,
    pub hub_dropped_messages: u64,
    pub hub_evicted_sessions: u64,
}

/// The process metrics registry.
pub struct Metrics {
    transitions: RwLock<HashMap<(PairState, PairState, bool), u64>>,
    gateway_calls: RwLock<HashMap<String, CallStats>>,
    hub_dropped: AtomicU64,
    hub_evicted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            transitions: RwLock::new(HashMap::new()),
            gateway_calls: RwLock::new(HashMap::new()),
            hub_dropped: AtomicU64::new(0),
            hub_evicted: AtomicU64::new(0),
        }
    }

    // ── State transitions ───────────────────────────────────────────────

    pub fn record_transition(&self, from: PairState, to: PairState, forced: bool) {
        *self
            .transitions
            .write()
            .entry((from, to, forced))
            .or_insert(0) += 1;
    }

    pub fn transition_count(&self, from: PairState, to: PairState, forced: bool) -> u64 {
        self.transitions
            .read()
            .get(&(from, to, forced))
            .copied()
            .unwrap_or(0)
    }

    // ── Gateway calls ───────────────────────────────────────────────────

    /// Record one gateway call. The key is `venue/call`, e.g.
    /// `bybit/place_order`.
    pub fn record_gateway_call(&self, venue: &str, call: &str, ok: bool, latency: Duration) {
        let mut calls = self.gateway_calls.write();
        let stats = calls.entry(format!("{venue}/{call}")).or_default();
        stats.calls += 1;
        if !ok {
            stats.errors += 1;
        }
        stats.total_latency_ms += latency.as_millis() as u64;
    }

    // ── Hub ─────────────────────────────────────────────────────────────

    pub fn record_hub_drop(&self) {
        self.hub_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hub_eviction(&self) {
        self.hub_evicted.fetch_add(1, Ordering::Relaxed);
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> MetricsSnapshot {
        let transitions = self
            .transitions
            .read()
            .iter()
            .map(|(&(from, to, forced), &count)| TransitionCount {
                from,
                to,
                forced,
                count,
            })
            .collect();

        MetricsSnapshot {
            transitions,
            gateway_calls: self.gateway_calls.read().clone(),
            hub_dropped_messages: self.hub_dropped.load(Ordering::Relaxed),
            hub_evicted_sessions: self.hub_evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("hub_dropped", &self.hub_dropped.load(Ordering::Relaxed))
            .field("hub_evicted", &self.hub_evicted.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_counters_are_labelled() {
        let m = Metrics::new();
        m.record_transition(PairState::Ready, PairState::Entering, false);
        m.record_transition(PairState::Ready, PairState::Entering, false);
        m.record_transition(PairState::Holding, PairState::Paused, true);

        assert_eq!(
            m.transition_count(PairState::Ready, PairState::Entering, false),
            2
        );
        assert_eq!(
            m.transition_count(PairState::Holding, PairState::Paused, true),
            1
        );
        // The forced label keeps counters distinct.
        assert_eq!(
            m.transition_count(PairState::Holding, PairState::Paused, false),
            0
        );
    }

    #[test]
    fn gateway_stats_accumulate() {
        let m = Metrics::new();
        m.record_gateway_call("bybit", "place_order", true, Duration::from_millis(12));
        m.record_gateway_call("bybit", "place_order", false, Duration::from_millis(30));

        let snap = m.snapshot();
        let stats = snap.gateway_calls.get("bybit/place_order").unwrap();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.total_latency_ms, 42);
    }
}
