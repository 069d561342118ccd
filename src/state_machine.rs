// =============================================================================
// Pair State Machine — six states, one fixed transition table
// =============================================================================
//
// Life-cycle:
//   PAUSED -> READY -> ENTERING -> HOLDING -> EXITING -> READY
//
// ENTERING may roll back to READY (no fills) or fail to ERROR. HOLDING may
// drop straight to PAUSED on stop-loss or liquidation. ERROR only leaves
// via a manual operator reset to PAUSED.
//
// `try_transition` is the only sanctioned mutation path; callers must hold
// the runtime mutex. `force_transition` bypasses the table and is reserved
// for liquidation and critical-error handling.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::metrics::Metrics;
use crate::types::PairRuntime;

/// The six lifecycle states of a pair engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairState {
    Paused,
    Ready,
    Entering,
    Holding,
    Exiting,
    Error,
}

impl PairState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paused => "PAUSED",
            Self::Ready => "READY",
            Self::Entering => "ENTERING",
            Self::Holding => "HOLDING",
            Self::Exiting => "EXITING",
            Self::Error => "ERROR",
        }
    }

    /// Engine is doing work (anything but PAUSED/ERROR).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ready | Self::Entering | Self::Holding | Self::Exiting)
    }

    /// Exposure may exist. ENTERING counts: orders are in flight the moment
    /// the state is entered.
    pub fn has_open_position(self) -> bool {
        matches!(self, Self::Entering | Self::Holding | Self::Exiting)
    }

    /// At least one slice has definitely filled.
    pub fn has_filled_position(self) -> bool {
        matches!(self, Self::Holding | Self::Exiting)
    }
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The fixed transition table. Everything not listed is illegal.
pub fn can_transition(from: PairState, to: PairState) -> bool {
    use PairState::*;
    match (from, to) {
        (Paused, Ready) => true,
        (Paused, _) => false,

        (Ready, Paused) | (Ready, Entering) => true,
        (Ready, _) => false,

        (Entering, Holding) | (Entering, Ready) | (Entering, Error) => true,
        (Entering, _) => false,

        (Holding, Exiting) | (Holding, Paused) | (Holding, Error) => true,
        (Holding, _) => false,

        (Exiting, Ready) | (Exiting, Paused) | (Exiting, Error) => true,
        (Exiting, _) => false,

        (Error, Paused) => true,
        (Error, _) => false,
    }
}

/// Attempt a legal transition. On an illegal edge the runtime is left
/// untouched, no counter is incremented, and `invalid_transition` is
/// returned for the caller to log and discard.
pub fn try_transition(runtime: &mut PairRuntime, to: PairState, metrics: &Metrics) -> Result<()> {
    let from = runtime.state;
    if !can_transition(from, to) {
        return Err(EngineError::InvalidTransition {
            pair_id: runtime.pair_id,
            from,
            to,
        });
    }
    apply(runtime, from, to, false, metrics);
    Ok(())
}

/// Bypass the table. Reserved for liquidation / critical-error paths; the
/// transition is counted with a `forced` label so dashboards can tell.
pub fn force_transition(runtime: &mut PairRuntime, to: PairState, metrics: &Metrics) {
    let from = runtime.state;
    if !can_transition(from, to) {
        warn!(
            pair_id = runtime.pair_id,
            from = %from,
            to = %to,
            "forced transition outside the table"
        );
    }
    apply(runtime, from, to, true, metrics);
}

fn apply(runtime: &mut PairRuntime, from: PairState, to: PairState, forced: bool, metrics: &Metrics) {
    runtime.state = to;
    runtime.touch();

    // PAUSED and READY hold no position by invariant.
    if matches!(to, PairState::Paused | PairState::Ready) && from != PairState::Paused {
        runtime.reset_position();
    }

    info!(
        pair_id = runtime.pair_id,
        from = %from,
        to = %to,
        forced,
        "state transition"
    );
    metrics.record_transition(from, to, forced);
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PairState; 6] = [
        PairState::Paused,
        PairState::Ready,
        PairState::Entering,
        PairState::Holding,
        PairState::Exiting,
        PairState::Error,
    ];

    fn runtime_in(state: PairState) -> PairRuntime {
        let mut rt = PairRuntime::new(1, "bybit", "okx");
        rt.state = state;
        rt
    }

    #[test]
    fn table_matches_specified_edges() {
        use PairState::*;
        let legal = [
            (Paused, Ready),
            (Ready, Paused),
            (Ready, Entering),
            (Entering, Holding),
            (Entering, Ready),
            (Entering, Error),
            (Holding, Exiting),
            (Holding, Paused),
            (Holding, Error),
            (Exiting, Ready),
            (Exiting, Paused),
            (Exiting, Error),
            (Error, Paused),
        ];

        for from in ALL {
            for to in ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    can_transition(from, to),
                    expected,
                    "({from}, {to}) should be {expected}"
                );
            }
        }
    }

    #[test]
    fn try_transition_succeeds_iff_in_table() {
        let metrics = Metrics::new();
        for from in ALL {
            for to in ALL {
                let mut rt = runtime_in(from);
                let out = try_transition(&mut rt, to, &metrics);
                if can_transition(from, to) {
                    assert!(out.is_ok());
                    assert_eq!(rt.state, to);
                } else {
                    assert!(out.is_err());
                    assert_eq!(rt.state, from, "failed transition must not mutate state");
                }
            }
        }
    }

    #[test]
    fn illegal_edge_reports_endpoints_and_skips_counter() {
        let metrics = Metrics::new();
        let mut rt = runtime_in(PairState::Holding);

        let err = try_transition(&mut rt, PairState::Ready, &metrics).unwrap_err();
        match err {
            EngineError::InvalidTransition { pair_id, from, to } => {
                assert_eq!(pair_id, 1);
                assert_eq!(from, PairState::Holding);
                assert_eq!(to, PairState::Ready);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            metrics.transition_count(PairState::Holding, PairState::Ready, false),
            0
        );
    }

    #[test]
    fn forced_transition_bypasses_table_and_labels_counter() {
        let metrics = Metrics::new();
        let mut rt = runtime_in(PairState::Holding);
        rt.filled_parts = 4;

        force_transition(&mut rt, PairState::Paused, &metrics);
        assert_eq!(rt.state, PairState::Paused);
        // Position zeroed on the PAUSED edge.
        assert_eq!(rt.filled_parts, 0);
        assert_eq!(
            metrics.transition_count(PairState::Holding, PairState::Paused, true),
            1
        );
        assert_eq!(
            metrics.transition_count(PairState::Holding, PairState::Paused, false),
            0
        );
    }

    #[test]
    fn derived_predicates() {
        assert!(!PairState::Paused.is_active());
        assert!(!PairState::Error.is_active());
        assert!(PairState::Ready.is_active());

        assert!(PairState::Entering.has_open_position());
        assert!(!PairState::Ready.has_open_position());

        assert!(PairState::Holding.has_filled_position());
        assert!(PairState::Exiting.has_filled_position());
        assert!(!PairState::Entering.has_filled_position());
    }
}
