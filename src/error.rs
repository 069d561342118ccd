// =============================================================================
// Engine error taxonomy — semantic kinds with retry classification
// =============================================================================
//
// Every component surfaces errors as values of this enum; nothing in the
// engine panics across a worker boundary. The retry coordinator consults
// `is_permanent` to decide whether another attempt is worthwhile: permanent
// errors short-circuit, everything else (including unknown venue errors) is
// treated as transient.
// =============================================================================

use thiserror::Error;

use crate::state_machine::PairState;

/// Semantic error kinds shared across the engine.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Bad operator input. Rejected at ingress; never reaches engines.
    #[error("validation: {0}")]
    Validation(String),

    /// Venue authentication or signature failure.
    #[error("auth: {0}")]
    Auth(String),

    /// Venue 429 or local bucket exhausted.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Timeout, connection reset, DNS — anything transport-shaped.
    #[error("network: {0}")]
    Network(String),

    /// A deadline expired on an I/O call.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Venue rejected the order for lack of margin/balance.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Illegal state-machine edge. Logged and discarded by callers.
    #[error("invalid transition for pair {pair_id}: {from} -> {to}")]
    InvalidTransition {
        pair_id: i64,
        from: PairState,
        to: PairState,
    },

    /// Credential vault could not open the sealed payload. Deliberately
    /// opaque: tamper is indistinguishable from a wrong key.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Vault key material is not exactly 32 bytes.
    #[error("invalid key length")]
    InvalidKey,

    /// Ciphertext is not valid base64 or is too short to contain a nonce.
    #[error("invalid ciphertext")]
    InvalidCiphertext,

    /// A fan-out queue was full; the message was dropped.
    #[error("hub overflow")]
    HubOverflow,

    /// The surrounding operation was cancelled (shutdown, pause).
    #[error("cancelled")]
    Cancelled,

    /// Venue-specific error that did not map onto a known kind.
    #[error("venue: {0}")]
    Venue(String),
}

impl EngineError {
    /// `true` for errors where another attempt cannot succeed.
    ///
    /// Unknown venue errors classify as transient: retrying a broken call
    /// wastes a little time, while not retrying a recoverable one drops a
    /// leg on the floor.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::Auth(_)
            | Self::InsufficientFunds(_)
            | Self::InvalidTransition { .. }
            | Self::DecryptionFailed
            | Self::InvalidKey
            | Self::InvalidCiphertext
            | Self::Cancelled => true,
            Self::RateLimited(_)
            | Self::Network(_)
            | Self::Timeout(_)
            | Self::HubOverflow
            | Self::Venue(_) => false,
        }
    }

    /// Inverse of [`is_permanent`](Self::is_permanent).
    pub fn is_transient(&self) -> bool {
        !self.is_permanent()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_is_permanent() {
        assert!(EngineError::Auth("bad signature".into()).is_permanent());
    }

    #[test]
    fn network_is_transient() {
        assert!(EngineError::Network("connection reset".into()).is_transient());
        assert!(EngineError::Timeout("deadline".into()).is_transient());
        assert!(EngineError::RateLimited("429".into()).is_transient());
    }

    #[test]
    fn unknown_venue_error_is_transient() {
        assert!(EngineError::Venue("code -9999".into()).is_transient());
    }

    #[test]
    fn cancellation_is_permanent() {
        assert!(EngineError::Cancelled.is_permanent());
    }
}
