//! Error taxonomy for the execution engine
//!
//! Collaborator failures are typed per collaborator and then folded into a
//! single [`ErrorKind`] that travels inside an `OrderOutcome`. Nothing in this
//! module panics; `execute_order` surfaces every failure through these types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Terminal or per-attempt failure classification carried by outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Caller supplied an intent the builder cannot express
    InvalidIntent,
    /// Correlation id already processed inside the dedup window
    Duplicate,
    /// Circuit breaker is tripped and the cooldown has not elapsed
    CircuitOpen,
    /// Builder could not resolve on-chain state (accounts, blockhash)
    TransientLookupFailure,
    /// Relay could not be reached or refused the connection
    RelayUnavailable,
    /// Relay dropped the bundle (auction loss, slippage, simulation failure)
    BundleRejected,
    /// Validity slot range elapsed before inclusion
    BundleExpired,
    /// Confirmation did not arrive inside the configured timeout
    TimedOut,
    /// All attempts were spent without a confirmation
    Exhausted,
    /// Caller cancelled the intent or its deadline passed
    Cancelled,
}

impl ErrorKind {
    /// Whether the router may retry after this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientLookupFailure
                | Self::RelayUnavailable
                | Self::BundleRejected
                | Self::BundleExpired
                | Self::TimedOut
        )
    }

    /// Whether this failure is attributed to the relay target and so feeds the breaker
    pub fn counts_against_relay(&self) -> bool {
        matches!(
            self,
            Self::RelayUnavailable | Self::BundleRejected | Self::BundleExpired | Self::TimedOut
        )
    }

    /// Stable label for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidIntent => "invalid_intent",
            Self::Duplicate => "duplicate",
            Self::CircuitOpen => "circuit_open",
            Self::TransientLookupFailure => "transient_lookup_failure",
            Self::RelayUnavailable => "relay_unavailable",
            Self::BundleRejected => "bundle_rejected",
            Self::BundleExpired => "bundle_expired",
            Self::TimedOut => "timed_out",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent construction failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IntentError {
    #[error("instrument must not be empty")]
    EmptyInstrument,

    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(String),

    #[error("max slippage {0} bps exceeds 1000")]
    SlippageOutOfRange(u16),

    #[error("volatility factor must be finite and positive, got {0}")]
    InvalidVolatilityFactor(f64),

    #[error("correlation id must not be empty")]
    EmptyCorrelationId,
}

/// Transaction builder failures
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// The intent cannot be turned into a transaction; never retried
    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    /// Account, curve or blockhash lookup failed; retried with backoff
    #[error("transient lookup failure: {0}")]
    TransientLookup(String),

    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidIntent(_) => ErrorKind::InvalidIntent,
            Self::TransientLookup(_) => ErrorKind::TransientLookupFailure,
            Self::Signing(e) => e.kind(),
        }
    }
}

/// Bundle relay failures
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("relay unavailable ({endpoint}): {message}")]
    Unavailable { endpoint: String, message: String },

    #[error("bundle rejected: {0}")]
    Rejected(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } => ErrorKind::RelayUnavailable,
            Self::Rejected(_) => ErrorKind::BundleRejected,
        }
    }
}

/// Signing module failures
#[derive(Debug, Clone, Error)]
pub enum SigningError {
    #[error("timed out acquiring signing session after {0}ms")]
    AcquireTimeout(u64),

    #[error("signing module closed")]
    Closed,

    #[error("keypair error: {0}")]
    Keypair(String),
}

impl SigningError {
    /// Session contention is transient; a broken keypair is not
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AcquireTimeout(_) => ErrorKind::TransientLookupFailure,
            Self::Closed | Self::Keypair(_) => ErrorKind::InvalidIntent,
        }
    }
}

/// Price / volatility source failures
#[derive(Debug, Clone, Error)]
pub enum PriceSourceError {
    #[error("no price history for {0}")]
    UnknownInstrument(String),

    #[error("price source unavailable: {0}")]
    Unavailable(String),
}

/// Persistence backend failures
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("corrupt value under key {0}")]
    Corrupt(String),

    #[error("decimal overflow under key {0}")]
    Overflow(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Market state cache failures
#[derive(Debug, Clone, Error)]
pub enum MarketError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    PriceSource(#[from] PriceSourceError),

    #[error("price source timed out after {0}ms")]
    PriceTimeout(u64),

    #[error("price source returned invalid volatility {0}")]
    InvalidVolatility(f64),
}

/// Configuration validation failures
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ErrorKind::TransientLookupFailure.is_retryable());
        assert!(ErrorKind::RelayUnavailable.is_retryable());
        assert!(ErrorKind::BundleRejected.is_retryable());
        assert!(ErrorKind::BundleExpired.is_retryable());
        assert!(ErrorKind::TimedOut.is_retryable());

        assert!(!ErrorKind::InvalidIntent.is_retryable());
        assert!(!ErrorKind::Duplicate.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(!ErrorKind::Exhausted.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_builder_lookup_failures_do_not_count_against_relay() {
        assert!(!ErrorKind::TransientLookupFailure.counts_against_relay());
        assert!(ErrorKind::TimedOut.counts_against_relay());
        assert!(ErrorKind::BundleExpired.counts_against_relay());
    }

    #[test]
    fn test_collaborator_errors_map_to_kinds() {
        assert_eq!(
            BuildError::InvalidIntent("zero amount".into()).kind(),
            ErrorKind::InvalidIntent
        );
        assert_eq!(
            BuildError::TransientLookup("curve account".into()).kind(),
            ErrorKind::TransientLookupFailure
        );
        assert_eq!(
            BuildError::from(SigningError::AcquireTimeout(50)).kind(),
            ErrorKind::TransientLookupFailure
        );
        assert_eq!(
            RelayError::Rejected("auction lost".into()).kind(),
            ErrorKind::BundleRejected
        );
        assert_eq!(
            RelayError::Unavailable {
                endpoint: "ny".into(),
                message: "connection refused".into()
            }
            .kind(),
            ErrorKind::RelayUnavailable
        );
    }
}
