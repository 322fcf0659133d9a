//! Common types used throughout the engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{ErrorKind, IntentError};
use crate::observability::CorrelationId;

/// Highest slippage tolerance an intent may carry
pub const MAX_SLIPPAGE_BPS: u16 = 1_000;

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

/// A decided trade, immutable once constructed
///
/// Fields are private so every instance has passed [`OrderIntent::new`]'s
/// validation; deserialization goes through the same path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawIntent")]
pub struct OrderIntent {
    side: Side,
    instrument: String,
    quantity: Decimal,
    max_slippage_bps: u16,
    volatility_factor: f64,
    correlation_id: CorrelationId,
}

impl OrderIntent {
    pub fn new(
        side: Side,
        instrument: impl Into<String>,
        quantity: Decimal,
        max_slippage_bps: u16,
        volatility_factor: f64,
        correlation_id: impl Into<CorrelationId>,
    ) -> Result<Self, IntentError> {
        let instrument = instrument.into();
        let correlation_id = correlation_id.into();

        if instrument.trim().is_empty() {
            return Err(IntentError::EmptyInstrument);
        }
        if quantity <= Decimal::ZERO {
            return Err(IntentError::NonPositiveQuantity(quantity.to_string()));
        }
        if max_slippage_bps > MAX_SLIPPAGE_BPS {
            return Err(IntentError::SlippageOutOfRange(max_slippage_bps));
        }
        if !volatility_factor.is_finite() || volatility_factor <= 0.0 {
            return Err(IntentError::InvalidVolatilityFactor(volatility_factor));
        }
        if correlation_id.as_str().is_empty() {
            return Err(IntentError::EmptyCorrelationId);
        }

        Ok(Self {
            side,
            instrument,
            quantity,
            max_slippage_bps,
            volatility_factor,
            correlation_id,
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    /// Quantity with the side's sign applied
    pub fn signed_quantity(&self) -> Decimal {
        self.quantity * self.side.sign()
    }

    pub fn max_slippage_bps(&self) -> u16 {
        self.max_slippage_bps
    }

    pub fn volatility_factor(&self) -> f64 {
        self.volatility_factor
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

#[derive(Deserialize)]
struct RawIntent {
    side: Side,
    instrument: String,
    quantity: Decimal,
    max_slippage_bps: u16,
    #[serde(default = "default_volatility_factor")]
    volatility_factor: f64,
    correlation_id: String,
}

fn default_volatility_factor() -> f64 {
    1.0
}

impl TryFrom<RawIntent> for OrderIntent {
    type Error = IntentError;

    fn try_from(raw: RawIntent) -> Result<Self, Self::Error> {
        OrderIntent::new(
            raw.side,
            raw.instrument,
            raw.quantity,
            raw.max_slippage_bps,
            raw.volatility_factor,
            raw.correlation_id,
        )
    }
}

/// Window of network slots during which a bundle may land
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub min_slot: u64,
    pub max_slot: u64,
}

impl SlotRange {
    pub fn new(min_slot: u64, max_slot: u64) -> Self {
        Self {
            min_slot,
            max_slot: max_slot.max(min_slot),
        }
    }

    pub fn width(&self) -> u64 {
        self.max_slot - self.min_slot
    }

    /// Narrow the range so its width never exceeds `max_width`
    pub fn clamped(self, max_width: u64) -> Self {
        Self {
            min_slot: self.min_slot,
            max_slot: self.max_slot.min(self.min_slot.saturating_add(max_width)),
        }
    }

    pub fn contains(&self, slot: u64) -> bool {
        slot >= self.min_slot && slot <= self.max_slot
    }
}

/// Signed transaction bytes produced by the transaction builder
#[derive(Debug, Clone)]
pub struct SignedPayload {
    pub bytes: Vec<u8>,
    /// Slot window implied by the blockhash the payload was built against
    pub validity: SlotRange,
}

/// One submission unit; built fresh for every attempt and never reused
#[derive(Debug, Clone)]
pub struct BundleDescriptor {
    pub payload_bytes: Vec<u8>,
    pub fee_bid: u64,
    pub validity_slot_range: SlotRange,
}

/// Opaque relay handle for a submitted bundle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleHandle(pub String);

impl fmt::Display for BundleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of waiting for a bundle to land
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Included; carries the settlement reference (transaction signature)
    Confirmed(String),
    /// Explicitly dropped by the relay
    Rejected(String),
    /// Slot range elapsed before inclusion
    Expired,
    /// No verdict inside the timeout
    TimedOut,
}

/// Record of one Building→Monitoring pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub fee_bid: u64,
    pub slot_range: Option<SlotRange>,
    pub error: Option<ErrorKind>,
}

/// Terminal result of one intent; produced exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub correlation_id: CorrelationId,
    pub succeeded: bool,
    pub external_ref: Option<String>,
    pub latency_ms: u64,
    pub error: Option<ErrorKind>,
    pub fee_paid: u64,
    pub attempt: u32,
    pub history: Vec<AttemptRecord>,
}

impl OrderOutcome {
    pub(crate) fn confirmed(
        correlation_id: CorrelationId,
        external_ref: String,
        latency_ms: u64,
        fee_paid: u64,
        history: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            correlation_id,
            succeeded: true,
            external_ref: Some(external_ref),
            latency_ms,
            error: None,
            fee_paid,
            attempt: history.len().max(1) as u32,
            history,
        }
    }

    pub(crate) fn failed(
        correlation_id: CorrelationId,
        error: ErrorKind,
        latency_ms: u64,
        history: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            correlation_id,
            succeeded: false,
            external_ref: None,
            latency_ms,
            error: Some(error),
            fee_paid: 0,
            attempt: history.len().max(1) as u32,
            history,
        }
    }
}

/// Per-instrument market record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub instrument: String,
    pub position_size: Decimal,
    pub liquidity: Decimal,
    pub volatility: f64,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_intent_validation() {
        assert!(OrderIntent::new(Side::Buy, "X", dec!(1.0), 50, 1.0, "c1").is_ok());

        assert_eq!(
            OrderIntent::new(Side::Buy, " ", dec!(1.0), 50, 1.0, "c1").unwrap_err(),
            IntentError::EmptyInstrument
        );
        assert!(matches!(
            OrderIntent::new(Side::Buy, "X", dec!(0), 50, 1.0, "c1"),
            Err(IntentError::NonPositiveQuantity(_))
        ));
        assert_eq!(
            OrderIntent::new(Side::Buy, "X", dec!(1), 1001, 1.0, "c1").unwrap_err(),
            IntentError::SlippageOutOfRange(1001)
        );
        assert!(matches!(
            OrderIntent::new(Side::Buy, "X", dec!(1), 10, f64::NAN, "c1"),
            Err(IntentError::InvalidVolatilityFactor(_))
        ));
        assert!(matches!(
            OrderIntent::new(Side::Buy, "X", dec!(1), 10, 0.0, "c1"),
            Err(IntentError::InvalidVolatilityFactor(_))
        ));
        assert_eq!(
            OrderIntent::new(Side::Sell, "X", dec!(1), 10, 1.0, "").unwrap_err(),
            IntentError::EmptyCorrelationId
        );
    }

    #[test]
    fn test_signed_quantity() {
        let buy = OrderIntent::new(Side::Buy, "X", dec!(2.5), 0, 1.0, "b").unwrap();
        let sell = OrderIntent::new(Side::Sell, "X", dec!(2.5), 0, 1.0, "s").unwrap();
        assert_eq!(buy.signed_quantity(), dec!(2.5));
        assert_eq!(sell.signed_quantity(), dec!(-2.5));
    }

    #[test]
    fn test_intent_deserialization_validates() {
        let ok = r#"{"side":"buy","instrument":"X","quantity":"1.0","max_slippage_bps":50,"correlation_id":"a"}"#;
        let intent: OrderIntent = serde_json::from_str(ok).unwrap();
        assert_eq!(intent.volatility_factor(), 1.0);
        assert_eq!(intent.quantity(), dec!(1.0));

        let bad = r#"{"side":"sell","instrument":"X","quantity":"-1","max_slippage_bps":50,"correlation_id":"a"}"#;
        assert!(serde_json::from_str::<OrderIntent>(bad).is_err());
    }

    #[test]
    fn test_slot_range_clamp() {
        let range = SlotRange::new(100, 400);
        assert_eq!(range.width(), 300);
        let clamped = range.clamped(150);
        assert_eq!(clamped, SlotRange::new(100, 250));
        assert!(clamped.contains(250));
        assert!(!clamped.contains(251));

        // Inverted input collapses to an empty window
        assert_eq!(SlotRange::new(10, 5).width(), 0);
    }
}
