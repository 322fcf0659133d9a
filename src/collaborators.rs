//! Interfaces of the external collaborators the engine drives
//!
//! The transaction builder knows the bonding-curve protocol and the price
//! source knows where price history lives; the engine only sequences them.
//! The relay interface lives in [`crate::relay`].

use async_trait::async_trait;

use crate::errors::{BuildError, PriceSourceError};
use crate::signing::SigningSession;
use crate::types::{OrderIntent, SignedPayload};

#[async_trait]
pub trait TransactionBuilder: Send + Sync {
    /// Build and sign the transaction for one attempt
    ///
    /// Called once per attempt so the blockhash and fee are always fresh.
    /// `InvalidIntent` ends the intent; `TransientLookup` is retried.
    async fn build_transaction(
        &self,
        intent: &OrderIntent,
        fee_bid: u64,
        session: &SigningSession,
    ) -> Result<SignedPayload, BuildError>;
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Recent realised volatility of the instrument (non-negative)
    async fn recent_volatility(&self, instrument: &str) -> Result<f64, PriceSourceError>;
}
