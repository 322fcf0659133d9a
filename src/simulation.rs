//! Simulated collaborators
//!
//! Deterministic stand-ins for the transaction builder, the bundle relay and
//! the price source. The binary's `simulate` mode drives the engine with them,
//! and the tests script them to reproduce relay behaviour step by step.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::collaborators::{PriceSource, TransactionBuilder};
use crate::errors::{BuildError, PriceSourceError, RelayError};
use crate::relay::BundleRelay;
use crate::signing::SigningSession;
use crate::types::{
    BundleDescriptor, BundleHandle, ConfirmationStatus, OrderIntent, SignedPayload, SlotRange,
};

/// One scripted build result
#[derive(Debug, Clone)]
pub enum BuildStep {
    Succeed,
    InvalidIntent(String),
    TransientLookup(String),
    /// Never completes; exercises the build timeout and cancellation
    Hang,
}

/// Transaction builder that signs a descriptive message instead of a real transaction
#[derive(Debug)]
pub struct SimulatedBuilder {
    slot: AtomicU64,
    slots_per_build: u64,
    validity_width: u64,
    calls: AtomicUsize,
    script: Mutex<VecDeque<BuildStep>>,
    bids: Mutex<Vec<u64>>,
}

impl SimulatedBuilder {
    pub fn new(start_slot: u64) -> Self {
        Self {
            slot: AtomicU64::new(start_slot),
            slots_per_build: 4,
            validity_width: 150,
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            bids: Mutex::new(Vec::new()),
        }
    }

    /// Width of the slot range the builder reports (may exceed the router's cap)
    pub fn with_validity_width(mut self, width: u64) -> Self {
        self.validity_width = width;
        self
    }

    /// Queue build results; once drained every build succeeds
    pub fn script(self, steps: impl IntoIterator<Item = BuildStep>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fee bids in the order they were passed to the builder
    pub fn bids(&self) -> Vec<u64> {
        self.bids.lock().clone()
    }
}

#[async_trait]
impl TransactionBuilder for SimulatedBuilder {
    async fn build_transaction(
        &self,
        intent: &OrderIntent,
        fee_bid: u64,
        session: &SigningSession,
    ) -> Result<SignedPayload, BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bids.lock().push(fee_bid);

        let step = self.script.lock().pop_front().unwrap_or(BuildStep::Succeed);
        match step {
            BuildStep::Succeed => {}
            BuildStep::InvalidIntent(msg) => return Err(BuildError::InvalidIntent(msg)),
            BuildStep::TransientLookup(msg) => return Err(BuildError::TransientLookup(msg)),
            BuildStep::Hang => futures::future::pending::<()>().await,
        }

        // a fresh blockhash each build moves the validity window forward
        let slot = self.slot.fetch_add(self.slots_per_build, Ordering::SeqCst);
        let message = format!(
            "{}:{}:{}:{}:{}",
            intent.correlation_id(),
            intent.side(),
            intent.instrument(),
            intent.quantity(),
            fee_bid
        );
        let signature = session.sign(message.as_bytes());

        let mut bytes = signature.as_ref().to_vec();
        bytes.extend_from_slice(message.as_bytes());

        Ok(SignedPayload {
            bytes,
            validity: SlotRange::new(slot, slot + self.validity_width),
        })
    }
}

/// One scripted relay behaviour, consumed per submitted bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStep {
    Confirm,
    Reject,
    Expire,
    /// Relay reports no verdict once the timeout passes
    TimeOut,
    /// Confirmation never resolves; only the caller's own timeout ends it
    Hang,
    SubmitUnavailable,
    SubmitRejected,
}

/// Relay that follows a script and counts every network call
#[derive(Debug, Default)]
pub struct ScriptedRelay {
    script: Mutex<VecDeque<RelayStep>>,
    pending: Mutex<HashMap<String, RelayStep>>,
    submitted: Mutex<Vec<BundleDescriptor>>,
    submit_calls: AtomicUsize,
    confirm_calls: AtomicUsize,
    latency: Duration,
}

impl ScriptedRelay {
    /// Relay that confirms everything
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(steps: impl IntoIterator<Item = RelayStep>) -> Self {
        let relay = Self::default();
        relay.script.lock().extend(steps);
        relay
    }

    /// Delay before each confirmation verdict
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, step: RelayStep) {
        self.script.lock().push_back(step);
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn confirm_calls(&self) -> usize {
        self.confirm_calls.load(Ordering::SeqCst)
    }

    pub fn network_calls(&self) -> usize {
        self.submit_calls() + self.confirm_calls()
    }

    pub fn submitted(&self) -> Vec<BundleDescriptor> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl BundleRelay for ScriptedRelay {
    async fn submit_bundle(&self, bundle: &BundleDescriptor) -> Result<BundleHandle, RelayError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.script.lock().pop_front().unwrap_or(RelayStep::Confirm);

        match step {
            RelayStep::SubmitUnavailable => Err(RelayError::Unavailable {
                endpoint: "simulated".to_string(),
                message: "connection refused".to_string(),
            }),
            RelayStep::SubmitRejected => {
                Err(RelayError::Rejected("simulated submission rejected".to_string()))
            }
            verdict => {
                self.submitted.lock().push(bundle.clone());
                let handle = format!("sim-bundle-{n}");
                self.pending.lock().insert(handle.clone(), verdict);
                Ok(BundleHandle(handle))
            }
        }
    }

    async fn await_confirmation(
        &self,
        handle: &BundleHandle,
        timeout: Duration,
    ) -> ConfirmationStatus {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        let verdict = self
            .pending
            .lock()
            .remove(&handle.0)
            .unwrap_or(RelayStep::TimeOut);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency.min(timeout)).await;
        }

        match verdict {
            RelayStep::Confirm => ConfirmationStatus::Confirmed(format!("sim-sig-{}", handle.0)),
            RelayStep::Reject => ConfirmationStatus::Rejected("simulated auction loss".to_string()),
            RelayStep::Expire => ConfirmationStatus::Expired,
            RelayStep::Hang => futures::future::pending().await,
            RelayStep::TimeOut | RelayStep::SubmitUnavailable | RelayStep::SubmitRejected => {
                tokio::time::sleep(timeout.saturating_sub(self.latency)).await;
                ConfirmationStatus::TimedOut
            }
        }
    }
}

/// Price source with a default volatility and per-instrument overrides
#[derive(Debug)]
pub struct StaticPriceSource {
    default: f64,
    overrides: DashMap<String, f64>,
    calls: AtomicUsize,
}

impl StaticPriceSource {
    pub fn new(default: f64) -> Self {
        Self {
            default,
            overrides: DashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, instrument: &str, volatility: f64) {
        self.overrides.insert(instrument.to_string(), volatility);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn recent_volatility(&self, instrument: &str) -> Result<f64, PriceSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if instrument.is_empty() {
            return Err(PriceSourceError::UnknownInstrument(instrument.to_string()));
        }
        Ok(self
            .overrides
            .get(instrument)
            .map(|v| *v)
            .unwrap_or(self.default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SigningConfig;
    use crate::signing::{KeypairSigningModule, SigningModule};
    use crate::types::Side;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_builder_advances_slots() {
        let signer = KeypairSigningModule::ephemeral(&SigningConfig::default());
        let builder = SimulatedBuilder::new(1_000)
            .script([BuildStep::TransientLookup("blockhash".into())]);
        let intent = OrderIntent::new(Side::Buy, "X", dec!(1), 50, 1.0, "c").unwrap();

        let session = signer.acquire().await.unwrap();
        assert!(matches!(
            builder.build_transaction(&intent, 10, &session).await,
            Err(BuildError::TransientLookup(_))
        ));
        let first = builder.build_transaction(&intent, 11, &session).await.unwrap();
        let second = builder.build_transaction(&intent, 12, &session).await.unwrap();
        assert!(second.validity.min_slot > first.validity.min_slot);
        assert_eq!(builder.bids(), vec![10, 11, 12]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_relay_follows_script() {
        let relay = ScriptedRelay::scripted([
            RelayStep::SubmitUnavailable,
            RelayStep::Reject,
            RelayStep::TimeOut,
        ]);
        let bundle = BundleDescriptor {
            payload_bytes: vec![],
            fee_bid: 1,
            validity_slot_range: SlotRange::new(1, 2),
        };

        assert!(relay.submit_bundle(&bundle).await.is_err());
        let h = relay.submit_bundle(&bundle).await.unwrap();
        assert!(matches!(
            relay.await_confirmation(&h, Duration::from_secs(1)).await,
            ConfirmationStatus::Rejected(_)
        ));
        let h = relay.submit_bundle(&bundle).await.unwrap();
        assert_eq!(
            relay.await_confirmation(&h, Duration::from_secs(1)).await,
            ConfirmationStatus::TimedOut
        );
        let h = relay.submit_bundle(&bundle).await.unwrap();
        assert!(matches!(
            relay.await_confirmation(&h, Duration::from_secs(1)).await,
            ConfirmationStatus::Confirmed(_)
        ));
        assert_eq!(relay.submit_calls(), 4);
        assert_eq!(relay.confirm_calls(), 3);
        assert_eq!(relay.submitted().len(), 3);
    }
}
