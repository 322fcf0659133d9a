//! Bundle relay interface
//!
//! - `submit_bundle` hands one bundle to the block engine and returns its handle
//! - `await_confirmation` waits for a verdict on that handle, bounded by `timeout`

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::RelayError;
use crate::types::{BundleDescriptor, BundleHandle, ConfirmationStatus};

pub mod jito;

pub use jito::JitoRelayClient;

#[async_trait]
pub trait BundleRelay: Send + Sync {
    async fn submit_bundle(&self, bundle: &BundleDescriptor) -> Result<BundleHandle, RelayError>;

    /// Never returns later than `timeout`; a missing verdict is `TimedOut`
    async fn await_confirmation(&self, handle: &BundleHandle, timeout: Duration)
        -> ConfirmationStatus;
}
