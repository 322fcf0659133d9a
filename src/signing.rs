//! Scoped signing sessions
//!
//! A [`SigningSession`] holds one permit of the module's session semaphore and
//! gives it back when dropped, whether the transaction build succeeded, failed
//! or was cancelled mid-flight.

use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::config::SigningConfig;
use crate::errors::SigningError;
use crate::metrics::metrics;

#[async_trait]
pub trait SigningModule: Send + Sync {
    /// Acquire a session; bounded by the module's acquire timeout
    async fn acquire(&self) -> Result<SigningSession, SigningError>;

    /// Sessions that can be acquired right now
    fn available_sessions(&self) -> usize;
}

/// RAII signing session; the permit is released on drop
pub struct SigningSession {
    id: u64,
    keypair: Arc<Keypair>,
    acquired_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl SigningSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign_message(message)
    }

    /// Keypair for builders that sign whole transactions
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl std::fmt::Debug for SigningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningSession")
            .field("id", &self.id)
            .field("pubkey", &self.keypair.pubkey())
            .finish()
    }
}

impl Drop for SigningSession {
    fn drop(&mut self) {
        metrics().signing_sessions_active.dec();
        debug!(
            session_id = self.id,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Signing session released"
        );
    }
}

/// Signing module backed by a single local keypair
pub struct KeypairSigningModule {
    keypair: Arc<Keypair>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    next_id: AtomicU64,
}

impl KeypairSigningModule {
    pub fn new(keypair: Keypair, config: &SigningConfig) -> Self {
        Self {
            keypair: Arc::new(keypair),
            permits: Arc::new(Semaphore::new(config.max_sessions)),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            next_id: AtomicU64::new(1),
        }
    }

    /// Module with a freshly generated keypair (simulation and tests)
    pub fn ephemeral(config: &SigningConfig) -> Self {
        Self::new(Keypair::new(), config)
    }

    /// Load a keypair from a Solana CLI JSON file or a raw 64-byte file
    pub fn from_file(path: impl AsRef<Path>, config: &SigningConfig) -> Result<Self, SigningError> {
        let path = path.as_ref();
        let mut raw = std::fs::read(path)
            .map_err(|e| SigningError::Keypair(format!("{}: {e}", path.display())))?;

        let mut bytes = if raw.len() == 64 {
            raw.clone()
        } else {
            serde_json::from_slice::<Vec<u8>>(&raw)
                .map_err(|e| SigningError::Keypair(format!("invalid keypair JSON: {e}")))?
        };
        raw.zeroize();

        let result = Self::keypair_from_bytes(&bytes);
        bytes.zeroize();
        let keypair = result?;

        info!(pubkey = %keypair.pubkey(), "Signing keypair loaded");
        Ok(Self::new(keypair, config))
    }

    fn keypair_from_bytes(bytes: &[u8]) -> Result<Keypair, SigningError> {
        if bytes.len() != 64 {
            return Err(SigningError::Keypair(format!(
                "expected 64 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes.iter().all(|&b| b == 0) {
            return Err(SigningError::Keypair("all-zero key rejected".to_string()));
        }
        Keypair::try_from(bytes).map_err(|e| SigningError::Keypair(e.to_string()))
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    /// Refuse further sessions; outstanding ones stay valid until dropped
    pub fn close(&self) {
        self.permits.close();
    }
}

#[async_trait]
impl SigningModule for KeypairSigningModule {
    async fn acquire(&self) -> Result<SigningSession, SigningError> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| SigningError::AcquireTimeout(self.acquire_timeout.as_millis() as u64))?
        .map_err(|_| SigningError::Closed)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        metrics().signing_sessions_active.inc();
        debug!(session_id = id, "Signing session acquired");

        Ok(SigningSession {
            id,
            keypair: Arc::clone(&self.keypair),
            acquired_at: Instant::now(),
            _permit: permit,
        })
    }

    fn available_sessions(&self) -> usize {
        self.permits.available_permits()
    }
}
