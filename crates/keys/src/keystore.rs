//! Key custody and rotation bookkeeping
//!
//! The keystore holds one 256-bit symmetric key under `enc_key_v1`. On
//! first run it generates the key from the OS entropy source. A stored
//! value that fails to decode is replaced with a fresh key; data written
//! under the corrupt key is unrecoverable, so the event is logged as a
//! corruption and counted.

use crate::secret_store::{SecretStore, SecretStoreError};
use base64::Engine;
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;
use vital_core::{Counter, TelemetrySink};
use zeroize::Zeroizing;

/// Secret name of the active key.
pub const SECRET_CURRENT: &str = "enc_key_v1";
/// Secret name holding the pre-rotation key until commit.
pub const SECRET_PREVIOUS: &str = "enc_key_prev";
/// Secret name of the rotation candidate.
pub const SECRET_CANDIDATE: &str = "enc_key_v1_candidate";

/// Key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Keystore failures.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// The OS secret store denied access; fatal at startup
    #[error("key store unavailable: {0}")]
    Unavailable(String),

    /// A rotation step was invoked out of order
    #[error("invalid rotation state: {0}")]
    InvalidRotationState(String),
}

impl From<SecretStoreError> for KeyStoreError {
    fn from(e: SecretStoreError) -> Self {
        KeyStoreError::Unavailable(e.to_string())
    }
}

/// Zeroized 256-bit key material.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        EncryptionKey(Zeroizing::new(bytes))
    }

    /// Generate a fresh key from the OS entropy source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        EncryptionKey(Zeroizing::new(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        write!(f, "EncryptionKey(..)")
    }
}

/// Custody of the per-app symmetric key.
pub struct KeyStore {
    secrets: Arc<dyn SecretStore>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl KeyStore {
    /// Create a keystore over the given secret store.
    pub fn new(secrets: Arc<dyn SecretStore>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        KeyStore { secrets, telemetry }
    }

    /// Load the active key, generating one on first run.
    ///
    /// A stored value that fails base64 or length decoding is replaced
    /// with a fresh key. Whatever was encrypted under the corrupt value
    /// is unrecoverable; the storage layer's corruption recovery will
    /// back those boxes up and start fresh.
    pub fn load_or_generate(&self) -> Result<EncryptionKey, KeyStoreError> {
        match self.secrets.get(SECRET_CURRENT)? {
            Some(stored) => match Self::decode(&stored) {
                Some(key) => Ok(key),
                None => {
                    tracing::error!(
                        secret = SECRET_CURRENT,
                        "stored encryption key failed to decode; regenerating (encrypted data is unrecoverable)"
                    );
                    self.telemetry.incr(Counter::KeyRegenerated);
                    let key = EncryptionKey::generate();
                    self.secrets.set(SECRET_CURRENT, &Self::encode(&key))?;
                    Ok(key)
                }
            },
            None => {
                let key = EncryptionKey::generate();
                self.secrets.set(SECRET_CURRENT, &Self::encode(&key))?;
                tracing::info!(secret = SECRET_CURRENT, "generated initial encryption key");
                Ok(key)
            }
        }
    }

    /// Begin a rotation: copy the current key to `enc_key_prev` and
    /// write a fresh candidate. Returns the candidate key.
    ///
    /// Idempotent across crashes: if a candidate already exists it is
    /// returned as-is so a resumed rotation re-encrypts with the same
    /// key material.
    pub fn begin_rotation(&self) -> Result<EncryptionKey, KeyStoreError> {
        if let Some(stored) = self.secrets.get(SECRET_CANDIDATE)? {
            if let Some(candidate) = Self::decode(&stored) {
                return Ok(candidate);
            }
        }
        let current = self.secrets.get(SECRET_CURRENT)?.ok_or_else(|| {
            KeyStoreError::InvalidRotationState("no current key to rotate".into())
        })?;
        self.secrets.set(SECRET_PREVIOUS, &current)?;
        let candidate = EncryptionKey::generate();
        self.secrets.set(SECRET_CANDIDATE, &Self::encode(&candidate))?;
        Ok(candidate)
    }

    /// The candidate key, if a rotation is in progress.
    pub fn candidate(&self) -> Result<Option<EncryptionKey>, KeyStoreError> {
        Ok(self.secrets.get(SECRET_CANDIDATE)?.and_then(|s| Self::decode(&s)))
    }

    /// The previous key, if a rotation is in progress.
    pub fn previous(&self) -> Result<Option<EncryptionKey>, KeyStoreError> {
        Ok(self.secrets.get(SECRET_PREVIOUS)?.and_then(|s| Self::decode(&s)))
    }

    /// Promote the candidate to the active key and drop the previous.
    ///
    /// Called only after every required-encryption box has been
    /// re-encrypted under the candidate.
    pub fn commit_rotation(&self) -> Result<(), KeyStoreError> {
        let candidate = self.secrets.get(SECRET_CANDIDATE)?.ok_or_else(|| {
            KeyStoreError::InvalidRotationState("commit without candidate".into())
        })?;
        self.secrets.set(SECRET_CURRENT, &candidate)?;
        self.secrets.delete(SECRET_CANDIDATE)?;
        self.secrets.delete(SECRET_PREVIOUS)?;
        tracing::info!("encryption key rotation committed");
        Ok(())
    }

    /// Abandon an in-progress rotation, keeping the current key.
    pub fn abort_rotation(&self) -> Result<(), KeyStoreError> {
        self.secrets.delete(SECRET_CANDIDATE)?;
        self.secrets.delete(SECRET_PREVIOUS)?;
        Ok(())
    }

    fn encode(key: &EncryptionKey) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .encode(key.as_bytes())
            .into_bytes()
    }

    fn decode(stored: &[u8]) -> Option<EncryptionKey> {
        let text = std::str::from_utf8(stored).ok()?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .ok()?;
        let arr: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(EncryptionKey::from_bytes(arr))
    }
}
