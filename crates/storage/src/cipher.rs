//! Record-level encryption envelope
//!
//! Values in an encrypted box are wrapped in a small envelope:
//!
//! ```text
//! magic "VSENC" | u8 version | 12-byte nonce | ciphertext+tag
//! ```
//!
//! AES-256-GCM with a random nonce per record. The magic makes
//! plaintext and encrypted records distinguishable, which is what lets
//! the rotation executor re-encrypt mixed boxes and the policy enforcer
//! detect mismatches.

use crate::error::{Result, StorageError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use vital_keys::EncryptionKey;

/// Envelope magic.
pub const ENVELOPE_MAGIC: &[u8; 5] = b"VSENC";
/// Envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;
/// Nonce length for AES-GCM.
const NONCE_LEN: usize = 12;

/// Per-box record cipher.
pub struct BoxCipher {
    cipher: Aes256Gcm,
}

impl BoxCipher {
    /// Build a cipher from key material.
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .expect("key length is fixed at 32 bytes");
        BoxCipher { cipher }
    }

    /// Whether `bytes` carry the encryption envelope.
    pub fn is_encrypted(bytes: &[u8]) -> bool {
        bytes.len() > ENVELOPE_MAGIC.len() && &bytes[..ENVELOPE_MAGIC.len()] == ENVELOPE_MAGIC
    }

    /// Encrypt record bytes into an envelope.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| StorageError::Crypto(format!("encrypt failed: {}", e)))?;

        let mut out = Vec::with_capacity(ENVELOPE_MAGIC.len() + 1 + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt an envelope back into record bytes.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        if !Self::is_encrypted(envelope) {
            return Err(StorageError::Crypto("missing envelope magic".into()));
        }
        let body = &envelope[ENVELOPE_MAGIC.len()..];
        if body.len() < 1 + NONCE_LEN {
            return Err(StorageError::Crypto("envelope too short".into()));
        }
        if body[0] != ENVELOPE_VERSION {
            return Err(StorageError::Crypto(format!(
                "unsupported envelope version {}",
                body[0]
            )));
        }
        let nonce = Nonce::from_slice(&body[1..1 + NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &body[1 + NONCE_LEN..])
            .map_err(|e| StorageError::Crypto(format!("decrypt failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = BoxCipher::new(&EncryptionKey::generate());
        let envelope = cipher.encrypt(b"heart_rate: 72").unwrap();
        assert!(BoxCipher::is_encrypted(&envelope));
        assert_eq!(cipher.decrypt(&envelope).unwrap(), b"heart_rate: 72");
    }

    #[test]
    fn test_nonces_differ_per_record() {
        let cipher = BoxCipher::new(&EncryptionKey::generate());
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b, "fresh nonce per record");
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = BoxCipher::new(&EncryptionKey::generate())
            .encrypt(b"secret")
            .unwrap();
        let other = BoxCipher::new(&EncryptionKey::generate());
        assert!(matches!(
            other.decrypt(&envelope),
            Err(StorageError::Crypto(_))
        ));
    }

    #[test]
    fn test_plaintext_is_not_encrypted() {
        assert!(!BoxCipher::is_encrypted(b"{\"plain\":true}"));
    }
}
