//! Payload encryption and sync-key fingerprints
//!
//! Content travelling between peers can be wrapped with ChaCha20-Poly1305
//! under a key derived from the shared sync key. Handshakes never carry the
//! sync key itself, only a BLAKE3 fingerprint of it.

use crate::error::SyncError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

const PAYLOAD_KEY_SALT: &[u8] = b"peersync-payload-v1";
const PAYLOAD_KEY_INFO: &[u8] = b"content";
const FINGERPRINT_CONTEXT: &str = "peersync 2024 sync-key fingerprint v1";

/// Fingerprint of a sync key as sent in handshakes; `None` when no key is set.
pub type KeyFingerprint = Option<[u8; 32]>;

/// Compute the handshake fingerprint of an optional sync key.
pub fn fingerprint(sync_key: Option<&str>) -> KeyFingerprint {
    sync_key.map(|key| blake3::derive_key(FINGERPRINT_CONTEXT, key.as_bytes()))
}

/// Generate 32 random bytes.
pub fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// Payload encryption keyed from a sync key.
///
/// # Wire Format
///
/// `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`
///
/// # Example
///
/// ```
/// use peersync_core::crypto::PayloadCrypto;
///
/// let crypto = PayloadCrypto::from_sync_key("shared secret").unwrap();
/// let sealed = crypto.encrypt(b"task payload").unwrap();
/// assert_eq!(crypto.decrypt(&sealed).unwrap(), b"task payload");
/// ```
pub struct PayloadCrypto {
    cipher: ChaCha20Poly1305,
}

impl PayloadCrypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Derive the payload key from a sync key with HKDF-SHA256.
    pub fn from_sync_key(sync_key: &str) -> Result<Self, SyncError> {
        let hk = Hkdf::<Sha256>::new(Some(PAYLOAD_KEY_SALT), sync_key.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(PAYLOAD_KEY_INFO, &mut key)
            .map_err(|e| SyncError::Crypto(format!("Key derivation failed: {}", e)))?;
        Ok(Self::new(&key))
    }

    /// Encrypt with a fresh random nonce prepended to the output.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SyncError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt `[nonce] + [ciphertext + tag]`.
    ///
    /// Fails on a wrong key, tampered data or input shorter than a nonce.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SyncError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(SyncError::Crypto(
                "Data too short to contain nonce".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);
        let encrypted = &ciphertext[NONCE_SIZE..];

        self.cipher
            .decrypt(nonce, encrypted)
            .map_err(|e| SyncError::Crypto(format!("Decryption failed: {}", e)))
    }
}
