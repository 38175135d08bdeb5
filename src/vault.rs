//! Symmetric encryption of per-trigger secret maps (§2, §3: "encrypted_secrets
//! decrypts to a mapping of string->string; every value is a string").

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

use crate::error::{JobservError, Result};

pub type Secrets = BTreeMap<String, String>;

/// A symmetric key used to encrypt/decrypt Trigger secret maps. Constructed
/// from `Config::vault_key`; any 32 bytes (after SHA-256 stretching if the
/// configured key is shorter) work as key material.
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(key_material: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(key_material.as_bytes());
        let key_bytes = hasher.finalize();
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypts a secrets map to an opaque string suitable for the
    /// `encrypted_secrets` column. Format: base64(nonce || ciphertext).
    pub fn encrypt(&self, secrets: &Secrets) -> Result<String> {
        let plaintext = serde_json::to_vec(secrets)
            .map_err(|e| JobservError::Unexpected(anyhow::anyhow!(e)))?;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| JobservError::Unexpected(anyhow::anyhow!("encryption failed: {e}")))?;
        let mut blob = nonce_bytes.to_vec();
        blob.extend(ciphertext);
        Ok(STANDARD.encode(blob))
    }

    /// Decrypts an `encrypted_secrets` blob back to its string->string map.
    /// Validates every value is a string (guaranteed by the JSON shape, but
    /// asserted explicitly for the round-trip-law invariant in §8).
    pub fn decrypt(&self, blob: &str) -> Result<Secrets> {
        let raw = STANDARD
            .decode(blob)
            .map_err(|e| JobservError::Unexpected(anyhow::anyhow!(e)))?;
        if raw.len() < 12 {
            return Err(JobservError::Unexpected(anyhow::anyhow!(
                "secret blob too short"
            )));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| JobservError::Unexpected(anyhow::anyhow!("decryption failed: {e}")))?;
        let secrets: Secrets = serde_json::from_slice(&plaintext)
            .map_err(|e| JobservError::Unexpected(anyhow::anyhow!(e)))?;
        Ok(secrets)
    }
}
