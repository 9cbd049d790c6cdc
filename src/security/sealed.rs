//! Private-key sealing
//!
//! Storing client private keys lets administrators re-display an artifact
//! without rotating. The trade-off is documented: the registry must never
//! hold them in the clear, so they are sealed with XChaCha20-Poly1305 under
//! a key derived from the session secret. An operator who wants the strictly
//! safer mode sets `store_private_keys = false` and accepts rotation on
//! every re-display.

use crate::error::{ConsoleError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 24;

/// Seals and opens private-key blobs
pub struct KeySealer {
    cipher: XChaCha20Poly1305,
}

impl KeySealer {
    /// Derive the sealing key from the session secret
    pub fn new(session_secret: &str) -> Self {
        let digest = Blake2s256::digest(session_secret.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&digest));
        Self { cipher }
    }

    /// Seal a private key into a base64 blob of `nonce || ciphertext`
    pub fn seal(&self, private_key: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, private_key.as_bytes())
            .map_err(|_| ConsoleError::Serialization("private key sealing failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Open a sealed blob back into the private key
    pub fn open(&self, sealed: &str) -> Result<Zeroizing<String>> {
        let blob = BASE64
            .decode(sealed.trim())
            .map_err(|e| ConsoleError::Serialization(format!("sealed key is not base64: {}", e)))?;
        if blob.len() <= NONCE_LEN {
            return Err(ConsoleError::Serialization(
                "sealed key blob is too short".to_string(),
            ));
        }

        let nonce = XNonce::from_slice(&blob[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &blob[NONCE_LEN..])
            .map_err(|_| {
                ConsoleError::Serialization(
                    "sealed key did not authenticate (wrong session secret?)".to_string(),
                )
            })?;

        let text = String::from_utf8(plaintext)
            .map_err(|_| ConsoleError::Serialization("sealed key is not UTF-8".to_string()))?;
        Ok(Zeroizing::new(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let sealer = KeySealer::new("test-secret");
        let sealed = sealer.seal("client-private-key").unwrap();
        assert_ne!(sealed, "client-private-key");
        let opened = sealer.open(&sealed).unwrap();
        assert_eq!(opened.as_str(), "client-private-key");
    }

    #[test]
    fn test_nonces_differ_per_seal() {
        let sealer = KeySealer::new("test-secret");
        let a = sealer.seal("same-key").unwrap();
        let b = sealer.seal("same-key").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_secret_fails_to_open() {
        let sealed = KeySealer::new("secret-a").seal("key-material").unwrap();
        let result = KeySealer::new("secret-b").open(&sealed);
        assert!(result.is_err());
    }

    #[test]
    fn test_garbage_blob_rejected() {
        let sealer = KeySealer::new("secret");
        assert!(sealer.open("!!not-base64!!").is_err());
        assert!(sealer.open(&BASE64.encode([0u8; 10])).is_err());
    }
}
