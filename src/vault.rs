// =============================================================================
// Credential Vault — AES-256-GCM at-rest protection for venue API secrets
// =============================================================================
//
// Payload format: base64( nonce[12] || ciphertext || auth_tag[16] ).
// A fresh random nonce is drawn per encryption, so sealing the same
// plaintext twice never yields the same ciphertext.
//
// SECURITY: decryption failures are deliberately opaque — callers cannot
// distinguish a tampered payload from a wrong key. Key material is zeroed
// when the vault is dropped and never logged or serialized.
// =============================================================================

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;

use crate::error::{EngineError, Result};

/// Required key length in bytes (AES-256).
const KEY_LENGTH: usize = 32;
/// GCM nonce length in bytes.
const NONCE_LENGTH: usize = 12;
/// GCM authentication tag length in bytes.
const TAG_LENGTH: usize = 16;

/// Holds the process encryption key and seals/opens credential strings.
pub struct Vault {
    key: [u8; KEY_LENGTH],
}

impl Vault {
    /// Build a vault from raw key bytes. Anything other than exactly 32
    /// bytes is rejected.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(EngineError::InvalidKey);
        }
        let mut owned = [0u8; KEY_LENGTH];
        owned.copy_from_slice(key);
        Ok(Self { key: owned })
    }

    /// Seal a plaintext (any length, including empty) into a transportable
    /// base64 string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| EngineError::InvalidKey)?;

        let nonce_bytes: [u8; NONCE_LENGTH] = rand::rng().random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| EngineError::DecryptionFailed)?;

        let mut payload = Vec::with_capacity(NONCE_LENGTH + sealed.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&sealed);

        Ok(BASE64.encode(payload))
    }

    /// Open a sealed payload. Returns `invalid_ciphertext` for transport
    /// problems (bad base64, truncated payload) and the opaque
    /// `decryption_failed` for everything else.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let payload = BASE64
            .decode(encoded)
            .map_err(|_| EngineError::InvalidCiphertext)?;

        if payload.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(EngineError::InvalidCiphertext);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| EngineError::InvalidKey)?;

        let nonce = Nonce::from_slice(&payload[..NONCE_LENGTH]);
        let plaintext = cipher
            .decrypt(nonce, &payload[NONCE_LENGTH..])
            .map_err(|_| EngineError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| EngineError::DecryptionFailed)
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        // Best-effort scrub of key material before the page is reused.
        for b in self.key.iter_mut() {
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").field("key", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn round_trip() {
        let v = vault();
        for plaintext in ["", "k", "api-key-123", &"x".repeat(500)] {
            let sealed = v.encrypt(plaintext).unwrap();
            assert_eq!(v.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let v = vault();
        let a = v.encrypt("same input").unwrap();
        let b = v.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_length_rejected() {
        assert!(matches!(
            Vault::new(&[0u8; 16]),
            Err(EngineError::InvalidKey)
        ));
        assert!(matches!(
            Vault::new(&[0u8; 33]),
            Err(EngineError::InvalidKey)
        ));
    }

    #[test]
    fn tamper_detected_opaquely() {
        let v = vault();
        let secret = format!("k={}", "x".repeat(48));
        let sealed = v.encrypt(&secret).unwrap();

        let mut raw = BASE64.decode(&sealed).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert!(matches!(
            v.decrypt(&tampered),
            Err(EngineError::DecryptionFailed)
        ));
    }

    #[test]
    fn wrong_key_is_indistinguishable_from_tamper() {
        let sealed = vault().encrypt("secret").unwrap();
        let other = Vault::new(&[8u8; 32]).unwrap();
        assert!(matches!(
            other.decrypt(&sealed),
            Err(EngineError::DecryptionFailed)
        ));
    }

    #[test]
    fn garbage_transport_encoding() {
        let v = vault();
        assert!(matches!(
            v.decrypt("not!!base64@@"),
            Err(EngineError::InvalidCiphertext)
        ));
        // Valid base64 but shorter than nonce + tag.
        assert!(matches!(
            v.decrypt(&BASE64.encode([0u8; 8])),
            Err(EngineError::InvalidCiphertext)
        ));
    }
}
