use std::fmt;

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::CryptoError;

/// Size of each half of the session key pair.
pub const KEY_SIZE: usize = 32;

/// Cipher key + MAC key for one transfer session.
///
/// Generated once per sending device, shared out-of-band, never persisted.
/// Read-only after construction, so clones are freely shared across the
/// network task and the loader thread.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    aes: [u8; KEY_SIZE],
    hmac: [u8; KEY_SIZE],
}

impl SessionKey {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut aes = [0u8; KEY_SIZE];
        let mut hmac = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut aes);
        OsRng.fill_bytes(&mut hmac);
        Self { aes, hmac }
    }

    pub fn from_parts(aes: [u8; KEY_SIZE], hmac: [u8; KEY_SIZE]) -> Self {
        Self { aes, hmac }
    }

    /// Rebuild from the 64-byte wire form (cipher key first).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE * 2 {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE * 2,
                bytes.len()
            )));
        }
        let mut aes = [0u8; KEY_SIZE];
        let mut hmac = [0u8; KEY_SIZE];
        aes.copy_from_slice(&bytes[..KEY_SIZE]);
        hmac.copy_from_slice(&bytes[KEY_SIZE..]);
        Ok(Self { aes, hmac })
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE * 2] {
        let mut out = [0u8; KEY_SIZE * 2];
        out[..KEY_SIZE].copy_from_slice(&self.aes);
        out[KEY_SIZE..].copy_from_slice(&self.hmac);
        out
    }

    /// Encode to base64 for the pairing payload.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// Decode a base64 key pair.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn aes(&self) -> &[u8; KEY_SIZE] {
        &self.aes
    }

    pub fn hmac(&self) -> &[u8; KEY_SIZE] {
        &self.hmac
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip() {
        let key = SessionKey::generate();
        let decoded = SessionKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn generated_halves_differ() {
        let key = SessionKey::generate();
        assert_ne!(key.aes(), key.hmac());
        assert_ne!(SessionKey::generate(), key);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            SessionKey::from_bytes(&[0u8; 32]),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(SessionKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn debug_hides_key_material() {
        let key = SessionKey::from_parts([0xAB; KEY_SIZE], [0xCD; KEY_SIZE]);
        let printed = format!("{:?}", key);
        assert!(!printed.contains("171"));
        assert_eq!(printed, "SessionKey(..)");
    }
}
