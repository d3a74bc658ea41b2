/// Handoff Crypto Library
///
/// Every frame exchanged during a device-to-device transfer is sealed with
/// AES-256-GCM and then tagged with HMAC-SHA256. Both keys come from one
/// `SessionKey` generated by the sending device and handed to the receiving
/// device out-of-band (QR code / deep link).

pub mod encrypt;
pub mod keys;
pub mod mac;

pub use encrypt::{NONCE_SIZE, TAG_SIZE as GCM_TAG_SIZE, open, seal};
pub use keys::{KEY_SIZE, SessionKey};
pub use mac::{MAC_SIZE, mac, verify};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptFailed,
    #[error("sealed payload too short ({0} bytes)")]
    TooShort(usize),
    #[error("GCM authentication failed")]
    AuthFailed,
    #[error("invalid session key: {0}")]
    InvalidKey(String),
}
