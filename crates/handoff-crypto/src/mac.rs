use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys::KEY_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 output length. Frames carry it as a fixed trailing tag.
pub const MAC_SIZE: usize = 32;

/// Compute HMAC-SHA256 over the concatenation of `parts`.
pub fn mac(key: &[u8; KEY_SIZE], parts: &[&[u8]]) -> [u8; MAC_SIZE] {
    // Keys shorter than the block are zero-padded by HMAC itself
    let mut block = Key::<HmacSha256>::default();
    block[..KEY_SIZE].copy_from_slice(key);
    let mut hmac = <HmacSha256 as KeyInit>::new(&block);
    for part in parts {
        hmac.update(part);
    }
    hmac.finalize().into_bytes().into()
}

/// Byte-exact comparison of a locally computed tag with a received one.
pub fn verify(local: &[u8; MAC_SIZE], remote: &[u8]) -> bool {
    local.as_slice() == remote
}
