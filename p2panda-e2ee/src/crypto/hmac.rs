// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keyed-hash message authentication codes with SHA256.
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub const HMAC_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; HMAC_SIZE] {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac takes keys of any size");
    mac.update(message);
    let result = mac.finalize().into_bytes();
    result[..].try_into().expect("hmac-sha256 output size")
}

/// Checks the tag in constant time.
pub fn hmac_sha256_verify(key: &[u8], message: &[u8], tag: &[u8]) -> Result<(), HmacError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac takes keys of any size");
    mac.update(message);
    mac.verify_slice(tag).map_err(|_| HmacError::Mismatch)
}

#[derive(Debug, Error)]
pub enum HmacError {
    #[error("message authentication code does not match")]
    Mismatch,
}

#[cfg(test)]
mod tests {
    use super::{HmacError, hmac_sha256, hmac_sha256_verify};

    #[test]
    fn verify_tag() {
        let tag = hmac_sha256(b"key", b"message");
        assert!(hmac_sha256_verify(b"key", b"message", &tag).is_ok());
        assert!(matches!(
            hmac_sha256_verify(b"other key", b"message", &tag),
            Err(HmacError::Mismatch)
        ));
        assert!(matches!(
            hmac_sha256_verify(b"key", b"message", &tag[..16]),
            Err(HmacError::Mismatch)
        ));
    }
}
