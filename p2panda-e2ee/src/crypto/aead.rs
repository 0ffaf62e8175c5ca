// SPDX-License-Identifier: MIT OR Apache-2.0

//! ChaCha20-Poly1305 authenticated symmetric encryption with additional data (AEAD), 256-bit key,
//! 128-bit tag and 96-bit nonce.
//!
//! Used for ratchet messages where every key encrypts exactly one message, which is why the nonce
//! can be derived from the key deterministically.
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use thiserror::Error;

pub type AeadNonce = [u8; 12];

pub type AeadKey = [u8; 32];

pub fn aead_encrypt(
    key: &AeadKey,
    plaintext: &[u8],
    nonce: AeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let payload = Payload {
        msg: plaintext,
        aad: aad.unwrap_or_default(),
    };
    cipher
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(AeadError::Encrypt)
}

pub fn aead_decrypt(
    key: &AeadKey,
    ciphertext_tag: &[u8],
    nonce: AeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let payload = Payload {
        msg: ciphertext_tag,
        aad: aad.unwrap_or_default(),
    };
    cipher
        .decrypt(Nonce::from_slice(&nonce), payload)
        .map_err(AeadError::Decrypt)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("could not encrypt with chacha20poly1305 aead: {0}")]
    Encrypt(chacha20poly1305::Error),

    #[error("could not decrypt with chacha20poly1305 aead: {0}")]
    Decrypt(chacha20poly1305::Error),
}
