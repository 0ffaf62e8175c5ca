// SPDX-License-Identifier: MIT OR Apache-2.0

//! Versioned envelope for pickles.
//!
//! A pickle is the CBOR encoding of a resource, optionally encrypted with XChaCha20-Poly1305
//! under a pickle key, prefixed by a version and a mode byte and encoded as base64:
//!
//! ```text
//! plain:     [version, 0x00, cbor...]
//! encrypted: [version, 0x01, nonce (24 bytes), ciphertext...]
//! ```
//!
//! The kind of resource ("account", "session", ...) is authenticated as additional data, a pickle
//! of one kind can never be loaded as another.
use serde::Serialize;
use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use crate::backend::PickleError;
use crate::crypto::xchacha20::{XAeadNonce, x_aead_decrypt, x_aead_encrypt};
use crate::crypto::{Rng, RngError, Secret};
use crate::encoding::{base64_decode, base64_encode, decode_cbor, encode_cbor};

const PICKLE_VERSION: u8 = 1;

const MODE_PLAIN: u8 = 0;

const MODE_ENCRYPTED: u8 = 1;

const NONCE_SIZE: usize = 24;

/// Symmetric key protecting pickles at rest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PickleKey(Secret<32>);

impl PickleKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn from_rng(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(Secret::from_bytes(rng.random_array()?)))
    }
}

pub(crate) fn pickle<T: Serialize>(
    value: &T,
    kind: &str,
    pickle_key: Option<&PickleKey>,
    rng: &Rng,
) -> Result<String, PickleError> {
    let plaintext = Zeroizing::new(encode_cbor(value)?);

    let mut bytes = vec![PICKLE_VERSION];
    match pickle_key {
        None => {
            bytes.push(MODE_PLAIN);
            bytes.extend_from_slice(&plaintext);
        }
        Some(key) => {
            let nonce: XAeadNonce = rng.random_array()?;
            let ciphertext = x_aead_encrypt(
                key.0.as_bytes(),
                &plaintext,
                nonce,
                Some(kind.as_bytes()),
            )
            .map_err(|_| PickleError::Encryption)?;
            bytes.push(MODE_ENCRYPTED);
            bytes.extend_from_slice(&nonce);
            bytes.extend_from_slice(&ciphertext);
        }
    }

    Ok(base64_encode(&bytes))
}

pub(crate) fn unpickle<T: DeserializeOwned>(
    pickle: &str,
    kind: &str,
    pickle_key: Option<&PickleKey>,
) -> Result<T, PickleError> {
    let bytes = base64_decode(pickle)?;
    let [version, mode, rest @ ..] = bytes.as_slice() else {
        return Err(PickleError::Truncated);
    };
    if *version != PICKLE_VERSION {
        return Err(PickleError::UnsupportedVersion(*version));
    }

    let plaintext = match (*mode, pickle_key) {
        (MODE_PLAIN, None) => Zeroizing::new(rest.to_vec()),
        (MODE_PLAIN, Some(_)) => return Err(PickleError::UnexpectedPickleKey),
        (MODE_ENCRYPTED, None) => return Err(PickleError::MissingPickleKey),
        (MODE_ENCRYPTED, Some(key)) => {
            if rest.len() < NONCE_SIZE {
                return Err(PickleError::Truncated);
            }
            let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
            let nonce: XAeadNonce = nonce.try_into().map_err(|_| PickleError::Truncated)?;
            Zeroizing::new(
                x_aead_decrypt(key.0.as_bytes(), ciphertext, nonce, Some(kind.as_bytes()))
                    .map_err(|_| PickleError::Decryption)?,
            )
        }
        (other, _) => return Err(PickleError::UnsupportedVersion(other)),
    };

    Ok(decode_cbor(&plaintext[..])?)
}
