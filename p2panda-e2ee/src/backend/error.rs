// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::crypto::RngError;
use crate::crypto::aead::AeadError;
use crate::crypto::hkdf::HkdfError;
use crate::crypto::x25519::X25519Error;
use crate::encoding::{Base64Error, DecodeError, EncodeError};

/// Errors from serializing resources into pickles and back.
#[derive(Debug, Error)]
pub enum PickleError {
    #[error("pickle is not valid base64: {0}")]
    Encoding(#[from] Base64Error),

    #[error("pickle is empty or truncated")]
    Truncated,

    #[error("unsupported pickle version {0}")]
    UnsupportedVersion(u8),

    #[error("pickle is encrypted but no pickle key was given")]
    MissingPickleKey,

    #[error("pickle is not encrypted but a pickle key was given")]
    UnexpectedPickleKey,

    #[error("could not encrypt pickle")]
    Encryption,

    #[error("could not decrypt pickle, wrong pickle key or corrupted data")]
    Decryption,

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

/// Errors from operations on the account which are not about sessions.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Rng(#[from] RngError),
}

/// Errors during creation of pairwise sessions.
#[derive(Debug, Error)]
pub enum SessionCreationError {
    #[error("pre-key message was sent by {found}, expected {expected}")]
    MismatchedIdentityKey { expected: String, found: String },

    #[error("one-time key {0} is unknown or was already used")]
    MissingOneTimeKey(String),

    #[error("malformed pre-key message: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("first message of the new session can not be decrypted: {0}")]
    Decryption(#[from] DecryptionError),
}

/// Errors while encrypting with a pairwise or group session.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("pairwise session has no chain to send with")]
    MissingChain,

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

/// Errors while decrypting with a pairwise session.
///
/// A failed decryption never changes the session.
#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("malformed message: {0}")]
    Decode(#[from] DecodeError),

    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),

    #[error("pre-key message belongs to a different session")]
    SessionMismatch,

    #[error("message authentication failed")]
    InvalidMac(#[from] AeadError),

    #[error("message key for chain index {0} is not available anymore")]
    MissingMessageKey(u32),

    #[error("message skips {0} keys, more than we are willing to compute")]
    TooBigMessageGap(u32),

    #[error("no ratchet key to answer a new chain with")]
    MissingRatchetKey,

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),
}

/// Errors during creation or import of group sessions.
#[derive(Debug, Error)]
pub enum GroupSessionError {
    #[error("session key is not valid base64: {0}")]
    Encoding(#[from] Base64Error),

    #[error("malformed session key: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("unsupported session key version {0}")]
    UnsupportedVersion(u8),

    #[error("session key signature is invalid")]
    InvalidSignature,

    #[error(transparent)]
    Rng(#[from] RngError),
}

/// Errors while decrypting with an inbound group session.
#[derive(Debug, Error)]
pub enum GroupDecryptionError {
    #[error("message index {index} is below the first known index {first_known_index}")]
    UnknownMessageIndex { first_known_index: u32, index: u32 },

    #[error("message signature is invalid")]
    InvalidSignature,

    #[error("message authentication failed")]
    InvalidMac(#[from] AeadError),

    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed message: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),
}
