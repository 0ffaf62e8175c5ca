// SPDX-License-Identifier: MIT OR Apache-2.0

//! Elliptic-curve Diffie–Hellman (ECDH) key agreement scheme (X25519).
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::StaticSecret;

use crate::crypto::{Rng, RngError, Secret};
use crate::encoding::{Base64Error, base64_decode_array, base64_encode};

/// 256-bit secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// 256-bit public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Secret Curve25519 key used for ECDH key agreement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<SECRET_KEY_SIZE>);

impl SecretKey {
    pub fn from_rng(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_bytes(rng.random_array()?))
    }

    pub(crate) fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        // Clamping
        let mut bytes = bytes;
        bytes[0] &= 248u8;
        bytes[31] &= 127u8;
        bytes[31] |= 64u8;
        SecretKey(Secret::from_bytes(bytes))
    }

    fn to_static_secret(&self) -> StaticSecret {
        StaticSecret::from(*self.0.as_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        let public = x25519_dalek::PublicKey::from(&self.to_static_secret());
        PublicKey(public.to_bytes())
    }

    /// Computes the shared secret with the other party's public key.
    ///
    /// Fails when the other key is a low-order point, which would make the outcome independent
    /// of our secret.
    pub fn calculate_agreement(
        &self,
        their_public: &PublicKey,
    ) -> Result<Secret<32>, X25519Error> {
        let shared = self
            .to_static_secret()
            .diffie_hellman(&x25519_dalek::PublicKey::from(their_public.0));
        if !shared.was_contributory() {
            return Err(X25519Error::NonContributory);
        }
        Ok(Secret::from_bytes(shared.to_bytes()))
    }
}

/// Public Curve25519 key used for ECDH key agreement.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "crate::encoding::base64_array")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(public_key)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    pub fn to_base64(&self) -> String {
        base64_encode(self.0)
    }

    pub fn from_base64(value: &str) -> Result<Self, X25519Error> {
        Ok(Self(base64_decode_array(value)?))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_base64()).finish()
    }
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("public key is not contributory (low-order point)")]
    NonContributory,

    #[error("invalid curve25519 public key: {0}")]
    InvalidKey(#[from] Base64Error),
}
