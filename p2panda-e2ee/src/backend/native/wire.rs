// SPDX-License-Identifier: MIT OR Apache-2.0

//! Binary layouts of the native backend's messages and session keys.
use serde::{Deserialize, Serialize};

use crate::crypto::Secret;
use crate::crypto::ed25519::{Signature, VerifyingKey};
use crate::crypto::x25519::PublicKey;

pub const MESSAGE_VERSION: u8 = 1;

pub const SESSION_KEY_VERSION: u8 = 2;

pub const EXPORTED_SESSION_KEY_VERSION: u8 = 1;

/// Message of the double ratchet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub version: u8,
    pub ratchet_key: PublicKey,
    pub chain_index: u32,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Header bytes which are authenticated together with the ciphertext.
    pub fn associated_data(version: u8, ratchet_key: &PublicKey, chain_index: u32) -> Vec<u8> {
        let mut aad = Vec::with_capacity(1 + 32 + 4);
        aad.push(version);
        aad.extend_from_slice(ratchet_key.as_bytes());
        aad.extend_from_slice(&chain_index.to_be_bytes());
        aad
    }
}

/// Ratchet message with the keys the receiver needs to create the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyContent {
    pub version: u8,
    pub one_time_key: PublicKey,
    pub base_key: PublicKey,
    pub identity_key: PublicKey,
    pub message: RatchetMessage,
}

/// Bytes with an Ed25519 signature over them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Signed {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub signature: Signature,
}

/// Signed part of a group message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupPayload {
    pub version: u8,
    pub message_index: u32,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Ratchet state and signing key of a group session, signed by that signing key.
#[derive(Serialize, Deserialize)]
pub struct SessionKeyContent {
    pub version: u8,
    pub message_index: u32,
    pub ratchet: Secret<128>,
    pub signing_key: VerifyingKey,
}
