// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key material of devices and its authentication through canonical JSON signatures.
mod canonical_json;
mod signing;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use canonical_json::{
    CanonicalJsonError, canonical_json, canonical_json_for_signing, to_canonical_json,
};
pub use signing::{
    JsonSigner, SignatureError, Signatures, sign_json, sign_object, verify_json, verify_object,
    verify_signature,
};

use crate::crypto::ed25519::VerifyingKey;
use crate::crypto::x25519::PublicKey;
use crate::identifiers::{DeviceId, DeviceKeyId, UserId, algorithms};

/// Long-lived identity keys of a device, generated once and never rotated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    /// Curve25519 key used for key agreement in pairwise sessions.
    pub curve25519: PublicKey,

    /// Ed25519 key used to sign keys, events and group session messages.
    pub ed25519: VerifyingKey,
}

/// Self-signed bundle of a device's identity keys, as published on the homeserver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub algorithms: Vec<String>,
    pub keys: BTreeMap<DeviceKeyId, String>,
    #[serde(default)]
    pub signatures: Signatures,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
}

impl DeviceKeys {
    /// Unsigned bundle for the given identity keys.
    pub fn new(user_id: UserId, device_id: DeviceId, identity_keys: IdentityKeys) -> Self {
        let keys = BTreeMap::from([
            (
                DeviceKeyId::curve25519(&device_id),
                identity_keys.curve25519.to_base64(),
            ),
            (
                DeviceKeyId::ed25519(&device_id),
                identity_keys.ed25519.to_base64(),
            ),
        ]);
        Self {
            user_id,
            device_id,
            algorithms: vec![algorithms::OLM.to_owned(), algorithms::MEGOLM.to_owned()],
            keys,
            signatures: Signatures::new(),
            unsigned: None,
        }
    }

    pub fn curve25519_key(&self) -> Option<PublicKey> {
        self.keys
            .get(&DeviceKeyId::curve25519(&self.device_id))
            .and_then(|key| PublicKey::from_base64(key).ok())
    }

    pub fn ed25519_key(&self) -> Option<VerifyingKey> {
        self.keys
            .get(&DeviceKeyId::ed25519(&self.device_id))
            .and_then(|key| VerifyingKey::from_base64(key).ok())
    }

    /// Both identity keys, if the bundle carries them.
    pub fn identity_keys(&self) -> Option<IdentityKeys> {
        Some(IdentityKeys {
            curve25519: self.curve25519_key()?,
            ed25519: self.ed25519_key()?,
        })
    }

    pub fn supports(&self, algorithm: &str) -> bool {
        self.algorithms.iter().any(|a| a == algorithm)
    }

    /// Checks that the bundle was signed with the Ed25519 key it contains.
    pub fn verify_self_signature(&self) -> Result<(), SignatureError> {
        let key_id = DeviceKeyId::ed25519(&self.device_id);
        let key = self
            .ed25519_key()
            .ok_or_else(|| SignatureError::MissingSigningKey(key_id.clone()))?;
        verify_object(self, &self.user_id, &key_id, &key)
    }
}

/// A signed one-time or fallback key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKey {
    pub key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
    #[serde(default)]
    pub signatures: Signatures,
}

impl SignedKey {
    pub fn new(key: PublicKey, fallback: bool) -> Self {
        Self {
            key,
            fallback: fallback.then_some(true),
            signatures: Signatures::new(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback.unwrap_or(false)
    }

    /// Checks that the key was signed by the given device.
    pub fn verify(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        key: &VerifyingKey,
    ) -> Result<(), SignatureError> {
        verify_object(self, user_id, &DeviceKeyId::ed25519(device_id), key)
    }
}

/// Signed one-time keys by their key id, as uploaded or claimed.
pub type OneTimeKeys = BTreeMap<DeviceKeyId, SignedKey>;
