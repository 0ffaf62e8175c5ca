// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signing and verification of JSON objects.
//!
//! A signature covers the canonical JSON of an object without its `signatures` and `unsigned`
//! fields. Signatures are stored inside the object itself:
//!
//! ```text
//! {
//!   "signatures": {
//!     "@panda:example.org": { "ed25519:PANDAPHONE": "<unpadded base64 signature>" }
//!   }
//! }
//! ```
//!
//! Verification distinguishes objects which have never been signed by the given key
//! ([`SignatureError::MissingSignature`]) from objects which carry a signature that doesn't match
//! ([`SignatureError::Invalid`]). Callers apply different trust policies to both cases.
use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use crate::identifiers::{DeviceKeyId, UserId};
use crate::keys::canonical_json::{CanonicalJsonError, canonical_json_for_signing};

/// Signatures of an object, by user id and key id.
pub type Signatures = BTreeMap<UserId, BTreeMap<DeviceKeyId, String>>;

/// Anything holding an Ed25519 key which can sign bytes.
///
/// Implemented by plain signing keys (cross-signing, recovery keys) and by accounts of the
/// crypto backend (device key).
pub trait JsonSigner {
    fn sign_bytes(&self, message: &[u8]) -> Signature;
}

impl JsonSigner for SigningKey {
    fn sign_bytes(&self, message: &[u8]) -> Signature {
        self.sign(message)
    }
}

/// Verifies a detached signature over raw bytes.
pub fn verify_signature(
    public_key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), SignatureError> {
    public_key
        .verify(message, signature)
        .map_err(|_| SignatureError::Invalid)
}

/// Signs a JSON object in place and returns the signature.
///
/// Existing signatures of other keys are kept.
pub fn sign_json(
    value: &mut Value,
    user_id: &UserId,
    key_id: &DeviceKeyId,
    signer: &impl JsonSigner,
) -> Result<Signature, SignatureError> {
    let canonical = canonical_json_for_signing(value)?;
    let signature = signer.sign_bytes(canonical.as_bytes());

    let Value::Object(object) = value else {
        return Err(CanonicalJsonError::NotAnObject.into());
    };
    let signatures = object
        .entry("signatures")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(signatures) = signatures else {
        return Err(SignatureError::MalformedSignatures);
    };
    let user_signatures = signatures
        .entry(user_id.as_str())
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(user_signatures) = user_signatures else {
        return Err(SignatureError::MalformedSignatures);
    };
    user_signatures.insert(
        key_id.as_str().to_owned(),
        Value::String(signature.to_base64()),
    );

    Ok(signature)
}

/// Verifies the signature of `user_id` with `key_id` on a JSON object.
pub fn verify_json(
    value: &Value,
    user_id: &UserId,
    key_id: &DeviceKeyId,
    public_key: &VerifyingKey,
) -> Result<(), SignatureError> {
    let signature = value
        .get("signatures")
        .and_then(|signatures| signatures.get(user_id.as_str()))
        .and_then(|user_signatures| user_signatures.get(key_id.as_str()))
        .ok_or(SignatureError::MissingSignature)?;

    // A present but undecodable signature was still "signed and wrong".
    let signature = signature
        .as_str()
        .and_then(|signature| Signature::from_base64(signature).ok())
        .ok_or(SignatureError::Invalid)?;

    let canonical = canonical_json_for_signing(value)?;
    verify_signature(public_key, canonical.as_bytes(), &signature)
}

/// Signs a serializable object, returning the signed copy.
pub fn sign_object<T>(
    object: &T,
    user_id: &UserId,
    key_id: &DeviceKeyId,
    signer: &impl JsonSigner,
) -> Result<T, SignatureError>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(object).map_err(CanonicalJsonError::from)?;
    sign_json(&mut value, user_id, key_id, signer)?;
    Ok(serde_json::from_value(value).map_err(CanonicalJsonError::from)?)
}

/// Verifies the signature on a serializable object.
pub fn verify_object<T: Serialize>(
    object: &T,
    user_id: &UserId,
    key_id: &DeviceKeyId,
    public_key: &VerifyingKey,
) -> Result<(), SignatureError> {
    let value = serde_json::to_value(object).map_err(CanonicalJsonError::from)?;
    verify_json(&value, user_id, key_id, public_key)
}

#[derive(Debug, Error)]
pub enum SignatureError {
    /// The object was never signed by this key.
    #[error("object carries no signature for this key")]
    MissingSignature,

    /// The object was signed, but the signature doesn't match its contents or the key.
    #[error("signature does not match object and key")]
    Invalid,

    /// We don't know the public key which should have signed the object.
    #[error("signing key {0} is unknown")]
    MissingSigningKey(DeviceKeyId),

    #[error("signatures field is malformed")]
    MalformedSignatures,

    #[error(transparent)]
    CanonicalJson(#[from] CanonicalJsonError),
}
