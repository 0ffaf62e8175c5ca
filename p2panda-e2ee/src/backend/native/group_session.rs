// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group sessions: a sender's hash ratchet plus a signing key.
//!
//! The sending device keeps a [`GroupSession`] and shares its current ratchet and public signing
//! key as a session key. Receivers turn that into an [`InboundGroupSession`] which can decrypt
//! every message from that index on. Every message is signed, so holders of the ratchet can't
//! forge messages in the name of the sender.
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::backend::native::megolm::MegolmRatchet;
use crate::backend::native::wire::{
    EXPORTED_SESSION_KEY_VERSION, GroupPayload, MESSAGE_VERSION, SESSION_KEY_VERSION,
    SessionKeyContent, Signed,
};
use crate::backend::{
    DecryptedMessage, EncryptionError, GroupDecryptionError, GroupSessionBackend,
    GroupSessionError, InboundGroupSessionBackend, PickleError, PickleKey, Resource, pickle,
    unpickle,
};
use crate::crypto::aead::{aead_decrypt, aead_encrypt};
use crate::crypto::ed25519::{SigningKey, VerifyingKey};
use crate::crypto::{Rng, Secret};
use crate::encoding::{base64_decode, base64_encode, decode_cbor, encode_cbor};
use crate::identifiers::SessionId;
use crate::message::{ExportedSessionKey, MegolmMessage, SessionKey};

fn session_id(signing_key: &VerifyingKey) -> SessionId {
    SessionId::new(signing_key.to_base64())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupSession {
    ratchet: MegolmRatchet,
    signing_key: SigningKey,
}

impl Resource for GroupSession {
    const PICKLE_KIND: &'static str = "group_session";

    fn pickle(&self, pickle_key: Option<&PickleKey>, rng: &Rng) -> Result<String, PickleError> {
        pickle(self, Self::PICKLE_KIND, pickle_key, rng)
    }

    fn from_pickle(value: &str, pickle_key: Option<&PickleKey>) -> Result<Self, PickleError> {
        unpickle(value, Self::PICKLE_KIND, pickle_key)
    }
}

impl GroupSessionBackend for GroupSession {
    fn new(rng: &Rng) -> Result<Self, GroupSessionError> {
        Ok(Self {
            ratchet: MegolmRatchet::new(Secret::from_bytes(rng.random_array()?), 0),
            signing_key: SigningKey::from_rng(rng)?,
        })
    }

    fn session_id(&self) -> SessionId {
        session_id(&self.signing_key.verifying_key())
    }

    fn message_index(&self) -> u32 {
        self.ratchet.index()
    }

    fn session_key(&self) -> Result<SessionKey, GroupSessionError> {
        let content = SessionKeyContent {
            version: SESSION_KEY_VERSION,
            message_index: self.ratchet.index(),
            ratchet: self.ratchet.as_secret().clone(),
            signing_key: self.signing_key.verifying_key(),
        };
        let payload = encode_cbor(&content)?;
        let signature = self.signing_key.sign(&payload);
        let signed = encode_cbor(&Signed { payload, signature })?;
        Ok(SessionKey::new(base64_encode(signed)))
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<MegolmMessage, EncryptionError> {
        let message_index = self.ratchet.index();
        let (key, nonce) = self.ratchet.message_keys()?;
        let ciphertext = aead_encrypt(
            &key,
            plaintext,
            nonce,
            Some(&message_index.to_be_bytes()),
        )?;

        let payload = encode_cbor(&GroupPayload {
            version: MESSAGE_VERSION,
            message_index,
            ciphertext,
        })?;
        let signature = self.signing_key.sign(&payload);
        let message = encode_cbor(&Signed { payload, signature })?;

        self.ratchet.advance();

        Ok(MegolmMessage::from_bytes(message))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundGroupSession {
    initial_ratchet: MegolmRatchet,
    latest_ratchet: MegolmRatchet,
    signing_key: VerifyingKey,
    verified: bool,
}

impl InboundGroupSession {
    fn from_content(content: SessionKeyContent, verified: bool) -> Self {
        let ratchet = MegolmRatchet::new(content.ratchet, content.message_index);
        Self {
            initial_ratchet: ratchet.clone(),
            latest_ratchet: ratchet,
            signing_key: content.signing_key,
            verified,
        }
    }

    /// Ratchet advanced to `index`, starting from the closest known state.
    fn ratchet_at(&self, index: u32) -> Option<MegolmRatchet> {
        if index < self.initial_ratchet.index() {
            return None;
        }
        let mut ratchet = if index >= self.latest_ratchet.index() {
            self.latest_ratchet.clone()
        } else {
            self.initial_ratchet.clone()
        };
        if ratchet.index() != index {
            ratchet.advance_to(index);
        }
        Some(ratchet)
    }

    fn export(
        ratchet: &MegolmRatchet,
        signing_key: VerifyingKey,
    ) -> Result<ExportedSessionKey, GroupSessionError> {
        let content = SessionKeyContent {
            version: EXPORTED_SESSION_KEY_VERSION,
            message_index: ratchet.index(),
            ratchet: ratchet.as_secret().clone(),
            signing_key,
        };
        Ok(ExportedSessionKey::new(base64_encode(encode_cbor(&content)?)))
    }
}

impl Resource for InboundGroupSession {
    const PICKLE_KIND: &'static str = "inbound_group_session";

    fn pickle(&self, pickle_key: Option<&PickleKey>, rng: &Rng) -> Result<String, PickleError> {
        pickle(self, Self::PICKLE_KIND, pickle_key, rng)
    }

    fn from_pickle(value: &str, pickle_key: Option<&PickleKey>) -> Result<Self, PickleError> {
        unpickle(value, Self::PICKLE_KIND, pickle_key)
    }
}

impl InboundGroupSessionBackend for InboundGroupSession {
    fn new(session_key: &SessionKey) -> Result<Self, GroupSessionError> {
        let bytes = base64_decode(session_key.as_str())?;
        let signed: Signed = decode_cbor(&bytes[..])?;
        let content: SessionKeyContent = decode_cbor(&signed.payload[..])?;
        if content.version != SESSION_KEY_VERSION {
            return Err(GroupSessionError::UnsupportedVersion(content.version));
        }
        content
            .signing_key
            .verify(&signed.payload, &signed.signature)
            .map_err(|_| GroupSessionError::InvalidSignature)?;
        Ok(Self::from_content(content, true))
    }

    fn import(exported_key: &ExportedSessionKey) -> Result<Self, GroupSessionError> {
        let bytes = base64_decode(exported_key.as_str())?;
        let content: SessionKeyContent = decode_cbor(&bytes[..])?;
        if content.version != EXPORTED_SESSION_KEY_VERSION {
            return Err(GroupSessionError::UnsupportedVersion(content.version));
        }
        Ok(Self::from_content(content, false))
    }

    fn session_id(&self) -> SessionId {
        session_id(&self.signing_key)
    }

    fn first_known_index(&self) -> u32 {
        self.initial_ratchet.index()
    }

    fn signing_key(&self) -> VerifyingKey {
        self.signing_key
    }

    fn is_verified(&self) -> bool {
        self.verified
    }

    fn decrypt(
        &mut self,
        message: &MegolmMessage,
    ) -> Result<DecryptedMessage, GroupDecryptionError> {
        let signed: Signed = decode_cbor(message.as_bytes())?;
        self.signing_key
            .verify(&signed.payload, &signed.signature)
            .map_err(|_| GroupDecryptionError::InvalidSignature)?;

        let payload: GroupPayload = decode_cbor(&signed.payload[..])?;
        if payload.version != MESSAGE_VERSION {
            return Err(GroupDecryptionError::UnsupportedVersion(payload.version));
        }

        let ratchet = self.ratchet_at(payload.message_index).ok_or(
            GroupDecryptionError::UnknownMessageIndex {
                first_known_index: self.first_known_index(),
                index: payload.message_index,
            },
        )?;

        let (key, nonce) = ratchet.message_keys()?;
        let plaintext = aead_decrypt(
            &key,
            &payload.ciphertext,
            nonce,
            Some(&payload.message_index.to_be_bytes()),
        )?;

        // Only remember the ratchet once the message was authentic.
        if ratchet.index() > self.latest_ratchet.index() {
            trace!(index = ratchet.index(), "advancing latest group ratchet");
            self.latest_ratchet = ratchet;
        }

        Ok(DecryptedMessage {
            plaintext: plaintext.into(),
            message_index: payload.message_index,
        })
    }

    fn export_at(&self, index: u32) -> Result<Option<ExportedSessionKey>, GroupSessionError> {
        self.ratchet_at(index)
            .map(|ratchet| Self::export(&ratchet, self.signing_key))
            .transpose()
    }

    fn export_at_first_known_index(&self) -> Result<ExportedSessionKey, GroupSessionError> {
        Self::export(&self.initial_ratchet, self.signing_key)
    }
}
