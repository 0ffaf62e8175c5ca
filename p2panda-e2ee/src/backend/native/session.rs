// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise sessions: triple Diffie-Hellman handshake followed by the double ratchet.
//!
//! The initiator combines its identity key and a fresh base key with the receiver's identity key
//! and one of its published one-time keys:
//!
//! ```text
//! DH1 = DH(identity_A, one_time_B)
//! DH2 = DH(base_A, identity_B)
//! DH3 = DH(base_A, one_time_B)
//! ```
//!
//! Until the initiator receives the first answer, every message it sends is a pre-key message
//! carrying the three public keys, so the receiver can create the session from whichever message
//! arrives first.
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::backend::native::ratchet::{DoubleRatchet, DoubleRatchetState};
use crate::backend::native::wire::{MESSAGE_VERSION, PreKeyContent, RatchetMessage};
use crate::backend::{
    DecryptionError, EncryptionError, PickleError, PickleKey, Resource, SessionBackend,
    SessionCreationError, pickle, unpickle,
};
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, Secret};
use crate::encoding::{base64_encode, decode_cbor, encode_cbor};
use crate::identifiers::SessionId;
use crate::message::{Message, OlmMessage, PreKeyMessage};

/// "Discontinuity bytes" prefixing the handshake secret.
const DISCONTINUITY: [u8; 32] = [0xFF; 32];

/// Public keys of the handshake which created a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    pub identity_key: PublicKey,
    pub base_key: PublicKey,
    pub one_time_key: PublicKey,
}

impl SessionKeys {
    pub fn session_id(&self) -> SessionId {
        SessionId::new(base64_encode(sha2_256(&[
            self.identity_key.as_bytes(),
            self.base_key.as_bytes(),
            self.one_time_key.as_bytes(),
        ])))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    session_keys: SessionKeys,
    ratchet: DoubleRatchetState,
    has_received_message: bool,
    is_outbound: bool,
}

impl Session {
    pub(crate) fn new_outbound(
        our_identity_secret: &SecretKey,
        their_identity_key: PublicKey,
        their_one_time_key: PublicKey,
        rng: &Rng,
    ) -> Result<Self, SessionCreationError> {
        let base_secret = SecretKey::from_rng(rng)?;

        let shared_secret = {
            let dh_1 = our_identity_secret.calculate_agreement(&their_one_time_key)?;
            let dh_2 = base_secret.calculate_agreement(&their_identity_key)?;
            let dh_3 = base_secret.calculate_agreement(&their_one_time_key)?;
            Self::shared_secret([&dh_1, &dh_2, &dh_3])
        };

        let ratchet = DoubleRatchet::init_sender(&shared_secret, rng)?;

        Ok(Self {
            session_keys: SessionKeys {
                identity_key: our_identity_secret.public_key(),
                base_key: base_secret.public_key(),
                one_time_key: their_one_time_key,
            },
            ratchet,
            has_received_message: false,
            is_outbound: true,
        })
    }

    /// Creates the receiving side and decrypts the first message. Nothing is created when the
    /// message can't be decrypted.
    pub(crate) fn new_inbound(
        our_identity_secret: &SecretKey,
        our_one_time_secret: &SecretKey,
        pre_key: &PreKeyContent,
    ) -> Result<(Self, Zeroizing<Vec<u8>>), SessionCreationError> {
        let shared_secret = {
            let dh_1 = our_one_time_secret.calculate_agreement(&pre_key.identity_key)?;
            let dh_2 = our_identity_secret.calculate_agreement(&pre_key.base_key)?;
            let dh_3 = our_one_time_secret.calculate_agreement(&pre_key.base_key)?;
            Self::shared_secret([&dh_1, &dh_2, &dh_3])
        };

        let ratchet = DoubleRatchet::init_receiver(&shared_secret, pre_key.message.ratchet_key)?;
        let (ratchet, plaintext) = DoubleRatchet::decrypt(ratchet, &pre_key.message)?;

        Ok((
            Self {
                session_keys: SessionKeys {
                    identity_key: pre_key.identity_key,
                    base_key: pre_key.base_key,
                    one_time_key: pre_key.one_time_key,
                },
                ratchet,
                has_received_message: true,
                is_outbound: false,
            },
            plaintext,
        ))
    }

    fn shared_secret(parts: [&Secret<32>; 3]) -> Zeroizing<Vec<u8>> {
        let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 4));
        ikm.extend_from_slice(&DISCONTINUITY);
        for part in parts {
            ikm.extend_from_slice(part.as_bytes());
        }
        ikm
    }

    pub fn session_keys(&self) -> &SessionKeys {
        &self.session_keys
    }
}

impl Resource for Session {
    const PICKLE_KIND: &'static str = "session";

    fn pickle(&self, pickle_key: Option<&PickleKey>, rng: &Rng) -> Result<String, PickleError> {
        pickle(self, Self::PICKLE_KIND, pickle_key, rng)
    }

    fn from_pickle(value: &str, pickle_key: Option<&PickleKey>) -> Result<Self, PickleError> {
        unpickle(value, Self::PICKLE_KIND, pickle_key)
    }
}

impl SessionBackend for Session {
    fn session_id(&self) -> SessionId {
        self.session_keys.session_id()
    }

    fn has_received_message(&self) -> bool {
        self.has_received_message
    }

    fn encrypt(&mut self, plaintext: &[u8], rng: &Rng) -> Result<OlmMessage, EncryptionError> {
        let (ratchet, message) = DoubleRatchet::encrypt(self.ratchet.clone(), plaintext, rng)?;

        let message = if self.is_outbound && !self.has_received_message {
            let content = PreKeyContent {
                version: MESSAGE_VERSION,
                one_time_key: self.session_keys.one_time_key,
                base_key: self.session_keys.base_key,
                identity_key: self.session_keys.identity_key,
                message,
            };
            OlmMessage::PreKey(PreKeyMessage::from_bytes(encode_cbor(&content)?))
        } else {
            OlmMessage::Normal(Message::from_bytes(encode_cbor(&message)?))
        };

        self.ratchet = ratchet;
        Ok(message)
    }

    fn decrypt(&mut self, message: &OlmMessage) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        let ratchet_message = match message {
            OlmMessage::Normal(message) => decode_cbor::<RatchetMessage, _>(message.as_bytes())?,
            OlmMessage::PreKey(message) => {
                let content: PreKeyContent = decode_cbor(message.as_bytes())?;
                if content.version != MESSAGE_VERSION {
                    return Err(DecryptionError::UnsupportedVersion(content.version));
                }
                if !self.matches_content(&content) {
                    return Err(DecryptionError::SessionMismatch);
                }
                content.message
            }
        };

        let (ratchet, plaintext) = DoubleRatchet::decrypt(self.ratchet.clone(), &ratchet_message)?;
        self.ratchet = ratchet;
        self.has_received_message = true;
        Ok(plaintext)
    }

    fn matches_pre_key_message(
        &self,
        their_identity_key: &PublicKey,
        message: &PreKeyMessage,
    ) -> bool {
        let Ok(content) = decode_cbor::<PreKeyContent, _>(message.as_bytes()) else {
            return false;
        };
        &content.identity_key == their_identity_key && self.matches_content(&content)
    }
}

impl Session {
    fn matches_content(&self, content: &PreKeyContent) -> bool {
        !self.is_outbound
            && self.session_keys
                == SessionKeys {
                    identity_key: content.identity_key,
                    base_key: content.base_key,
                    one_time_key: content.one_time_key,
                }
    }
}
