// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double ratchet of pairwise sessions.
//!
//! Every message is encrypted with its own key from a symmetric chain. Whenever the conversation
//! changes direction the sending side picks a fresh ratchet key and mixes a new Diffie-Hellman
//! secret into the root key, starting a new chain:
//!
//! ```text
//! root_0 --DH(T1, T0)--> root_1 --DH(T2, T1)--> root_2 ...
//!   |                      |                      |
//!   chain(A, T0)           chain(B, T1)           chain(A, T2)
//! ```
//!
//! The first chain of the initiating side comes straight from the session's shared secret.
//!
//! Messages may arrive out of order. Keys of skipped messages are kept, bounded by
//! [`MAX_SKIPPED_MESSAGE_KEYS`], and the number of keys we're willing to derive in one go is
//! bounded by [`MAX_MESSAGE_GAP`].
//!
//! All operations take the state by value and only hand back the new state when they succeeded,
//! callers keep their copy when a decryption fails.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::backend::native::wire::{MESSAGE_VERSION, RatchetMessage};
use crate::backend::{DecryptionError, EncryptionError, SessionCreationError};
use crate::crypto::aead::{AeadKey, AeadNonce, aead_decrypt, aead_encrypt};
use crate::crypto::hkdf::hkdf;
use crate::crypto::hmac::hmac_sha256;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, Secret};

const ROOT_KDF_INFO: &[u8] = b"P2PANDA_E2EE_ROOT";

const MESSAGE_KDF_INFO: &[u8] = b"P2PANDA_E2EE_MESSAGE_KEYS";

/// Seed deriving a message key from a chain key.
const MESSAGE_KEY_SEED: &[u8] = &[0x01];

/// Seed advancing a chain key.
const CHAIN_KEY_SEED: &[u8] = &[0x02];

pub const MAX_MESSAGE_GAP: u32 = 2000;

pub const MAX_SKIPPED_MESSAGE_KEYS: usize = 40;

pub const MAX_RECEIVING_CHAINS: usize = 5;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChainKey {
    key: Secret<32>,
    index: u32,
}

impl ChainKey {
    fn new(key: [u8; 32]) -> Self {
        Self {
            key: Secret::from_bytes(key),
            index: 0,
        }
    }

    fn message_key(&self) -> Secret<32> {
        Secret::from_bytes(hmac_sha256(self.key.as_bytes(), MESSAGE_KEY_SEED))
    }

    fn advance(&mut self) {
        self.key = Secret::from_bytes(hmac_sha256(self.key.as_bytes(), CHAIN_KEY_SEED));
        self.index += 1;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ReceivingChain {
    ratchet_key: PublicKey,
    chain_key: ChainKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SkippedMessageKey {
    ratchet_key: PublicKey,
    index: u32,
    key: Secret<32>,
}

pub struct DoubleRatchet;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoubleRatchetState {
    root_key: Secret<32>,
    our_ratchet_key: Option<SecretKey>,
    sending_chain: Option<ChainKey>,
    receiving_chains: VecDeque<ReceivingChain>,
    skipped_message_keys: VecDeque<SkippedMessageKey>,
}

impl DoubleRatchet {
    /// State of the side which created the session, ready to send.
    pub fn init_sender(
        shared_secret: &[u8],
        rng: &Rng,
    ) -> Result<DoubleRatchetState, SessionCreationError> {
        let (root_key, chain_key) = Self::kdf_root(&[], shared_secret)?;
        Ok(DoubleRatchetState {
            root_key,
            our_ratchet_key: Some(SecretKey::from_rng(rng)?),
            sending_chain: Some(ChainKey::new(*chain_key.as_bytes())),
            receiving_chains: VecDeque::new(),
            skipped_message_keys: VecDeque::new(),
        })
    }

    /// State of the side which received the first message, ready to decrypt it.
    pub fn init_receiver(
        shared_secret: &[u8],
        their_ratchet_key: PublicKey,
    ) -> Result<DoubleRatchetState, DecryptionError> {
        let (root_key, chain_key) = Self::kdf_root(&[], shared_secret)?;
        Ok(DoubleRatchetState {
            root_key,
            our_ratchet_key: None,
            sending_chain: None,
            receiving_chains: VecDeque::from([ReceivingChain {
                ratchet_key: their_ratchet_key,
                chain_key: ChainKey::new(*chain_key.as_bytes()),
            }]),
            skipped_message_keys: VecDeque::new(),
        })
    }

    pub fn encrypt(
        y: DoubleRatchetState,
        plaintext: &[u8],
        rng: &Rng,
    ) -> Result<(DoubleRatchetState, RatchetMessage), EncryptionError> {
        let mut y_i = y;

        // We've received a new ratchet key since we last sent, answer it with a fresh one.
        if y_i.sending_chain.is_none() {
            let their_ratchet_key = y_i
                .receiving_chains
                .back()
                .map(|chain| chain.ratchet_key)
                .ok_or(EncryptionError::MissingChain)?;
            let our_ratchet_key = SecretKey::from_rng(rng)?;
            let shared = our_ratchet_key.calculate_agreement(&their_ratchet_key)?;
            let (root_key, chain_key) = Self::kdf_root(y_i.root_key.as_bytes(), shared.as_bytes())?;
            y_i.root_key = root_key;
            y_i.our_ratchet_key = Some(our_ratchet_key);
            y_i.sending_chain = Some(ChainKey::new(*chain_key.as_bytes()));
        }

        let ratchet_key = y_i
            .our_ratchet_key
            .as_ref()
            .map(SecretKey::public_key)
            .ok_or(EncryptionError::MissingChain)?;
        let chain = y_i
            .sending_chain
            .as_mut()
            .ok_or(EncryptionError::MissingChain)?;

        let message_key = chain.message_key();
        let chain_index = chain.index;
        let (key, nonce) = Self::message_keys(&message_key)?;
        let aad = RatchetMessage::associated_data(MESSAGE_VERSION, &ratchet_key, chain_index);
        let ciphertext = aead_encrypt(&key, plaintext, nonce, Some(&aad))?;
        chain.advance();

        Ok((
            y_i,
            RatchetMessage {
                version: MESSAGE_VERSION,
                ratchet_key,
                chain_index,
                ciphertext,
            },
        ))
    }

    pub fn decrypt(
        y: DoubleRatchetState,
        message: &RatchetMessage,
    ) -> Result<(DoubleRatchetState, Zeroizing<Vec<u8>>), DecryptionError> {
        if message.version != MESSAGE_VERSION {
            return Err(DecryptionError::UnsupportedVersion(message.version));
        }

        let mut y_i = y;

        let known_chain = y_i
            .receiving_chains
            .iter()
            .position(|chain| chain.ratchet_key == message.ratchet_key);

        match known_chain {
            Some(position) => {
                let chain_key = y_i.receiving_chains[position].chain_key.clone();
                if message.chain_index < chain_key.index {
                    // Message "from the past", we must have kept its key when skipping it.
                    let Some(skipped) = y_i.skipped_message_keys.iter().position(|skipped| {
                        skipped.ratchet_key == message.ratchet_key
                            && skipped.index == message.chain_index
                    }) else {
                        return Err(DecryptionError::MissingMessageKey(message.chain_index));
                    };
                    let plaintext = Self::decrypt_inner(
                        &y_i.skipped_message_keys[skipped].key,
                        message,
                    )?;
                    y_i.skipped_message_keys.remove(skipped);
                    Ok((y_i, plaintext))
                } else {
                    let (chain_key, plaintext) =
                        Self::decrypt_on_chain(&mut y_i, chain_key, message)?;
                    y_i.receiving_chains[position].chain_key = chain_key;
                    Ok((y_i, plaintext))
                }
            }
            None => {
                // The other side answered with a new ratchet key, derive the next root and the
                // chain it's sending on.
                let our_ratchet_key = y_i
                    .our_ratchet_key
                    .as_ref()
                    .ok_or(DecryptionError::MissingRatchetKey)?;
                let shared = our_ratchet_key.calculate_agreement(&message.ratchet_key)?;
                let (root_key, chain_key) =
                    Self::kdf_root(y_i.root_key.as_bytes(), shared.as_bytes())?;

                let (chain_key, plaintext) = Self::decrypt_on_chain(
                    &mut y_i,
                    ChainKey::new(*chain_key.as_bytes()),
                    message,
                )?;

                y_i.root_key = root_key;
                y_i.sending_chain = None;
                y_i.receiving_chains.push_back(ReceivingChain {
                    ratchet_key: message.ratchet_key,
                    chain_key,
                });
                if y_i.receiving_chains.len() > MAX_RECEIVING_CHAINS {
                    y_i.receiving_chains.pop_front();
                }
                Ok((y_i, plaintext))
            }
        }
    }

    /// Decrypts a message at or ahead of the chain's position, keeping keys of skipped messages.
    fn decrypt_on_chain(
        y: &mut DoubleRatchetState,
        chain_key: ChainKey,
        message: &RatchetMessage,
    ) -> Result<(ChainKey, Zeroizing<Vec<u8>>), DecryptionError> {
        let gap = message.chain_index - chain_key.index;
        if gap > MAX_MESSAGE_GAP {
            return Err(DecryptionError::TooBigMessageGap(gap));
        }

        let mut chain_key = chain_key;
        let mut skipped = Vec::new();
        while chain_key.index < message.chain_index {
            skipped.push(SkippedMessageKey {
                ratchet_key: message.ratchet_key,
                index: chain_key.index,
                key: chain_key.message_key(),
            });
            chain_key.advance();
        }

        let plaintext = Self::decrypt_inner(&chain_key.message_key(), message)?;
        chain_key.advance();

        for key in skipped {
            y.skipped_message_keys.push_back(key);
            if y.skipped_message_keys.len() > MAX_SKIPPED_MESSAGE_KEYS {
                y.skipped_message_keys.pop_front();
            }
        }

        Ok((chain_key, plaintext))
    }

    fn decrypt_inner(
        message_key: &Secret<32>,
        message: &RatchetMessage,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        let (key, nonce) = Self::message_keys(message_key)?;
        let aad = RatchetMessage::associated_data(
            message.version,
            &message.ratchet_key,
            message.chain_index,
        );
        let plaintext = aead_decrypt(&key, &message.ciphertext, nonce, Some(&aad))?;
        Ok(Zeroizing::new(plaintext))
    }

    fn kdf_root(
        root_key: &[u8],
        shared_secret: &[u8],
    ) -> Result<(Secret<32>, Secret<32>), crate::crypto::hkdf::HkdfError> {
        let okm: Zeroizing<[u8; 64]> =
            Zeroizing::new(hkdf(root_key, shared_secret, Some(ROOT_KDF_INFO))?);
        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&okm[..32]);
        chain.copy_from_slice(&okm[32..]);
        Ok((Secret::from_bytes(root), Secret::from_bytes(chain)))
    }

    fn message_keys(
        message_key: &Secret<32>,
    ) -> Result<(Zeroizing<AeadKey>, AeadNonce), crate::crypto::hkdf::HkdfError> {
        let okm: Zeroizing<[u8; 44]> =
            Zeroizing::new(hkdf(&[], message_key.as_bytes(), Some(MESSAGE_KDF_INFO))?);
        let mut key = Zeroizing::new([0u8; 32]);
        let mut nonce = [0u8; 12];
        key.copy_from_slice(&okm[..32]);
        nonce.copy_from_slice(&okm[32..]);
        Ok((key, nonce))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::backend::DecryptionError;
    use crate::crypto::Rng;

    use super::{DoubleRatchet, DoubleRatchetState, MAX_MESSAGE_GAP, MAX_SKIPPED_MESSAGE_KEYS};

    fn init(rng: &Rng) -> (DoubleRatchetState, DoubleRatchetState) {
        let shared_secret: [u8; 96] = rng.random_array().unwrap();
        let alice = DoubleRatchet::init_sender(&shared_secret, rng).unwrap();

        // Bob learns Alice's ratchet key from the first message.
        let (alice, first) = DoubleRatchet::encrypt(alice, b"hello", rng).unwrap();
        let bob = DoubleRatchet::init_receiver(&shared_secret, first.ratchet_key).unwrap();
        let (bob, plaintext) = DoubleRatchet::decrypt(bob, &first).unwrap();
        assert_eq!(plaintext.as_slice(), b"hello");

        (alice, bob)
    }

    #[test]
    fn ping_pong() {
        let rng = Rng::from_seed([1; 32]);
        let (mut alice, mut bob) = init(&rng);

        for round in 0..5u8 {
            let (bob_i, message) = DoubleRatchet::encrypt(bob, &[round], &rng).unwrap();
            let (alice_i, plaintext) = DoubleRatchet::decrypt(alice, &message).unwrap();
            assert_eq!(plaintext.as_slice(), &[round]);

            let (alice_i, message) =
                DoubleRatchet::encrypt(alice_i, &[round, round], &rng).unwrap();
            let (bob_i, plaintext) = DoubleRatchet::decrypt(bob_i, &message).unwrap();
            assert_eq!(plaintext.as_slice(), &[round, round]);

            alice = alice_i;
            bob = bob_i;
        }
    }

    #[test]
    fn ratchet_keys_change_with_direction() {
        let rng = Rng::from_seed([1; 32]);
        let (alice, bob) = init(&rng);

        let (alice, message_1) = DoubleRatchet::encrypt(alice, b"1", &rng).unwrap();
        let (bob, _) = DoubleRatchet::decrypt(bob, &message_1).unwrap();
        let (_bob, message_2) = DoubleRatchet::encrypt(bob, b"2", &rng).unwrap();
        let (alice, _) = DoubleRatchet::decrypt(alice, &message_2).unwrap();
        let (_alice, message_3) = DoubleRatchet::encrypt(alice, b"3", &rng).unwrap();

        assert_ne!(message_1.ratchet_key, message_2.ratchet_key);
        assert_ne!(message_1.ratchet_key, message_3.ratchet_key);
        assert_eq!(message_3.chain_index, 0);
    }

    #[test]
    fn out_of_order() {
        let rng = Rng::from_seed([1; 32]);
        let (alice, bob) = init(&rng);

        let (alice, message_1) = DoubleRatchet::encrypt(alice, b"Dum", &rng).unwrap();
        let (alice, message_2) = DoubleRatchet::encrypt(alice, b"Di", &rng).unwrap();
        let (_alice, message_3) = DoubleRatchet::encrypt(alice, b"Dum!", &rng).unwrap();

        let (bob, receive_3) = DoubleRatchet::decrypt(bob, &message_3).unwrap();
        let (bob, receive_1) = DoubleRatchet::decrypt(bob, &message_1).unwrap();
        let (bob, receive_2) = DoubleRatchet::decrypt(bob, &message_2).unwrap();

        assert_eq!(receive_1.as_slice(), b"Dum");
        assert_eq!(receive_2.as_slice(), b"Di");
        assert_eq!(receive_3.as_slice(), b"Dum!");

        // Keys of skipped messages are used only once.
        assert!(matches!(
            DoubleRatchet::decrypt(bob, &message_2),
            Err(DecryptionError::MissingMessageKey(2))
        ));
    }

    #[test]
    fn failed_decryption_keeps_state() {
        let rng = Rng::from_seed([1; 32]);
        let (alice, bob) = init(&rng);

        let (_alice, message) = DoubleRatchet::encrypt(alice, b"panda", &rng).unwrap();

        let mut tampered = message.clone();
        tampered.ciphertext[0] ^= 1;
        assert!(matches!(
            DoubleRatchet::decrypt(bob.clone(), &tampered),
            Err(DecryptionError::InvalidMac(_))
        ));

        // Tampering with the header is detected as well.
        let mut tampered = message.clone();
        tampered.chain_index += 1;
        assert!(DoubleRatchet::decrypt(bob.clone(), &tampered).is_err());

        // The untouched state still decrypts the original message.
        let (_bob, plaintext) = DoubleRatchet::decrypt(bob, &message).unwrap();
        assert_eq!(plaintext.as_slice(), b"panda");
    }

    #[test]
    fn bounded_skips() {
        let rng = Rng::from_seed([1; 32]);
        let (alice, bob) = init(&rng);

        let mut alice = alice;
        let mut messages = Vec::new();
        for i in 0..(MAX_SKIPPED_MESSAGE_KEYS + 5) {
            let (alice_i, message) = DoubleRatchet::encrypt(alice, &[i as u8], &rng).unwrap();
            alice = alice_i;
            messages.push(message);
        }

        // We refuse to derive too many keys at once.
        let mut far_ahead = messages[0].clone();
        far_ahead.chain_index = MAX_MESSAGE_GAP + 100;
        assert!(matches!(
            DoubleRatchet::decrypt(bob.clone(), &far_ahead),
            Err(DecryptionError::TooBigMessageGap(_))
        ));

        // Jump to the last message, the oldest skipped keys are dropped.
        let (bob, _) = DoubleRatchet::decrypt(bob, messages.last().unwrap()).unwrap();
        assert!(DoubleRatchet::decrypt(bob.clone(), &messages[0]).is_err());
        assert!(DoubleRatchet::decrypt(bob, &messages[10]).is_ok());
    }

    proptest! {
        #[test]
        fn bursts_in_any_direction(
            bursts in proptest::collection::vec((any::<bool>(), 1u8..10, any::<bool>()), 1..16),
        ) {
            let rng = Rng::from_seed([1; 32]);
            let (mut alice, mut bob) = init(&rng);

            for (from_alice, count, reversed) in bursts {
                let (mut sender, mut receiver) =
                    if from_alice { (alice, bob) } else { (bob, alice) };

                let mut messages = Vec::new();
                for i in 0..count {
                    let (sender_i, message) = DoubleRatchet::encrypt(sender, &[i], &rng).unwrap();
                    sender = sender_i;
                    messages.push((i, message));
                }

                // Messages of one burst may overtake each other.
                if reversed {
                    messages.reverse();
                }
                for (i, message) in messages {
                    let (receiver_i, plaintext) =
                        DoubleRatchet::decrypt(receiver, &message).unwrap();
                    receiver = receiver_i;
                    prop_assert_eq!(plaintext.as_slice(), &[i]);
                }

                (alice, bob) = if from_alice { (sender, receiver) } else { (receiver, sender) };
            }
        }
    }
}
