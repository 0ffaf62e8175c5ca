// SPDX-License-Identifier: MIT OR Apache-2.0

//! Short authentication strings from an ephemeral X25519 key agreement.
//!
//! Both devices create a [`Sas`], exchange the public keys and turn their own `Sas` and the other
//! public key into an [`EstablishedSas`]. Short codes and MACs are derived from the shared secret
//! with HKDF, so honest devices compute identical codes without ever transmitting them.
use thiserror::Error;

use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::hmac::{hmac_sha256, hmac_sha256_verify};
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError, Secret};
use crate::encoding::{base64_decode, base64_encode};

const SAS_BYTES: usize = 6;

const MAC_KEY_INFO: &[u8] = b"P2PANDA_E2EE_KEY_VERIFICATION_MAC_KEY";

/// Ephemeral key pair of one side of a verification.
pub struct Sas {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl Sas {
    pub fn new(rng: &Rng) -> Result<Self, RngError> {
        let secret_key = SecretKey::from_rng(rng)?;
        Ok(Self {
            public_key: secret_key.public_key(),
            secret_key,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Completes the key agreement. The ephemeral secret is consumed either way.
    pub fn diffie_hellman(self, their_public_key: PublicKey) -> Result<EstablishedSas, SasError> {
        let shared_secret = self
            .secret_key
            .calculate_agreement(&their_public_key)
            .map_err(|err| match err {
                X25519Error::NonContributory => SasError::NonContributory,
                err => SasError::X25519(err),
            })?;
        Ok(EstablishedSas {
            shared_secret,
            our_public_key: self.public_key,
            their_public_key,
        })
    }
}

/// Shared secret of a verification after both public keys were exchanged.
pub struct EstablishedSas {
    shared_secret: Secret<32>,
    our_public_key: PublicKey,
    their_public_key: PublicKey,
}

impl EstablishedSas {
    pub fn our_public_key(&self) -> PublicKey {
        self.our_public_key
    }

    pub fn their_public_key(&self) -> PublicKey {
        self.their_public_key
    }

    /// Derives the short codes. Both sides need to use the same `info`.
    pub fn short_auth_string(&self, info: &str) -> Result<ShortAuthString, SasError> {
        let bytes = hkdf(b"", self.shared_secret.as_bytes(), Some(info.as_bytes()))?;
        Ok(ShortAuthString { bytes })
    }

    fn mac_key(&self, info: &str) -> Result<[u8; 32], SasError> {
        let mut key_info = MAC_KEY_INFO.to_vec();
        key_info.extend_from_slice(info.as_bytes());
        Ok(hkdf(b"", self.shared_secret.as_bytes(), Some(&key_info))?)
    }

    /// Base64 encoded MAC over `input`, bound to `info`.
    pub fn calculate_mac(&self, input: &str, info: &str) -> Result<String, SasError> {
        let key = self.mac_key(info)?;
        Ok(base64_encode(hmac_sha256(&key, input.as_bytes())))
    }

    pub fn verify_mac(&self, input: &str, info: &str, tag: &str) -> Result<(), SasError> {
        let key = self.mac_key(info)?;
        let tag = base64_decode(tag).map_err(|_| SasError::InvalidMac)?;
        hmac_sha256_verify(&key, input.as_bytes(), &tag).map_err(|_| SasError::InvalidMac)
    }
}

/// Bytes both devices show to their users, as emoji or as decimal numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShortAuthString {
    bytes: [u8; SAS_BYTES],
}

impl ShortAuthString {
    pub fn as_bytes(&self) -> &[u8; SAS_BYTES] {
        &self.bytes
    }

    /// Seven indices into [`EMOJI`], six bits each.
    pub fn emoji_indices(&self) -> [u8; 7] {
        let mut number = 0u64;
        for byte in self.bytes {
            number = (number << 8) | byte as u64;
        }
        let mut indices = [0u8; 7];
        for (i, index) in indices.iter_mut().enumerate() {
            *index = ((number >> (42 - 6 * i)) & 0x3f) as u8;
        }
        indices
    }

    pub fn emoji(&self) -> [Emoji; 7] {
        self.emoji_indices().map(|index| EMOJI[index as usize])
    }

    /// Three numbers between 1000 and 9191, thirteen bits each.
    pub fn decimals(&self) -> (u16, u16, u16) {
        let [b0, b1, b2, b3, b4, _] = self.bytes.map(u16::from);
        let first = (b0 << 5) | (b1 >> 3);
        let second = ((b1 & 0x07) << 10) | (b2 << 2) | (b3 >> 6);
        let third = ((b3 & 0x3f) << 7) | (b4 >> 1);
        (first + 1000, second + 1000, third + 1000)
    }
}

#[derive(Debug, Error)]
pub enum SasError {
    #[error("public key of the other device is not contributory")]
    NonContributory,

    #[error("message authentication code does not match")]
    InvalidMac,

    #[error(transparent)]
    X25519(X25519Error),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Emoji {
    pub symbol: &'static str,
    pub description: &'static str,
}

const fn emoji(symbol: &'static str, description: &'static str) -> Emoji {
    Emoji {
        symbol,
        description,
    }
}

pub const EMOJI: [Emoji; 64] = [
    emoji("🐶", "Dog"),
    emoji("🐱", "Cat"),
    emoji("🦁", "Lion"),
    emoji("🐎", "Horse"),
    emoji("🦄", "Unicorn"),
    emoji("🐷", "Pig"),
    emoji("🐘", "Elephant"),
    emoji("🐰", "Rabbit"),
    emoji("🐼", "Panda"),
    emoji("🐓", "Rooster"),
    emoji("🐧", "Penguin"),
    emoji("🐢", "Turtle"),
    emoji("🐟", "Fish"),
    emoji("🐙", "Octopus"),
    emoji("🦋", "Butterfly"),
    emoji("🌷", "Flower"),
    emoji("🌳", "Tree"),
    emoji("🌵", "Cactus"),
    emoji("🍄", "Mushroom"),
    emoji("🌏", "Globe"),
    emoji("🌙", "Moon"),
    emoji("☁️", "Cloud"),
    emoji("🔥", "Fire"),
    emoji("🍌", "Banana"),
    emoji("🍎", "Apple"),
    emoji("🍓", "Strawberry"),
    emoji("🌽", "Corn"),
    emoji("🍕", "Pizza"),
    emoji("🎂", "Cake"),
    emoji("❤️", "Heart"),
    emoji("😀", "Smiley"),
    emoji("🤖", "Robot"),
    emoji("🎩", "Hat"),
    emoji("👓", "Glasses"),
    emoji("🔧", "Spanner"),
    emoji("🎅", "Santa"),
    emoji("👍", "Thumbs Up"),
    emoji("☂️", "Umbrella"),
    emoji("⌛", "Hourglass"),
    emoji("⏰", "Clock"),
    emoji("🎁", "Gift"),
    emoji("💡", "Light Bulb"),
    emoji("📕", "Book"),
    emoji("✏️", "Pencil"),
    emoji("📎", "Paperclip"),
    emoji("✂️", "Scissors"),
    emoji("🔒", "Lock"),
    emoji("🔑", "Key"),
    emoji("🔨", "Hammer"),
    emoji("☎️", "Telephone"),
    emoji("🏁", "Flag"),
    emoji("🚂", "Train"),
    emoji("🚲", "Bicycle"),
    emoji("✈️", "Aeroplane"),
    emoji("🚀", "Rocket"),
    emoji("🏆", "Trophy"),
    emoji("⚽", "Ball"),
    emoji("🎸", "Guitar"),
    emoji("🎺", "Trumpet"),
    emoji("🔔", "Bell"),
    emoji("⚓", "Anchor"),
    emoji("🎧", "Headphones"),
    emoji("📁", "Folder"),
    emoji("📌", "Pin"),
];

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::crypto::x25519::PublicKey;

    use super::{Sas, SasError, ShortAuthString};

    const INFO: &str = "P2PANDA_E2EE_KEY_VERIFICATION_SAS|test";

    #[test]
    fn both_sides_derive_the_same_codes() {
        let rng = Rng::from_seed([1; 32]);
        let alice = Sas::new(&rng).unwrap();
        let bob = Sas::new(&rng).unwrap();
        let alice_public = alice.public_key();
        let bob_public = bob.public_key();

        let alice = alice.diffie_hellman(bob_public).unwrap();
        let bob = bob.diffie_hellman(alice_public).unwrap();

        let alice_sas = alice.short_auth_string(INFO).unwrap();
        let bob_sas = bob.short_auth_string(INFO).unwrap();
        assert_eq!(alice_sas, bob_sas);
        assert_eq!(alice_sas.emoji(), bob_sas.emoji());
        assert_eq!(alice_sas.decimals(), bob_sas.decimals());

        // Different info, different codes.
        assert_ne!(alice.short_auth_string("other").unwrap(), alice_sas);

        let mac = alice.calculate_mac("key", "info").unwrap();
        assert!(bob.verify_mac("key", "info", &mac).is_ok());
        assert!(matches!(
            bob.verify_mac("other key", "info", &mac),
            Err(SasError::InvalidMac)
        ));
        assert!(matches!(
            bob.verify_mac("key", "other info", &mac),
            Err(SasError::InvalidMac)
        ));
    }

    #[test]
    fn non_contributory_keys_are_rejected() {
        let rng = Rng::from_seed([1; 32]);
        let sas = Sas::new(&rng).unwrap();
        assert!(matches!(
            sas.diffie_hellman(PublicKey::from_bytes([0; 32])),
            Err(SasError::NonContributory)
        ));
    }

    #[test]
    fn code_layout() {
        let sas = ShortAuthString {
            bytes: [0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
        };
        assert_eq!(sas.emoji_indices(), [63; 7]);
        assert_eq!(sas.decimals(), (9191, 9191, 9191));

        let sas = ShortAuthString { bytes: [0; 6] };
        assert_eq!(sas.emoji_indices(), [0; 7]);
        assert_eq!(sas.decimals(), (1000, 1000, 1000));

        // First emoji takes the six highest bits.
        let sas = ShortAuthString {
            bytes: [0b1000_0100, 0, 0, 0, 0, 0],
        };
        assert_eq!(sas.emoji_indices()[0], 0b100001);
        assert_eq!(sas.emoji()[0].description, "Glasses");
    }
}
