// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hash ratchet of group sessions.
//!
//! The ratchet consists of four 256-bit parts `R0..R3` and a 32-bit counter. Part `Ri` is
//! re-hashed every `2^(8 * (3 - i))` steps and then seeds all parts after it, so advancing by a
//! large amount costs at most `4 * 256` hash operations:
//!
//! ```text
//! rehash(Ri -> Rj) = HMAC-SHA256(key = Ri, data = [j])
//! ```
//!
//! Knowing the ratchet at index `n` allows deriving any later index, but not an earlier one.
use serde::{Deserialize, Serialize};

use crate::crypto::Secret;
use crate::crypto::aead::{AeadKey, AeadNonce};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::hmac::hmac_sha256;

pub const RATCHET_PART_SIZE: usize = 32;

pub const RATCHET_PARTS: usize = 4;

pub const RATCHET_SIZE: usize = RATCHET_PART_SIZE * RATCHET_PARTS;

const GROUP_KEYS_INFO: &[u8] = b"P2PANDA_E2EE_GROUP_KEYS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmRatchet {
    inner: Secret<RATCHET_SIZE>,
    counter: u32,
}

impl MegolmRatchet {
    pub fn new(inner: Secret<RATCHET_SIZE>, counter: u32) -> Self {
        Self { inner, counter }
    }

    pub fn index(&self) -> u32 {
        self.counter
    }

    pub fn as_secret(&self) -> &Secret<RATCHET_SIZE> {
        &self.inner
    }

    fn part(&self, i: usize) -> &[u8] {
        &self.inner.as_bytes()[i * RATCHET_PART_SIZE..(i + 1) * RATCHET_PART_SIZE]
    }

    fn rehash_part(&mut self, from: usize, to: usize) {
        let hash = hmac_sha256(self.part(from), &[to as u8]);
        self.inner.as_bytes_mut()[to * RATCHET_PART_SIZE..(to + 1) * RATCHET_PART_SIZE]
            .copy_from_slice(&hash);
    }

    /// Moves the ratchet one step forward.
    pub fn advance(&mut self) {
        self.counter = self.counter.wrapping_add(1);

        // Find the highest part which needs to change with this step.
        let mut mask: u32 = 0x00FF_FFFF;
        let mut h = 0;
        while h < RATCHET_PARTS {
            if self.counter & mask == 0 {
                break;
            }
            h += 1;
            mask >>= 8;
        }

        // Update parts from the end, so `Rh` seeds the others before it changes itself.
        for i in (h..RATCHET_PARTS).rev() {
            self.rehash_part(h, i);
        }
    }

    /// Moves the ratchet forward to `index`. Moving backwards wraps around the counter, callers
    /// need to make sure `index` is not below the current one.
    pub fn advance_to(&mut self, index: u32) {
        for j in 0..RATCHET_PARTS {
            let shift = (RATCHET_PARTS - 1 - j) * 8;
            let mask = u32::MAX << shift;

            let mut steps = (index >> shift).wrapping_sub(self.counter >> shift) & 0xff;
            if steps == 0 {
                if index < self.counter {
                    steps = 0x100;
                } else {
                    continue;
                }
            }

            // All but the last step only touch `Rj` itself.
            while steps > 1 {
                self.rehash_part(j, j);
                steps -= 1;
            }

            for k in (j..RATCHET_PARTS).rev() {
                self.rehash_part(j, k);
            }

            self.counter = index & mask;
        }
    }

    /// Derives key and nonce for the message at the current index.
    pub fn message_keys(&self) -> Result<(AeadKey, AeadNonce), HkdfError> {
        let keys: [u8; 44] = hkdf(b"", self.inner.as_bytes(), Some(GROUP_KEYS_INFO))?;
        let key: AeadKey = keys[..32].try_into().expect("aead key size");
        let nonce: AeadNonce = keys[32..].try_into().expect("aead nonce size");
        Ok((key, nonce))
    }
}
