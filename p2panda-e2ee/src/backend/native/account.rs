// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device account holding identity, one-time and fallback keys.
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::native::session::Session;
use crate::backend::native::wire::PreKeyContent;
use crate::backend::{
    AccountBackend, AccountError, InboundCreationResult, PickleError, PickleKey, Resource,
    SessionCreationError, pickle, unpickle,
};
use crate::crypto::Rng;
use crate::crypto::ed25519::{Signature, SigningKey};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::encoding::decode_cbor;
use crate::identifiers::KeyId;
use crate::keys::IdentityKeys;
use crate::message::PreKeyMessage;

/// Number of one-time keys an account holds at most. Publishing half of it leaves room for keys
/// which were claimed but whose pre-key messages didn't arrive yet.
pub const MAX_ONE_TIME_KEYS: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct OneTimeKey {
    secret: SecretKey,
    public: PublicKey,
    published: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FallbackKey {
    key_id: KeyId,
    secret: SecretKey,
    public: PublicKey,
    published: bool,
    used: bool,
    /// When a replaced key may be forgotten, seconds since the UNIX epoch.
    forget_after: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    identity_secret: SecretKey,
    signing_key: SigningKey,
    one_time_keys: BTreeMap<KeyId, OneTimeKey>,
    next_key_id: u64,
    fallback_key: Option<FallbackKey>,
    previous_fallback_key: Option<FallbackKey>,
}

impl Account {
    fn next_key_id(&mut self) -> KeyId {
        let key_id = KeyId(self.next_key_id);
        self.next_key_id += 1;
        key_id
    }

    /// Finds the secret of a one-time or fallback key.
    fn find_secret(&self, public: &PublicKey) -> Option<&SecretKey> {
        self.one_time_keys
            .values()
            .find(|key| &key.public == public)
            .map(|key| &key.secret)
            .or_else(|| {
                [&self.fallback_key, &self.previous_fallback_key]
                    .into_iter()
                    .flatten()
                    .find(|key| &key.public == public)
                    .map(|key| &key.secret)
            })
    }

    /// Removes a used one-time key, fallback keys stay around and are marked as used instead.
    fn consume_key(&mut self, public: &PublicKey) {
        let one_time = self
            .one_time_keys
            .iter()
            .find(|(_, key)| &key.public == public)
            .map(|(key_id, _)| *key_id);
        if let Some(key_id) = one_time {
            self.one_time_keys.remove(&key_id);
            return;
        }

        for key in [&mut self.fallback_key, &mut self.previous_fallback_key]
            .into_iter()
            .flatten()
        {
            if &key.public == public {
                key.used = true;
            }
        }
    }

    pub fn fallback_key_used(&self) -> bool {
        self.fallback_key.as_ref().is_some_and(|key| key.used)
    }

    pub fn has_previous_fallback_key(&self) -> bool {
        self.previous_fallback_key.is_some()
    }
}

impl Resource for Account {
    const PICKLE_KIND: &'static str = "account";

    fn pickle(&self, pickle_key: Option<&PickleKey>, rng: &Rng) -> Result<String, PickleError> {
        pickle(self, Self::PICKLE_KIND, pickle_key, rng)
    }

    fn from_pickle(value: &str, pickle_key: Option<&PickleKey>) -> Result<Self, PickleError> {
        unpickle(value, Self::PICKLE_KIND, pickle_key)
    }
}

impl AccountBackend for Account {
    type Session = Session;

    fn new(rng: &Rng) -> Result<Self, AccountError> {
        Ok(Self {
            identity_secret: SecretKey::from_rng(rng)?,
            signing_key: SigningKey::from_rng(rng)?,
            one_time_keys: BTreeMap::new(),
            next_key_id: 0,
            fallback_key: None,
            previous_fallback_key: None,
        })
    }

    fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys {
            curve25519: self.identity_secret.public_key(),
            ed25519: self.signing_key.verifying_key(),
        }
    }

    fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    fn max_number_of_one_time_keys(&self) -> usize {
        MAX_ONE_TIME_KEYS
    }

    fn generate_one_time_keys(
        &mut self,
        count: usize,
        rng: &Rng,
    ) -> Result<Vec<KeyId>, AccountError> {
        let mut key_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let secret = SecretKey::from_rng(rng)?;
            let key_id = self.next_key_id();
            self.one_time_keys.insert(
                key_id,
                OneTimeKey {
                    public: secret.public_key(),
                    secret,
                    published: false,
                },
            );
            key_ids.push(key_id);
        }

        // Drop the oldest keys when exceeding the limit.
        while self.one_time_keys.len() > MAX_ONE_TIME_KEYS {
            if let Some((key_id, _)) = self.one_time_keys.pop_first() {
                debug!(key_id = %key_id, "dropping oldest one-time key");
            }
        }

        Ok(key_ids)
    }

    fn one_time_keys(&self) -> BTreeMap<KeyId, PublicKey> {
        self.one_time_keys
            .iter()
            .filter(|(_, key)| !key.published)
            .map(|(key_id, key)| (*key_id, key.public))
            .collect()
    }

    fn generate_fallback_key(
        &mut self,
        now: u64,
        grace: Duration,
        rng: &Rng,
    ) -> Result<KeyId, AccountError> {
        let secret = SecretKey::from_rng(rng)?;
        let key_id = self.next_key_id();

        if let Some(mut previous) = self.fallback_key.take() {
            // Messages created with the replaced key may still be in flight.
            previous.forget_after = Some(now.saturating_add(grace.as_secs()));
            self.previous_fallback_key = Some(previous);
        }

        self.fallback_key = Some(FallbackKey {
            key_id,
            public: secret.public_key(),
            secret,
            published: false,
            used: false,
            forget_after: None,
        });

        Ok(key_id)
    }

    fn fallback_key(&self) -> BTreeMap<KeyId, PublicKey> {
        self.fallback_key
            .iter()
            .filter(|key| !key.published)
            .map(|key| (key.key_id, key.public))
            .collect()
    }

    fn forget_old_fallback_key(&mut self, now: u64) -> bool {
        let expired = self
            .previous_fallback_key
            .as_ref()
            .and_then(|key| key.forget_after)
            .is_some_and(|forget_after| forget_after <= now);
        if expired {
            self.previous_fallback_key = None;
        }
        expired
    }

    fn mark_keys_as_published(&mut self) {
        for key in self.one_time_keys.values_mut() {
            key.published = true;
        }
        if let Some(key) = self.fallback_key.as_mut() {
            key.published = true;
        }
    }

    fn create_outbound_session(
        &self,
        their_identity_key: PublicKey,
        their_one_time_key: PublicKey,
        rng: &Rng,
    ) -> Result<Session, SessionCreationError> {
        Session::new_outbound(
            &self.identity_secret,
            their_identity_key,
            their_one_time_key,
            rng,
        )
    }

    fn create_inbound_session(
        &mut self,
        their_identity_key: PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult<Session>, SessionCreationError> {
        let content: PreKeyContent = decode_cbor(message.as_bytes())?;
        if content.identity_key != their_identity_key {
            return Err(SessionCreationError::MismatchedIdentityKey {
                expected: their_identity_key.to_base64(),
                found: content.identity_key.to_base64(),
            });
        }

        let one_time_secret = self
            .find_secret(&content.one_time_key)
            .ok_or_else(|| {
                SessionCreationError::MissingOneTimeKey(content.one_time_key.to_base64())
            })?;

        let (session, plaintext) =
            Session::new_inbound(&self.identity_secret, one_time_secret, &content)?;

        // Only consume the key after we know the message was genuine.
        self.consume_key(&content.one_time_key);

        Ok(InboundCreationResult { session, plaintext })
    }
}
