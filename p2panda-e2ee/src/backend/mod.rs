// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability interface of the crypto backend.
//!
//! Session selection, replay protection and verification logic only ever talk to these traits.
//! A concrete backend bundles one implementation of every capability through [`CryptoBackend`]
//! and is picked once by choosing the type parameter of the machine, there is no runtime
//! switching between backends.
//!
//! Every capability is a [`Resource`]: it can be turned into an opaque, versioned pickle string
//! and back, and it can be closed. Closing consumes the value, secret material is zeroed by the
//! `Drop` implementations of [`Secret`](crate::crypto::Secret) and friends on every exit path. A
//! closed resource can't be used again since it doesn't exist anymore.
//!
//! Pickle formats are owned by the backend and not compatible across backends. Group sessions can
//! be moved between backends through [`InboundGroupSessionBackend::export_at_first_known_index`]
//! and [`InboundGroupSessionBackend::import`].
mod error;
pub mod native;
mod pickle;

use std::collections::BTreeMap;
use std::time::Duration;

use zeroize::Zeroizing;

pub use error::{
    AccountError, DecryptionError, EncryptionError, GroupDecryptionError, GroupSessionError,
    PickleError, SessionCreationError,
};
pub use pickle::PickleKey;
pub(crate) use pickle::{pickle, unpickle};

use crate::crypto::Rng;
use crate::crypto::ed25519::{Signature, VerifyingKey};
use crate::crypto::x25519::PublicKey;
use crate::identifiers::{KeyId, SessionId};
use crate::keys::{IdentityKeys, JsonSigner};
use crate::message::{ExportedSessionKey, MegolmMessage, OlmMessage, PreKeyMessage, SessionKey};

/// One concrete backend, bundling implementations of all capabilities.
pub trait CryptoBackend: Send + Sync + 'static {
    type Account: AccountBackend<Session = Self::Session>;
    type Session: SessionBackend;
    type GroupSession: GroupSessionBackend;
    type InboundGroupSession: InboundGroupSessionBackend;

    /// Name of the backend, used in logs.
    fn name() -> &'static str;
}

/// Secret-bearing value which can be persisted as a pickle and closed.
pub trait Resource: Sized + Send {
    /// Kind of the resource, bound to its pickles.
    const PICKLE_KIND: &'static str;

    fn pickle(&self, pickle_key: Option<&PickleKey>, rng: &Rng) -> Result<String, PickleError>;

    fn from_pickle(pickle: &str, pickle_key: Option<&PickleKey>) -> Result<Self, PickleError>;

    /// Discards the resource and zeroes its secret material.
    fn close(self) {
        drop(self)
    }
}

/// Result of creating a pairwise session from a pre-key message.
pub struct InboundCreationResult<S> {
    pub session: S,
    pub plaintext: Zeroizing<Vec<u8>>,
}

/// Device account: identity keys, one-time keys and fallback keys.
pub trait AccountBackend: Resource {
    type Session: SessionBackend;

    fn new(rng: &Rng) -> Result<Self, AccountError>;

    fn identity_keys(&self) -> IdentityKeys;

    /// Signs bytes with the device's Ed25519 key.
    fn sign(&self, message: &[u8]) -> Signature;

    /// Upper bound of one-time keys the account keeps, older keys get dropped when exceeding it.
    fn max_number_of_one_time_keys(&self) -> usize;

    fn generate_one_time_keys(&mut self, count: usize, rng: &Rng)
    -> Result<Vec<KeyId>, AccountError>;

    /// One-time keys which were not published yet.
    fn one_time_keys(&self) -> BTreeMap<KeyId, PublicKey>;

    /// Replaces the fallback key. The previous one stays usable for `grace` after `now` (seconds
    /// since the UNIX epoch).
    fn generate_fallback_key(
        &mut self,
        now: u64,
        grace: Duration,
        rng: &Rng,
    ) -> Result<KeyId, AccountError>;

    /// Fallback key if it was not published yet.
    fn fallback_key(&self) -> BTreeMap<KeyId, PublicKey>;

    /// Forgets the previous fallback key when its grace period is over. Returns `true` if a key
    /// was removed.
    fn forget_old_fallback_key(&mut self, now: u64) -> bool;

    /// Marks all one-time and fallback keys as published.
    fn mark_keys_as_published(&mut self);

    fn create_outbound_session(
        &self,
        their_identity_key: PublicKey,
        their_one_time_key: PublicKey,
        rng: &Rng,
    ) -> Result<Self::Session, SessionCreationError>;

    /// Creates a session from the first message of another device, consuming the used one-time
    /// key. The account is only changed when the message could be decrypted.
    fn create_inbound_session(
        &mut self,
        their_identity_key: PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult<Self::Session>, SessionCreationError>;
}

/// Signs JSON with the device key of an account.
pub struct AccountSigner<'a, A>(pub &'a A);

impl<A: AccountBackend> JsonSigner for AccountSigner<'_, A> {
    fn sign_bytes(&self, message: &[u8]) -> Signature {
        self.0.sign(message)
    }
}

/// Pairwise ratcheting session with one other device.
pub trait SessionBackend: Resource {
    fn session_id(&self) -> SessionId;

    /// `false` while we've only been sending pre-key messages and never heard back.
    fn has_received_message(&self) -> bool;

    fn encrypt(&mut self, plaintext: &[u8], rng: &Rng) -> Result<OlmMessage, EncryptionError>;

    /// Decrypts and advances the ratchet. Failures leave the session untouched.
    fn decrypt(&mut self, message: &OlmMessage) -> Result<Zeroizing<Vec<u8>>, DecryptionError>;

    /// Whether a pre-key message was created for this very session.
    fn matches_pre_key_message(
        &self,
        their_identity_key: &PublicKey,
        message: &PreKeyMessage,
    ) -> bool;
}

/// Writing side of a group session.
pub trait GroupSessionBackend: Resource {
    fn new(rng: &Rng) -> Result<Self, GroupSessionError>;

    fn session_id(&self) -> SessionId;

    /// Index the next message will be encrypted with.
    fn message_index(&self) -> u32;

    /// Key to share with other devices, starting at the current message index.
    fn session_key(&self) -> Result<SessionKey, GroupSessionError>;

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<MegolmMessage, EncryptionError>;
}

/// Decrypted group message with its index.
pub struct DecryptedMessage {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub message_index: u32,
}

/// Reading side of a group session.
pub trait InboundGroupSessionBackend: Resource {
    fn new(session_key: &SessionKey) -> Result<Self, GroupSessionError>;

    fn import(exported_key: &ExportedSessionKey) -> Result<Self, GroupSessionError>;

    fn session_id(&self) -> SessionId;

    fn first_known_index(&self) -> u32;

    /// Key which signs all messages of the session.
    fn signing_key(&self) -> VerifyingKey;

    /// `false` for imported sessions where we couldn't check the key's signature.
    fn is_verified(&self) -> bool;

    fn decrypt(
        &mut self,
        message: &MegolmMessage,
    ) -> Result<DecryptedMessage, GroupDecryptionError>;

    /// Export starting at `index`, `None` if the index is below the first known index.
    fn export_at(&self, index: u32) -> Result<Option<ExportedSessionKey>, GroupSessionError>;

    fn export_at_first_known_index(&self) -> Result<ExportedSessionKey, GroupSessionError>;
}
