// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence of accounts and sessions.
//!
//! Secret state only ever reaches the [`CryptoStore`] as pickles. [`SessionStore`] sits on top of
//! it, unpickles resources for the machine and serializes access per peer, room or group session
//! through [`KeyLocks`].
mod locks;
mod memory;
mod session_store;

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;

use serde::{Deserialize, Serialize};

use crate::crypto::ed25519::VerifyingKey;
use crate::crypto::x25519::PublicKey;
use crate::identifiers::{DeviceId, RoomId, SessionId, UserId};

pub use locks::{KeyGuard, KeyLocks};
pub use memory::MemoryStore;
pub use session_store::{Loaded, LoadedSession, LockKey, SessionStore, StoreError};

/// Persisted pairwise session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Curve25519 identity key of the other device.
    pub sender_key: PublicKey,
    pub session_id: SessionId,
    pub pickle: String,
    /// Increases with every use, the most recently used session has the highest value.
    pub last_use: u64,
}

/// Persisted outbound group session of a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundGroupSessionRecord {
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub pickle: String,
    /// Creation time in seconds since the UNIX epoch.
    pub created_at: u64,
    /// Devices which received the session key.
    pub shared_with: BTreeMap<UserId, BTreeSet<DeviceId>>,
}

impl OutboundGroupSessionRecord {
    pub fn is_shared_with(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.shared_with
            .get(user_id)
            .is_some_and(|devices| devices.contains(device_id))
    }
}

/// Persisted inbound group session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundGroupSessionRecord {
    pub room_id: RoomId,
    pub session_id: SessionId,
    /// Curve25519 identity key of the device which created the session.
    pub sender_key: PublicKey,
    /// Device which sent the session key, unknown for imported keys.
    pub sender_device: Option<DeviceId>,
    pub signing_key: VerifyingKey,
    pub pickle: String,
    pub first_known_index: u32,
    pub imported: bool,
}

/// Hash of a decrypted group message, by message index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHash {
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub message_index: u32,
    #[serde(with = "crate::encoding::base64_array")]
    pub hash: [u8; 32],
}

/// Batch of changes which are persisted atomically.
#[derive(Clone, Debug, Default)]
pub struct Changes {
    pub account: Option<String>,
    pub sessions: Vec<SessionRecord>,
    pub outbound_group_sessions: Vec<OutboundGroupSessionRecord>,
    pub discarded_outbound_group_sessions: Vec<RoomId>,
    pub inbound_group_sessions: Vec<InboundGroupSessionRecord>,
    pub message_hashes: Vec<MessageHash>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.discarded_outbound_group_sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.message_hashes.is_empty()
    }
}

/// Storage of pickled state.
///
/// Implementations need interior mutability as the machine shares one store between concurrent
/// operations; [`CryptoStore::save_changes`] has to apply all changes or none.
pub trait CryptoStore {
    type Error: Error + Send + Sync + 'static;

    fn account(&self) -> impl Future<Output = Result<Option<String>, Self::Error>>;

    /// All pairwise sessions with a device.
    fn sessions(
        &self,
        sender_key: &PublicKey,
    ) -> impl Future<Output = Result<Vec<SessionRecord>, Self::Error>>;

    fn outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> impl Future<Output = Result<Option<OutboundGroupSessionRecord>, Self::Error>>;

    fn inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<Option<InboundGroupSessionRecord>, Self::Error>>;

    fn inbound_group_sessions(
        &self,
    ) -> impl Future<Output = Result<Vec<InboundGroupSessionRecord>, Self::Error>>;

    fn message_hash(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
        message_index: u32,
    ) -> impl Future<Output = Result<Option<[u8; 32]>, Self::Error>>;

    fn save_changes(&self, changes: Changes) -> impl Future<Output = Result<(), Self::Error>>;
}
