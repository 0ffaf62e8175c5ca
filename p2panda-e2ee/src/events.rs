// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event contents exchanged between devices, in encrypted and decrypted form.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::ed25519::VerifyingKey;
use crate::crypto::x25519::PublicKey;
use crate::identifiers::{DeviceId, RoomId, SessionId, UserId};
use crate::message::{ExportedSessionKey, SessionKey};

/// Event types handled by the crate.
pub mod event_types {
    /// Encrypted to-device or room event.
    pub const ENCRYPTED: &str = "m.room.encrypted";

    /// Key of a group session, only ever sent inside pairwise-encrypted events.
    pub const ROOM_KEY: &str = "m.room_key";

    pub const KEY_VERIFICATION_PREFIX: &str = "m.key.verification.";
}

/// Pairwise ciphertext for one recipient device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    #[serde(rename = "type")]
    pub message_type: u8,
    pub body: String,
}

/// Content of a pairwise-encrypted to-device event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmEncryptedContent {
    pub algorithm: String,
    pub sender_key: PublicKey,
    /// Ciphertexts by the Curve25519 identity key of the recipient device.
    pub ciphertext: BTreeMap<PublicKey, OlmCiphertext>,
}

/// Content of a room event encrypted with a group session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmEncryptedContent {
    pub algorithm: String,
    pub sender_key: PublicKey,
    pub device_id: DeviceId,
    pub session_id: SessionId,
    /// Base64 encoded group message.
    pub ciphertext: String,
}

/// Content of an `m.room_key` event, carrying a group session key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyContent {
    pub algorithm: String,
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub session_key: SessionKey,
}

/// Ed25519 key of a device, as embedded in pairwise payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ed25519Keys {
    pub ed25519: VerifyingKey,
}

/// Plaintext of a pairwise-encrypted event.
///
/// Sender and recipient are part of the encrypted payload, so a ciphertext can't be forwarded to
/// another device or be claimed by another sender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Value,
    pub sender: UserId,
    pub sender_device: DeviceId,
    pub keys: Ed25519Keys,
    pub recipient: UserId,
    pub recipient_keys: Ed25519Keys,
}

/// Plaintext of a group-encrypted room event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Value,
    pub room_id: RoomId,
}

/// Event sent directly to devices, either in plain or encrypted with a pairwise session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    pub sender: UserId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Value,
}

/// Group-encrypted event as delivered by the room timeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRoomEvent {
    pub sender: UserId,
    pub room_id: RoomId,
    pub content: MegolmEncryptedContent,
}

/// Result of decrypting a pairwise-encrypted to-device event.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedToDeviceEvent {
    pub sender: UserId,
    pub sender_device: DeviceId,
    pub sender_key: PublicKey,
    pub sender_ed25519: VerifyingKey,
    pub event_type: String,
    pub content: Value,
}

/// Result of decrypting a room event.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedRoomEvent {
    pub sender: UserId,
    pub sender_key: PublicKey,
    pub sender_device: DeviceId,
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub message_index: u32,
    pub event_type: String,
    pub content: Value,
    /// `false` when the room key was imported from a backup and its origin can't be proven.
    pub verified: bool,
}

/// Exported key of an inbound group session, as stored in key backups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    pub algorithm: String,
    pub room_id: RoomId,
    pub sender_key: PublicKey,
    pub session_id: SessionId,
    pub session_key: ExportedSessionKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Invite,
    Join,
    Knock,
    Leave,
    Ban,
}

impl Membership {
    /// Whether the user is no longer part of the room.
    pub fn is_departure(&self) -> bool {
        matches!(self, Membership::Leave | Membership::Ban)
    }
}

/// Which memberships to include when asking for room members.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipFilter {
    Joined,
    JoinedAndInvited,
}

/// Who can read the history of a room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryVisibility {
    Invited,
    Joined,
    #[default]
    Shared,
    WorldReadable,
}

impl HistoryVisibility {
    /// Whether members can read messages sent before they joined.
    pub fn is_shared(&self) -> bool {
        matches!(self, HistoryVisibility::Shared | HistoryVisibility::WorldReadable)
    }
}

/// Trust state of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Verified,
    #[default]
    Undecided,
    Blocked,
}

/// Membership of a user in a room changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub membership: Membership,
}
