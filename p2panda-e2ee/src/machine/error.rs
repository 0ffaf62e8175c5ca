// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use thiserror::Error;

use crate::backend::{
    AccountError, EncryptionError, GroupDecryptionError, GroupSessionError, SessionCreationError,
};
use crate::crypto::RngError;
use crate::crypto::x25519::PublicKey;
use crate::encoding::Base64Error;
use crate::identifiers::{DeviceId, RoomId, SessionId, UserId};
use crate::keys::SignatureError;
use crate::message::OlmMessageError;
use crate::retry::RetryError;
use crate::store::StoreError;
use crate::verification::VerificationError;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("homeserver request failed: {0}")]
    Network(RetryError<Box<dyn Error + Send + Sync>>),

    #[error("room directory failed: {0}")]
    RoomDirectory(Box<dyn Error + Send + Sync>),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    GroupSession(#[from] GroupSessionError),

    #[error(transparent)]
    GroupDecryption(#[from] GroupDecryptionError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    OlmMessage(#[from] OlmMessageError),

    #[error(transparent)]
    Encoding(#[from] Base64Error),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("event carries no ciphertext for this device")]
    MissingCiphertext,

    #[error("no pairwise session with {0} could decrypt the message")]
    NoMatchingSession(PublicKey),

    #[error("device {1} of {0} is unknown or its keys are invalid")]
    UnknownDevice(UserId, DeviceId),

    #[error("device {1} of {0} has no one-time keys left")]
    MissingOneTimeKey(UserId, DeviceId),

    #[error("no room key for session {session_id} in {room_id}")]
    MissingRoomKey {
        room_id: RoomId,
        session_id: SessionId,
    },

    /// A different message was decrypted at this index before.
    #[error("message {message_index} of session {session_id} in {room_id} was replayed")]
    ReplayDetected {
        room_id: RoomId,
        session_id: SessionId,
        message_index: u32,
    },

    #[error("sender of the event doesn't match the encrypted payload")]
    MismatchedSender,

    #[error("event was encrypted for another device")]
    MismatchedRecipient,

    #[error("encrypted payload belongs to another room")]
    MismatchedRoom,

    #[error("session key doesn't belong to session {0}")]
    MismatchedSessionId(SessionId),

    #[error("room {0} is not encrypted")]
    RoomNotEncrypted(RoomId),

    #[error("operation was cancelled")]
    Cancelled,
}

impl MachineError {
    pub(crate) fn network<E>(error: RetryError<E>) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        match error {
            RetryError::Cancelled => MachineError::Cancelled,
            error => MachineError::Network(
                error.map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>),
            ),
        }
    }

    pub(crate) fn room_directory(error: impl Error + Send + Sync + 'static) -> Self {
        MachineError::RoomDirectory(Box::new(error))
    }
}
