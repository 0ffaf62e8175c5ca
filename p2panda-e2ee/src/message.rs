// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opaque ciphertexts and session keys exchanged between devices.
//!
//! The orchestrator never looks inside these values, their binary layout belongs to the crypto
//! backend. On the wire they travel as unpadded base64 strings.
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encoding::{Base64Error, base64_decode, base64_encode};

macro_rules! opaque_bytes {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(#[serde(with = "serde_bytes")] Vec<u8>);

        impl $name {
            pub fn from_bytes(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_base64(&self) -> String {
                base64_encode(&self.0)
            }

            pub fn from_base64(value: &str) -> Result<Self, Base64Error> {
                Ok(Self(base64_decode(value)?))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({} bytes)", stringify!($name), self.0.len())
            }
        }
    };
}

opaque_bytes!(
    /// Normal message of an established pairwise session.
    Message
);

opaque_bytes!(
    /// First messages of a pairwise session, carrying what the receiver needs to create the
    /// inbound session.
    PreKeyMessage
);

opaque_bytes!(
    /// Signed and encrypted message of a group session.
    MegolmMessage
);

/// Pairwise ciphertext, tagged with its type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OlmMessage {
    PreKey(PreKeyMessage),
    Normal(Message),
}

impl OlmMessage {
    pub const PRE_KEY_TYPE: u8 = 0;
    pub const NORMAL_TYPE: u8 = 1;

    pub fn message_type(&self) -> u8 {
        match self {
            OlmMessage::PreKey(_) => Self::PRE_KEY_TYPE,
            OlmMessage::Normal(_) => Self::NORMAL_TYPE,
        }
    }

    pub fn from_parts(message_type: u8, body: &str) -> Result<Self, OlmMessageError> {
        match message_type {
            Self::PRE_KEY_TYPE => Ok(OlmMessage::PreKey(PreKeyMessage::from_base64(body)?)),
            Self::NORMAL_TYPE => Ok(OlmMessage::Normal(Message::from_base64(body)?)),
            other => Err(OlmMessageError::UnknownType(other)),
        }
    }

    /// Message type and base64 body.
    pub fn to_parts(&self) -> (u8, String) {
        match self {
            OlmMessage::PreKey(message) => (Self::PRE_KEY_TYPE, message.to_base64()),
            OlmMessage::Normal(message) => (Self::NORMAL_TYPE, message.to_base64()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OlmMessageError {
    #[error("unknown pairwise message type {0}")]
    UnknownType(u8),

    #[error(transparent)]
    Encoding(#[from] Base64Error),
}

macro_rules! secret_string {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: String) -> Self {
                Self(value)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(***)"))
            }
        }
    };
}

secret_string!(
    /// Signed key of a group session, shared with room members over pairwise sessions.
    SessionKey
);

secret_string!(
    /// Unsigned key of a group session starting at some message index, for backups.
    ExportedSessionKey
);

#[cfg(test)]
mod tests {
    use super::{Message, OlmMessage, OlmMessageError, PreKeyMessage, SessionKey};

    #[test]
    fn parts() {
        let message = OlmMessage::PreKey(PreKeyMessage::from_bytes(vec![1, 2, 3]));
        let (message_type, body) = message.to_parts();
        assert_eq!(message_type, 0);
        assert_eq!(OlmMessage::from_parts(message_type, &body).unwrap(), message);

        let message = OlmMessage::Normal(Message::from_bytes(vec![4, 5]));
        let (message_type, body) = message.to_parts();
        assert_eq!(message_type, 1);
        assert_eq!(OlmMessage::from_parts(message_type, &body).unwrap(), message);

        assert!(matches!(
            OlmMessage::from_parts(7, &body),
            Err(OlmMessageError::UnknownType(7))
        ));
    }

    #[test]
    fn secrets_are_not_printed() {
        let key = SessionKey::new("very secret".into());
        assert_eq!(format!("{key:?}"), "SessionKey(***)");
    }
}
