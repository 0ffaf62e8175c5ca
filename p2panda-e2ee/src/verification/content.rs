// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages of the verification protocol, sent as plain to-device events.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::x25519::PublicKey;
use crate::identifiers::{DeviceId, DeviceKeyId, FlowId};

pub const SAS_METHOD: &str = "m.sas.v1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartContent {
    pub flow_id: FlowId,
    pub from_device: DeviceId,
    pub method: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptContent {
    pub flow_id: FlowId,
    /// Hash of the accepting device's public key and the start message.
    pub commitment: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContent {
    pub flow_id: FlowId,
    pub key: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacContent {
    pub flow_id: FlowId,
    /// MACs of the sender's keys by key id.
    pub mac: BTreeMap<DeviceKeyId, String>,
    /// MAC of the sorted key ids and the short authentication string.
    pub keys: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneContent {
    pub flow_id: FlowId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelContent {
    pub flow_id: FlowId,
    pub code: CancelCode,
    pub reason: String,
}

/// Why a verification was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelCode {
    /// The user cancelled.
    #[serde(rename = "m.user")]
    User,

    #[serde(rename = "m.timeout")]
    Timeout,

    #[serde(rename = "m.unknown_method")]
    UnknownMethod,

    #[serde(rename = "m.unexpected_message")]
    UnexpectedMessage,

    /// A MAC didn't match the expected keys.
    #[serde(rename = "m.key_mismatch")]
    KeyMismatch,

    #[serde(rename = "m.mismatched_commitment")]
    MismatchedCommitment,

    /// The users said the short codes differ.
    #[serde(rename = "m.mismatched_sas")]
    MismatchedSas,

    #[serde(rename = "m.invalid_message")]
    InvalidMessage,
}

impl CancelCode {
    pub fn reason(&self) -> &'static str {
        match self {
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::Timeout => "The verification timed out.",
            CancelCode::UnknownMethod => "The verification method is not supported.",
            CancelCode::UnexpectedMessage => "Received a message in an unexpected state.",
            CancelCode::KeyMismatch => "The keys of the other device could not be verified.",
            CancelCode::MismatchedCommitment => "The hash commitment did not match.",
            CancelCode::MismatchedSas => "The short authentication strings did not match.",
            CancelCode::InvalidMessage => "Received an invalid message.",
        }
    }
}

/// One message of the protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationMessage {
    Start(StartContent),
    Accept(AcceptContent),
    Key(KeyContent),
    Mac(MacContent),
    Done(DoneContent),
    Cancel(CancelContent),
}

impl VerificationMessage {
    pub const START: &'static str = "m.key.verification.start";
    pub const ACCEPT: &'static str = "m.key.verification.accept";
    pub const KEY: &'static str = "m.key.verification.key";
    pub const MAC: &'static str = "m.key.verification.mac";
    pub const DONE: &'static str = "m.key.verification.done";
    pub const CANCEL: &'static str = "m.key.verification.cancel";

    pub fn event_type(&self) -> &'static str {
        match self {
            VerificationMessage::Start(_) => Self::START,
            VerificationMessage::Accept(_) => Self::ACCEPT,
            VerificationMessage::Key(_) => Self::KEY,
            VerificationMessage::Mac(_) => Self::MAC,
            VerificationMessage::Done(_) => Self::DONE,
            VerificationMessage::Cancel(_) => Self::CANCEL,
        }
    }

    pub fn flow_id(&self) -> &FlowId {
        match self {
            VerificationMessage::Start(content) => &content.flow_id,
            VerificationMessage::Accept(content) => &content.flow_id,
            VerificationMessage::Key(content) => &content.flow_id,
            VerificationMessage::Mac(content) => &content.flow_id,
            VerificationMessage::Done(content) => &content.flow_id,
            VerificationMessage::Cancel(content) => &content.flow_id,
        }
    }

    pub fn cancel(flow_id: FlowId, code: CancelCode) -> Self {
        VerificationMessage::Cancel(CancelContent {
            flow_id,
            code,
            reason: code.reason().to_owned(),
        })
    }

    pub fn to_content(&self) -> Result<Value, serde_json::Error> {
        match self {
            VerificationMessage::Start(content) => serde_json::to_value(content),
            VerificationMessage::Accept(content) => serde_json::to_value(content),
            VerificationMessage::Key(content) => serde_json::to_value(content),
            VerificationMessage::Mac(content) => serde_json::to_value(content),
            VerificationMessage::Done(content) => serde_json::to_value(content),
            VerificationMessage::Cancel(content) => serde_json::to_value(content),
        }
    }

    /// Parses a to-device event, `None` if it's not a verification event.
    pub fn from_event(
        event_type: &str,
        content: Value,
    ) -> Option<Result<Self, serde_json::Error>> {
        let message = match event_type {
            Self::START => serde_json::from_value(content).map(VerificationMessage::Start),
            Self::ACCEPT => serde_json::from_value(content).map(VerificationMessage::Accept),
            Self::KEY => serde_json::from_value(content).map(VerificationMessage::Key),
            Self::MAC => serde_json::from_value(content).map(VerificationMessage::Mac),
            Self::DONE => serde_json::from_value(content).map(VerificationMessage::Done),
            Self::CANCEL => serde_json::from_value(content).map(VerificationMessage::Cancel),
            _ => return None,
        };
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::identifiers::FlowId;

    use super::{CancelCode, VerificationMessage};

    #[test]
    fn cancel_event() {
        let message = VerificationMessage::cancel(FlowId::new("flow"), CancelCode::MismatchedSas);
        let content = message.to_content().unwrap();
        assert_eq!(content["code"], json!("m.mismatched_sas"));

        let parsed = VerificationMessage::from_event(message.event_type(), content)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, message);

        assert!(VerificationMessage::from_event("m.room_key", json!({})).is_none());
        assert!(matches!(
            VerificationMessage::from_event(VerificationMessage::KEY, json!({})),
            Some(Err(_))
        ));
    }
}
