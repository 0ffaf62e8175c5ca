// SPDX-License-Identifier: MIT OR Apache-2.0

//! State machine of one SAS verification between two devices.
//!
//! ```text
//! Alice (starts)                      Bob (accepts)
//!    ── start ──────────────────────────▶
//!    ◀────────────── accept(commitment) ──
//!    ── key(A) ─────────────────────────▶
//!    ◀──────────────────────── key(B) ────
//!      users compare the short codes
//!    ── mac ────────────────────────────▶
//!    ◀──────────────────────────── mac ───
//!    ── done ───────────────────────────▶
//!    ◀─────────────────────────── done ───
//! ```
//!
//! Bob commits to their key before learning Alice's, so neither side can pick its key after
//! seeing the other one to steer the short codes. Every operation consumes the flow and returns
//! its next state together with the messages to send.
use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::crypto::ed25519::VerifyingKey;
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519::PublicKey;
use crate::crypto::{Rng, RngError};
use crate::encoding::base64_encode;
use crate::identifiers::{DeviceId, DeviceKeyId, FlowId, UserId};
use crate::keys::{CanonicalJsonError, to_canonical_json};
use crate::verification::content::{
    AcceptContent, CancelCode, DoneContent, KeyContent, MacContent, SAS_METHOD, StartContent,
    VerificationMessage,
};
use crate::verification::sas::{EstablishedSas, Sas, ShortAuthString};

const SAS_INFO: &str = "P2PANDA_E2EE_KEY_VERIFICATION_SAS";

const MAC_INFO: &str = "P2PANDA_E2EE_KEY_VERIFICATION_MAC";

/// Identity of a device taking part in a verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationDevice {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub ed25519: VerifyingKey,
}

/// Observable state of a verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationState {
    /// Started by us, waiting for the other device to accept.
    Started,
    /// Started by the other device, waiting for our user to accept.
    Requested,
    /// Accepted, waiting for the public keys.
    Accepted,
    /// Short codes are ready to be compared.
    KeysExchanged,
    /// Our user confirmed the codes, waiting for the other device's MAC.
    Confirmed,
    /// The other device's MAC is valid, waiting for our user to confirm.
    MacReceived,
    Done,
    Cancelled { code: CancelCode, by_us: bool },
}

enum State {
    Started {
        sas: Sas,
    },
    Requested {
        sas: Sas,
    },
    /// `commitment` is set on the starting side, which has to check it against the key.
    Accepted {
        sas: Sas,
        commitment: Option<String>,
    },
    KeysExchanged {
        sas: EstablishedSas,
        short_auth_string: ShortAuthString,
        confirmed: bool,
        their_mac_verified: bool,
    },
    Done,
    Cancelled {
        code: CancelCode,
        by_us: bool,
    },
}

pub struct SasVerification {
    flow_id: FlowId,
    own: VerificationDevice,
    other: VerificationDevice,
    we_started: bool,
    start: StartContent,
    started_at: Instant,
    timeout: Duration,
    state: State,
}

impl SasVerification {
    /// Starts a verification with another device.
    pub fn start(
        own: VerificationDevice,
        other: VerificationDevice,
        flow_id: FlowId,
        timeout: Duration,
        rng: &Rng,
    ) -> Result<(Self, VerificationMessage), VerificationError> {
        let start = StartContent {
            flow_id: flow_id.clone(),
            from_device: own.device_id.clone(),
            method: SAS_METHOD.to_owned(),
        };
        let y = Self {
            flow_id,
            own,
            other,
            we_started: true,
            start: start.clone(),
            started_at: Instant::now(),
            timeout,
            state: State::Started {
                sas: Sas::new(rng)?,
            },
        };
        Ok((y, VerificationMessage::Start(start)))
    }

    /// Handles a verification started by another device. Unsupported methods cancel right away.
    pub fn from_start(
        own: VerificationDevice,
        other: VerificationDevice,
        start: StartContent,
        timeout: Duration,
        rng: &Rng,
    ) -> Result<(Self, Option<VerificationMessage>), VerificationError> {
        let y = Self {
            flow_id: start.flow_id.clone(),
            own,
            other,
            we_started: false,
            started_at: Instant::now(),
            timeout,
            state: State::Requested {
                sas: Sas::new(rng)?,
            },
            start,
        };
        if y.start.method != SAS_METHOD {
            return Ok(Self::cancel(y, CancelCode::UnknownMethod));
        }
        Ok((y, None))
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    pub fn other_device(&self) -> &VerificationDevice {
        &self.other
    }

    pub fn we_started(&self) -> bool {
        self.we_started
    }

    pub fn state(&self) -> VerificationState {
        match &self.state {
            State::Started { .. } => VerificationState::Started,
            State::Requested { .. } => VerificationState::Requested,
            State::Accepted { .. } => VerificationState::Accepted,
            State::KeysExchanged {
                confirmed,
                their_mac_verified,
                ..
            } => match (confirmed, their_mac_verified) {
                (false, false) => VerificationState::KeysExchanged,
                (true, _) => VerificationState::Confirmed,
                (false, true) => VerificationState::MacReceived,
            },
            State::Done => VerificationState::Done,
            State::Cancelled { code, by_us } => VerificationState::Cancelled {
                code: *code,
                by_us: *by_us,
            },
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, State::Cancelled { .. })
    }

    fn is_terminal(&self) -> bool {
        self.is_done() || self.is_cancelled()
    }

    /// Short codes to show once the keys were exchanged.
    pub fn short_auth_string(&self) -> Option<ShortAuthString> {
        match &self.state {
            State::KeysExchanged {
                short_auth_string, ..
            } => Some(*short_auth_string),
            _ => None,
        }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) >= self.timeout
    }

    /// Accepts a verification another device started. The flow is returned unchanged when
    /// accepting fails.
    pub fn accept(mut y: Self) -> (Self, Result<VerificationMessage, VerificationError>) {
        let state = std::mem::replace(&mut y.state, State::Done);
        let State::Requested { sas } = state else {
            y.state = state;
            let err = VerificationError::UnexpectedState(y.state());
            return (y, Err(err));
        };
        let canonical_start = match to_canonical_json(&y.start) {
            Ok(canonical_start) => canonical_start,
            Err(err) => {
                y.state = State::Requested { sas };
                return (y, Err(err.into()));
            }
        };
        let commitment = base64_encode(sha2_256(&[
            sas.public_key().as_bytes(),
            canonical_start.as_bytes(),
        ]));
        y.state = State::Accepted {
            sas,
            commitment: None,
        };
        let message = VerificationMessage::Accept(AcceptContent {
            flow_id: y.flow_id.clone(),
            commitment,
        });
        (y, Ok(message))
    }

    /// Our user confirmed that both devices show the same codes. The flow is returned unchanged
    /// when confirming fails.
    pub fn confirm(mut y: Self) -> (Self, Result<Vec<VerificationMessage>, VerificationError>) {
        let state = std::mem::replace(&mut y.state, State::Done);
        let State::KeysExchanged {
            sas,
            short_auth_string,
            confirmed: false,
            their_mac_verified,
        } = state
        else {
            y.state = state;
            let err = VerificationError::UnexpectedState(y.state());
            return (y, Err(err));
        };

        let mac = match y.mac_content(&sas, &short_auth_string) {
            Ok(mac) => mac,
            Err(err) => {
                y.state = State::KeysExchanged {
                    sas,
                    short_auth_string,
                    confirmed: false,
                    their_mac_verified,
                };
                return (y, Err(err));
            }
        };
        let mut messages = vec![VerificationMessage::Mac(mac)];

        if their_mac_verified {
            debug!(flow_id = %y.flow_id, "verification done");
            y.state = State::Done;
            messages.push(y.done_message());
        } else {
            y.state = State::KeysExchanged {
                sas,
                short_auth_string,
                confirmed: true,
                their_mac_verified,
            };
        }
        (y, Ok(messages))
    }

    /// Cancels the flow, releasing the ephemeral key. Terminal flows stay as they are.
    pub fn cancel(y: Self, code: CancelCode) -> (Self, Option<VerificationMessage>) {
        if y.is_terminal() {
            return (y, None);
        }
        let (y, message) = Self::cancel_with(y, code);
        (y, message.into_iter().next())
    }

    pub fn check_timeout(y: Self, now: Instant) -> (Self, Option<VerificationMessage>) {
        if !y.is_terminal() && y.is_timed_out(now) {
            return Self::cancel(y, CancelCode::Timeout);
        }
        (y, None)
    }

    /// Handles a message of the other device.
    pub fn receive(
        mut y: Self,
        message: VerificationMessage,
        now: Instant,
    ) -> (Self, Vec<VerificationMessage>) {
        if y.is_terminal() {
            return (y, Vec::new());
        }
        if y.is_timed_out(now) && !matches!(message, VerificationMessage::Cancel(_)) {
            return Self::cancel_with(y, CancelCode::Timeout);
        }

        let state = std::mem::replace(&mut y.state, State::Done);
        match (state, message) {
            (_, VerificationMessage::Cancel(content)) => {
                debug!(
                    flow_id = %y.flow_id,
                    code = ?content.code,
                    "verification cancelled by other device"
                );
                y.state = State::Cancelled {
                    code: content.code,
                    by_us: false,
                };
                (y, Vec::new())
            }
            (State::Started { sas }, VerificationMessage::Accept(content)) => {
                let key = VerificationMessage::Key(KeyContent {
                    flow_id: y.flow_id.clone(),
                    key: sas.public_key(),
                });
                y.state = State::Accepted {
                    sas,
                    commitment: Some(content.commitment),
                };
                (y, vec![key])
            }
            (State::Accepted { sas, commitment }, VerificationMessage::Key(content)) => {
                if let Some(commitment) = commitment {
                    let Ok(canonical_start) = to_canonical_json(&y.start) else {
                        return Self::cancel_with(y, CancelCode::InvalidMessage);
                    };
                    let expected = base64_encode(sha2_256(&[
                        content.key.as_bytes(),
                        canonical_start.as_bytes(),
                    ]));
                    if expected != commitment {
                        return Self::cancel_with(y, CancelCode::MismatchedCommitment);
                    }
                }

                let our_key = sas.public_key();
                let Ok(established) = sas.diffie_hellman(content.key) else {
                    return Self::cancel_with(y, CancelCode::InvalidMessage);
                };
                let Ok(short_auth_string) =
                    established.short_auth_string(&y.sas_info(our_key, content.key))
                else {
                    return Self::cancel_with(y, CancelCode::InvalidMessage);
                };

                y.state = State::KeysExchanged {
                    sas: established,
                    short_auth_string,
                    confirmed: false,
                    their_mac_verified: false,
                };

                // The accepting side answers with its own key.
                let messages = if y.we_started {
                    Vec::new()
                } else {
                    vec![VerificationMessage::Key(KeyContent {
                        flow_id: y.flow_id.clone(),
                        key: our_key,
                    })]
                };
                (y, messages)
            }
            (
                State::KeysExchanged {
                    sas,
                    short_auth_string,
                    confirmed,
                    their_mac_verified: false,
                },
                VerificationMessage::Mac(content),
            ) => {
                if !y.verify_mac(&sas, &short_auth_string, &content) {
                    return Self::cancel_with(y, CancelCode::KeyMismatch);
                }
                if confirmed {
                    debug!(flow_id = %y.flow_id, "verification done");
                    y.state = State::Done;
                    let done = y.done_message();
                    (y, vec![done])
                } else {
                    y.state = State::KeysExchanged {
                        sas,
                        short_auth_string,
                        confirmed,
                        their_mac_verified: true,
                    };
                    (y, Vec::new())
                }
            }
            // The other device may finish before us.
            (
                state @ State::KeysExchanged {
                    their_mac_verified: true,
                    ..
                },
                VerificationMessage::Done(_),
            ) => {
                y.state = state;
                (y, Vec::new())
            }
            (state, _) => {
                y.state = state;
                Self::cancel_with(y, CancelCode::UnexpectedMessage)
            }
        }
    }

    /// Moves into the cancelled state, whatever the current state is.
    fn cancel_with(mut y: Self, code: CancelCode) -> (Self, Vec<VerificationMessage>) {
        warn!(flow_id = %y.flow_id, ?code, "cancelling verification");
        y.state = State::Cancelled { code, by_us: true };
        let message = VerificationMessage::cancel(y.flow_id.clone(), code);
        (y, vec![message])
    }

    fn done_message(&self) -> VerificationMessage {
        VerificationMessage::Done(DoneContent {
            flow_id: self.flow_id.clone(),
        })
    }

    /// Info for the short codes, with the starting device first so both sides agree on it.
    fn sas_info(&self, our_key: PublicKey, their_key: PublicKey) -> String {
        let ((first, first_key), (second, second_key)) = if self.we_started {
            ((&self.own, our_key), (&self.other, their_key))
        } else {
            ((&self.other, their_key), (&self.own, our_key))
        };
        format!(
            "{SAS_INFO}|{}|{}|{}|{}|{}|{}|{}",
            first.user_id,
            first.device_id,
            first_key.to_base64(),
            second.user_id,
            second.device_id,
            second_key.to_base64(),
            self.flow_id,
        )
    }

    fn mac_info(&self, sender: &VerificationDevice, receiver: &VerificationDevice) -> String {
        format!(
            "{MAC_INFO}{}{}{}{}{}",
            sender.user_id, sender.device_id, receiver.user_id, receiver.device_id, self.flow_id
        )
    }

    /// Input of the MAC over all key ids, binding it to the short codes.
    fn key_ids_input<'a>(
        key_ids: impl Iterator<Item = &'a DeviceKeyId>,
        short_auth_string: &ShortAuthString,
    ) -> String {
        let key_ids: Vec<&str> = key_ids.map(|key_id| key_id.as_str()).collect();
        format!(
            "{}|{}",
            key_ids.join(","),
            hex::encode(short_auth_string.as_bytes())
        )
    }

    fn mac_content(
        &self,
        sas: &EstablishedSas,
        short_auth_string: &ShortAuthString,
    ) -> Result<MacContent, VerificationError> {
        let info = self.mac_info(&self.own, &self.other);
        let key_id = DeviceKeyId::ed25519(&self.own.device_id);

        let mac = BTreeMap::from([(
            key_id.clone(),
            sas.calculate_mac(
                &self.own.ed25519.to_base64(),
                &format!("{info}{key_id}"),
            )?,
        )]);
        let keys = sas.calculate_mac(
            &Self::key_ids_input(mac.keys(), short_auth_string),
            &format!("{info}KEY_IDS"),
        )?;

        Ok(MacContent {
            flow_id: self.flow_id.clone(),
            mac,
            keys,
        })
    }

    /// Checks the other device's MAC against the Ed25519 key we expect for it.
    fn verify_mac(
        &self,
        sas: &EstablishedSas,
        short_auth_string: &ShortAuthString,
        content: &MacContent,
    ) -> bool {
        let info = self.mac_info(&self.other, &self.own);
        let expected_key_id = DeviceKeyId::ed25519(&self.other.device_id);

        if content.mac.len() != 1 {
            return false;
        }
        let Some(mac) = content.mac.get(&expected_key_id) else {
            return false;
        };

        let keys_valid = sas
            .verify_mac(
                &Self::key_ids_input(content.mac.keys(), short_auth_string),
                &format!("{info}KEY_IDS"),
                &content.keys,
            )
            .is_ok();
        let key_valid = sas
            .verify_mac(
                &self.other.ed25519.to_base64(),
                &format!("{info}{expected_key_id}"),
                mac,
            )
            .is_ok();

        keys_valid && key_valid
    }
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("operation is not possible in state {0:?}")]
    UnexpectedState(VerificationState),

    #[error("unknown verification flow {0}")]
    UnknownFlow(FlowId),

    #[error(transparent)]
    Sas(#[from] crate::verification::sas::SasError),

    #[error(transparent)]
    CanonicalJson(#[from] CanonicalJsonError),

    #[error(transparent)]
    Rng(#[from] RngError),
}
