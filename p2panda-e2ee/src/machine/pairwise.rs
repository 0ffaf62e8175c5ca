// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::backend::{AccountBackend, CryptoBackend, InboundCreationResult, SessionBackend};
use crate::crypto::x25519::PublicKey;
use crate::events::{
    DecryptedToDeviceEvent, Ed25519Keys, OlmCiphertext, OlmEncryptedContent, OlmPayload,
    ToDeviceEvent, event_types,
};
use crate::identifiers::algorithms;
use crate::machine::{Device, Machine, MachineError};
use crate::message::OlmMessage;
use crate::store::{Changes, CryptoStore, LockKey, LoadedSession};
use crate::traits::{ClaimKeysRequest, Homeserver, RoomDirectory, ToDeviceMessages};

impl<B, S, H, R> Machine<B, S, H, R>
where
    B: CryptoBackend,
    S: CryptoStore,
    H: Homeserver,
    R: RoomDirectory,
{
    /// Creates pairwise sessions with all devices we don't have one with yet.
    ///
    /// One-time keys are claimed without holding any lock. Devices without claimable keys or with
    /// wrongly signed keys are skipped.
    pub(super) async fn ensure_sessions(
        &self,
        devices: &[Device],
        cancel: &CancellationToken,
    ) -> Result<(), MachineError> {
        let mut missing = Vec::new();
        for device in devices {
            if !self.store.has_sessions(&device.keys.curve25519).await? {
                missing.push(device);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let mut request = ClaimKeysRequest::new();
        for device in &missing {
            request.entry(device.user_id.clone()).or_default().insert(
                device.device_id.clone(),
                algorithms::SIGNED_CURVE25519.to_owned(),
            );
        }
        let response = self
            .with_retry(cancel, || self.homeserver.claim_keys(request.clone()))
            .await?;
        for (user_id, reason) in &response.failures {
            warn!(%user_id, %reason, "could not claim one-time keys");
        }

        let account = self.account().await?;
        for device in missing {
            let Some(one_time_key) = response
                .one_time_keys
                .get(&device.user_id)
                .and_then(|devices| devices.get(&device.device_id))
                .and_then(|keys| keys.values().next())
            else {
                warn!(
                    user_id = %device.user_id,
                    device_id = %device.device_id,
                    "no one-time key claimed for device"
                );
                continue;
            };
            if let Err(err) =
                one_time_key.verify(&device.user_id, &device.device_id, &device.keys.ed25519)
            {
                warn!(
                    user_id = %device.user_id,
                    device_id = %device.device_id,
                    %err,
                    "ignoring one-time key with invalid signature"
                );
                continue;
            }
            if cancel.is_cancelled() {
                return Err(MachineError::Cancelled);
            }

            let curve25519 = device.keys.curve25519;
            let _guard = self.store.lock([LockKey::Peer(curve25519)]).await;
            // Another task might have been faster.
            if self.store.has_sessions(&curve25519).await? {
                continue;
            }
            let session =
                account.create_outbound_session(curve25519, one_time_key.key, self.store.rng())?;
            let mut changes = Changes::default();
            self.store
                .session_change(&mut changes, curve25519, &session, self.next_use())?;
            self.store.save(changes).await?;
            debug!(
                user_id = %device.user_id,
                device_id = %device.device_id,
                session_id = %session.session_id(),
                "created outbound session"
            );
        }
        Ok(())
    }

    /// Encrypts an event for one device, establishing a pairwise session first if needed.
    pub async fn encrypt_pairwise(
        &self,
        device: &Device,
        event_type: &str,
        content: Value,
        cancel: &CancellationToken,
    ) -> Result<OlmEncryptedContent, MachineError> {
        self.ensure_sessions(std::slice::from_ref(device), cancel)
            .await?;
        let ciphertext = self
            .encrypt_for_device(device, event_type, &content, cancel)
            .await?
            .ok_or_else(|| {
                MachineError::MissingOneTimeKey(device.user_id.clone(), device.device_id.clone())
            })?;
        Ok(self.olm_content(device, ciphertext))
    }

    /// Encrypts an event for many devices. Devices we can't establish a session with are left
    /// out of the result.
    pub async fn encrypt_for_devices(
        &self,
        devices: &[Device],
        event_type: &str,
        content: &Value,
        cancel: &CancellationToken,
    ) -> Result<ToDeviceMessages, MachineError> {
        self.ensure_sessions(devices, cancel).await?;

        let mut messages = ToDeviceMessages::new();
        for device in devices {
            let Some(ciphertext) = self
                .encrypt_for_device(device, event_type, content, cancel)
                .await?
            else {
                warn!(
                    user_id = %device.user_id,
                    device_id = %device.device_id,
                    "no pairwise session with device, leaving it out"
                );
                continue;
            };
            let content = serde_json::to_value(self.olm_content(device, ciphertext))?;
            messages
                .entry(device.user_id.clone())
                .or_default()
                .insert(device.device_id.clone(), content);
        }
        Ok(messages)
    }

    fn olm_content(&self, device: &Device, ciphertext: OlmCiphertext) -> OlmEncryptedContent {
        OlmEncryptedContent {
            algorithm: algorithms::OLM.to_owned(),
            sender_key: self.identity_keys.curve25519,
            ciphertext: BTreeMap::from([(device.keys.curve25519, ciphertext)]),
        }
    }

    /// Encrypts with the most recently used session of the device. The advanced ratchet is
    /// persisted last, a cancelled call leaves the stored session as it was.
    async fn encrypt_for_device(
        &self,
        device: &Device,
        event_type: &str,
        content: &Value,
        cancel: &CancellationToken,
    ) -> Result<Option<OlmCiphertext>, MachineError> {
        let curve25519 = device.keys.curve25519;
        let _guard = self.store.lock([LockKey::Peer(curve25519)]).await;
        let Some(LoadedSession { mut session, .. }) =
            self.store.sessions(&curve25519).await?.into_iter().next()
        else {
            return Ok(None);
        };

        let payload = OlmPayload {
            event_type: event_type.to_owned(),
            content: content.clone(),
            sender: self.user_id.clone(),
            sender_device: self.device_id.clone(),
            keys: Ed25519Keys {
                ed25519: self.identity_keys.ed25519,
            },
            recipient: device.user_id.clone(),
            recipient_keys: Ed25519Keys {
                ed25519: device.keys.ed25519,
            },
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
        let message = session.encrypt(&plaintext, self.store.rng())?;

        if cancel.is_cancelled() {
            return Err(MachineError::Cancelled);
        }
        let mut changes = Changes::default();
        self.store
            .session_change(&mut changes, curve25519, &session, self.next_use())?;
        self.store.save(changes).await?;

        trace!(
            user_id = %device.user_id,
            device_id = %device.device_id,
            session_id = %session.session_id(),
            %event_type,
            "encrypted to-device event"
        );
        let (message_type, body) = message.to_parts();
        Ok(Some(OlmCiphertext { message_type, body }))
    }

    /// Decrypts a pairwise-encrypted to-device event.
    ///
    /// Room keys inside the event are installed in the same batch of changes as the advanced
    /// ratchet. Nothing is persisted when decryption or any check of the payload fails.
    pub async fn decrypt_pairwise(
        &self,
        event: &ToDeviceEvent,
    ) -> Result<DecryptedToDeviceEvent, MachineError> {
        let content: OlmEncryptedContent = serde_json::from_value(event.content.clone())?;
        if content.algorithm != algorithms::OLM {
            return Err(MachineError::UnsupportedAlgorithm(content.algorithm));
        }
        let ciphertext = content
            .ciphertext
            .get(&self.identity_keys.curve25519)
            .ok_or(MachineError::MissingCiphertext)?;
        let message = OlmMessage::from_parts(ciphertext.message_type, &ciphertext.body)?;
        let sender_key = content.sender_key;

        let mut keys = vec![LockKey::Peer(sender_key)];
        if matches!(message, OlmMessage::PreKey(_)) {
            keys.push(LockKey::Account);
        }
        let _guard = self.store.lock(keys).await;

        let mut changes = Changes::default();
        let (plaintext, session) = self
            .decrypt_with_sessions(sender_key, &message, &mut changes)
            .await?;

        let payload: OlmPayload = serde_json::from_slice(&plaintext)?;
        if payload.sender != event.sender {
            return Err(MachineError::MismatchedSender);
        }
        if payload.recipient != self.user_id
            || payload.recipient_keys.ed25519 != self.identity_keys.ed25519
        {
            return Err(MachineError::MismatchedRecipient);
        }
        let decrypted = DecryptedToDeviceEvent {
            sender: payload.sender,
            sender_device: payload.sender_device,
            sender_key,
            sender_ed25519: payload.keys.ed25519,
            event_type: payload.event_type,
            content: payload.content,
        };

        self.store
            .session_change(&mut changes, sender_key, &session, self.next_use())?;
        let _room_key_guard = if decrypted.event_type == event_types::ROOM_KEY {
            Some(self.room_key_change(&decrypted, &mut changes).await?)
        } else {
            None
        };
        self.store.save(changes).await?;

        trace!(
            sender = %decrypted.sender,
            %sender_key,
            event_type = %decrypted.event_type,
            "decrypted to-device event"
        );
        Ok(decrypted)
    }

    /// Tries all sessions with the sender, most recently used first. Pre-key messages nobody
    /// matches create a new inbound session, which consumes our one-time key.
    async fn decrypt_with_sessions(
        &self,
        sender_key: PublicKey,
        message: &OlmMessage,
        changes: &mut Changes,
    ) -> Result<(Zeroizing<Vec<u8>>, B::Session), MachineError> {
        for LoadedSession { mut session, .. } in self.store.sessions(&sender_key).await? {
            if let OlmMessage::PreKey(pre_key) = message {
                if !session.matches_pre_key_message(&sender_key, pre_key) {
                    continue;
                }
            }
            match session.decrypt(message) {
                Ok(plaintext) => return Ok((plaintext, session)),
                Err(err) => {
                    trace!(
                        %sender_key,
                        session_id = %session.session_id(),
                        %err,
                        "session can't decrypt message"
                    );
                }
            }
        }

        let OlmMessage::PreKey(pre_key) = message else {
            return Err(MachineError::NoMatchingSession(sender_key));
        };
        let mut account = self.account().await?;
        let InboundCreationResult { session, plaintext } =
            account.create_inbound_session(sender_key, pre_key)?;
        self.store.account_change(changes, &account)?;
        debug!(
            %sender_key,
            session_id = %session.session_id(),
            "created inbound session"
        );
        Ok((plaintext, session))
    }
}
