// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::backend::{
    CryptoBackend, GroupSessionBackend, InboundGroupSessionBackend, Resource,
};
use crate::crypto::sha2::sha2_256;
use crate::events::{
    DecryptedRoomEvent, DecryptedToDeviceEvent, EncryptedRoomEvent, ExportedRoomKey,
    HistoryVisibility, MegolmEncryptedContent, MembershipChange, MembershipFilter,
    RoomKeyContent, RoomPayload, TrustLevel, event_types,
};
use crate::identifiers::{RoomId, SessionId, algorithms};
use crate::machine::{Device, Machine, MachineError, unix_time};
use crate::message::MegolmMessage;
use crate::store::{
    Changes, CryptoStore, InboundGroupSessionRecord, KeyGuard, Loaded, LockKey, MessageHash,
    OutboundGroupSessionRecord,
};
use crate::traits::{Homeserver, RoomDirectory};

impl<B, S, H, R> Machine<B, S, H, R>
where
    B: CryptoBackend,
    S: CryptoStore,
    H: Homeserver,
    R: RoomDirectory,
{
    async fn ensure_encrypted(&self, room_id: &RoomId) -> Result<(), MachineError> {
        let algorithm = self
            .rooms
            .encryption_algorithm(room_id)
            .await
            .map_err(MachineError::room_directory)?
            .ok_or_else(|| MachineError::RoomNotEncrypted(room_id.clone()))?;
        if algorithm != algorithms::MEGOLM {
            return Err(MachineError::UnsupportedAlgorithm(algorithm));
        }
        Ok(())
    }

    /// Devices which should receive the room key, according to history visibility and device
    /// trust.
    async fn recipients(
        &self,
        room_id: &RoomId,
        cancel: &CancellationToken,
    ) -> Result<Vec<Device>, MachineError> {
        let visibility = self
            .rooms
            .history_visibility(room_id)
            .await
            .map_err(MachineError::room_directory)?;
        let filter = match visibility {
            HistoryVisibility::Joined => MembershipFilter::Joined,
            _ => MembershipFilter::JoinedAndInvited,
        };
        let members = self
            .rooms
            .room_members(room_id, filter)
            .await
            .map_err(MachineError::room_directory)?;

        let mut recipients = Vec::new();
        for user_id in members {
            for device in self.devices(&user_id, cancel).await? {
                let trust_level = self
                    .rooms
                    .trust_level(&device.user_id, &device.device_id)
                    .await
                    .map_err(MachineError::room_directory)?;
                let include = match trust_level {
                    TrustLevel::Verified => true,
                    TrustLevel::Undecided => !self.config.encryption.only_allow_trusted_devices,
                    TrustLevel::Blocked => false,
                };
                if include {
                    recipients.push(device);
                } else {
                    trace!(
                        user_id = %device.user_id,
                        device_id = %device.device_id,
                        ?trust_level,
                        "not sharing room key with device"
                    );
                }
            }
        }
        Ok(recipients)
    }

    fn rotation_reason(
        &self,
        session: &B::GroupSession,
        record: &OutboundGroupSessionRecord,
        recipients: &[Device],
    ) -> Option<&'static str> {
        let settings = &self.config.encryption;
        if unix_time().saturating_sub(record.created_at) >= settings.rotation_period.as_secs() {
            return Some("session expired");
        }
        if u64::from(session.message_index()) >= settings.rotation_period_messages {
            return Some("message limit reached");
        }
        let departed = record.shared_with.iter().any(|(user_id, devices)| {
            devices.iter().any(|device_id| {
                !recipients
                    .iter()
                    .any(|device| &device.user_id == user_id && &device.device_id == device_id)
            })
        });
        if departed {
            return Some("device is no longer a recipient");
        }
        None
    }

    /// Creates a new outbound group session for a room, together with our own inbound session
    /// for it.
    async fn create_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Loaded<B::GroupSession, OutboundGroupSessionRecord>, MachineError> {
        let session = B::GroupSession::new(self.store.rng())?;
        let inbound = B::InboundGroupSession::new(&session.session_key()?)?;

        let record = OutboundGroupSessionRecord {
            room_id: room_id.clone(),
            session_id: session.session_id(),
            pickle: String::new(),
            created_at: unix_time(),
            shared_with: BTreeMap::new(),
        };
        let inbound_record = InboundGroupSessionRecord {
            room_id: room_id.clone(),
            session_id: inbound.session_id(),
            sender_key: self.identity_keys.curve25519,
            sender_device: Some(self.device_id.clone()),
            signing_key: inbound.signing_key(),
            pickle: String::new(),
            first_known_index: inbound.first_known_index(),
            imported: false,
        };

        let mut changes = Changes::default();
        self.store
            .outbound_group_session_change(&mut changes, &session, record.clone())?;
        self.store
            .inbound_group_session_change(&mut changes, &inbound, inbound_record)?;
        self.store.save(changes).await?;

        debug!(%room_id, session_id = %record.session_id, "created room key");
        Ok(Loaded { session, record })
    }

    /// Makes sure the room has a current outbound group session and its key reached all
    /// recipients. Rotates the session when it is too old, was used for too many messages or a
    /// device which knows the key is no longer a recipient.
    ///
    /// The key is sent without holding the room's lock.
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        cancel: &CancellationToken,
    ) -> Result<SessionId, MachineError> {
        self.ensure_encrypted(room_id).await?;
        let recipients = self.recipients(room_id, cancel).await?;

        let (session_id, session_key, missing) = {
            let _guard = self.store.lock([LockKey::Room(room_id.clone())]).await;
            let current = match self.store.outbound_group_session(room_id).await? {
                Some(current) => {
                    match self.rotation_reason(&current.session, &current.record, &recipients) {
                        None => current,
                        Some(reason) => {
                            debug!(
                                %room_id,
                                session_id = %current.record.session_id,
                                reason,
                                "rotating room key"
                            );
                            current.session.close();
                            self.create_group_session(room_id).await?
                        }
                    }
                }
                None => self.create_group_session(room_id).await?,
            };

            let missing: Vec<Device> = recipients
                .into_iter()
                .filter(|device| {
                    !current
                        .record
                        .is_shared_with(&device.user_id, &device.device_id)
                })
                .collect();
            let session_key = if missing.is_empty() {
                None
            } else {
                Some(current.session.session_key()?)
            };
            (current.record.session_id, session_key, missing)
        };
        let Some(session_key) = session_key else {
            return Ok(session_id);
        };

        let content = serde_json::to_value(RoomKeyContent {
            algorithm: algorithms::MEGOLM.to_owned(),
            room_id: room_id.clone(),
            session_id: session_id.clone(),
            session_key,
        })?;
        let messages = self
            .encrypt_for_devices(&missing, event_types::ROOM_KEY, &content, cancel)
            .await?;
        if messages.is_empty() {
            return Ok(session_id);
        }
        self.with_retry(cancel, || {
            self.homeserver
                .send_to_device(event_types::ENCRYPTED, messages.clone())
        })
        .await?;

        let _guard = self.store.lock([LockKey::Room(room_id.clone())]).await;
        if let Some(Loaded {
            session,
            mut record,
        }) = self.store.outbound_group_session(room_id).await?
        {
            // The session might have been rotated in the meantime.
            if record.session_id == session_id {
                for (user_id, devices) in &messages {
                    record
                        .shared_with
                        .entry(user_id.clone())
                        .or_default()
                        .extend(devices.keys().cloned());
                }
                let mut changes = Changes::default();
                self.store
                    .outbound_group_session_change(&mut changes, &session, record)?;
                self.store.save(changes).await?;
            }
        }

        debug!(
            %room_id,
            %session_id,
            devices = messages.values().map(|devices| devices.len()).sum::<usize>(),
            "shared room key"
        );
        Ok(session_id)
    }

    /// Encrypts a room event, sharing or rotating the room key first where needed.
    pub async fn encrypt_group(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
        cancel: &CancellationToken,
    ) -> Result<MegolmEncryptedContent, MachineError> {
        let payload = RoomPayload {
            event_type: event_type.to_owned(),
            content,
            room_id: room_id.clone(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);

        loop {
            let session_id = self.share_room_key(room_id, cancel).await?;

            let _guard = self.store.lock([LockKey::Room(room_id.clone())]).await;
            let Some(Loaded {
                mut session,
                record,
            }) = self.store.outbound_group_session(room_id).await?
            else {
                continue;
            };
            if record.session_id != session_id {
                trace!(%room_id, "room key changed while sharing it");
                continue;
            }

            let message_index = session.message_index();
            let message = session.encrypt(&plaintext)?;
            if cancel.is_cancelled() {
                return Err(MachineError::Cancelled);
            }
            let mut changes = Changes::default();
            self.store
                .outbound_group_session_change(&mut changes, &session, record)?;
            self.store.save(changes).await?;

            trace!(%room_id, %session_id, message_index, %event_type, "encrypted room event");
            return Ok(MegolmEncryptedContent {
                algorithm: algorithms::MEGOLM.to_owned(),
                sender_key: self.identity_keys.curve25519,
                device_id: self.device_id.clone(),
                session_id,
                ciphertext: message.to_base64(),
            });
        }
    }

    /// Forgets the outbound group session of a room, the next message uses a new one. Returns
    /// `false` if there was none.
    pub async fn discard_room_key(&self, room_id: &RoomId) -> Result<bool, MachineError> {
        let _guard = self.store.lock([LockKey::Room(room_id.clone())]).await;
        let Some(current) = self.store.outbound_group_session(room_id).await? else {
            return Ok(false);
        };
        current.session.close();

        let mut changes = Changes::default();
        changes
            .discarded_outbound_group_sessions
            .push(room_id.clone());
        self.store.save(changes).await?;

        debug!(%room_id, session_id = %current.record.session_id, "discarded room key");
        Ok(true)
    }

    /// Discards the room key of an encrypted room when a member left or got banned, so they
    /// can't read what is sent afterwards.
    ///
    /// The key is kept when sharing history on leave is configured and the room's history is
    /// shared.
    pub async fn handle_membership_change(
        &self,
        change: &MembershipChange,
    ) -> Result<bool, MachineError> {
        if !change.membership.is_departure() {
            return Ok(false);
        }
        let encrypted = self
            .rooms
            .encryption_algorithm(&change.room_id)
            .await
            .map_err(MachineError::room_directory)?
            .is_some();
        if !encrypted {
            return Ok(false);
        }
        if self.config.encryption.share_history_on_leave {
            let visibility = self
                .rooms
                .history_visibility(&change.room_id)
                .await
                .map_err(MachineError::room_directory)?;
            if visibility.is_shared() {
                trace!(room_id = %change.room_id, "keeping room key, history is shared");
                return Ok(false);
            }
        }
        debug!(
            room_id = %change.room_id,
            user_id = %change.user_id,
            membership = ?change.membership,
            "member departed"
        );
        self.discard_room_key(&change.room_id).await
    }

    /// Decrypts a room event.
    ///
    /// Every decrypted message index is recorded with the hash of its plaintext. Decrypting the
    /// same message again succeeds, a different message at a known index is rejected as replay
    /// and its plaintext is never returned.
    pub async fn decrypt_group(
        &self,
        event: &EncryptedRoomEvent,
    ) -> Result<DecryptedRoomEvent, MachineError> {
        let content = &event.content;
        if content.algorithm != algorithms::MEGOLM {
            return Err(MachineError::UnsupportedAlgorithm(content.algorithm.clone()));
        }
        let message = MegolmMessage::from_base64(&content.ciphertext)?;
        let room_id = &event.room_id;
        let session_id = &content.session_id;

        let _guard = self
            .store
            .lock([LockKey::InboundGroup(room_id.clone(), session_id.clone())])
            .await;
        let Loaded {
            mut session,
            record,
        } = self
            .store
            .inbound_group_session(room_id, session_id)
            .await?
            .ok_or_else(|| MachineError::MissingRoomKey {
                room_id: room_id.clone(),
                session_id: session_id.clone(),
            })?;
        if record.sender_key != content.sender_key {
            return Err(MachineError::MismatchedSender);
        }

        let decrypted = session.decrypt(&message)?;
        let message_index = decrypted.message_index;
        let hash = sha2_256(&[&decrypted.plaintext[..]]);
        if let Some(known) = self
            .store
            .message_hash(room_id, session_id, message_index)
            .await?
        {
            if known != hash {
                warn!(%room_id, %session_id, message_index, "replayed message index");
                return Err(MachineError::ReplayDetected {
                    room_id: room_id.clone(),
                    session_id: session_id.clone(),
                    message_index,
                });
            }
        }

        let payload: RoomPayload = serde_json::from_slice(&decrypted.plaintext)?;
        if &payload.room_id != room_id {
            return Err(MachineError::MismatchedRoom);
        }
        let verified = session.is_verified() && !record.imported;

        let mut changes = Changes::default();
        changes.message_hashes.push(MessageHash {
            room_id: room_id.clone(),
            session_id: session_id.clone(),
            message_index,
            hash,
        });
        self.store
            .inbound_group_session_change(&mut changes, &session, record)?;
        self.store.save(changes).await?;

        trace!(%room_id, %session_id, message_index, "decrypted room event");
        Ok(DecryptedRoomEvent {
            sender: event.sender.clone(),
            sender_key: content.sender_key,
            sender_device: content.device_id.clone(),
            room_id: room_id.clone(),
            session_id: session_id.clone(),
            message_index,
            event_type: payload.event_type,
            content: payload.content,
            verified,
        })
    }

    /// Installs the room key of a decrypted `m.room_key` event.
    pub async fn handle_incoming_room_key(
        &self,
        event: &DecryptedToDeviceEvent,
    ) -> Result<(), MachineError> {
        let mut changes = Changes::default();
        let _guard = self.room_key_change(event, &mut changes).await?;
        self.store.save(changes).await?;
        Ok(())
    }

    /// Adds the inbound group session of a room key to `changes`, unless we already know the
    /// session from an earlier index. The returned guard has to be held until the changes are
    /// saved.
    pub(super) async fn room_key_change(
        &self,
        event: &DecryptedToDeviceEvent,
        changes: &mut Changes,
    ) -> Result<KeyGuard, MachineError> {
        let content: RoomKeyContent = serde_json::from_value(event.content.clone())?;
        if content.algorithm != algorithms::MEGOLM {
            return Err(MachineError::UnsupportedAlgorithm(content.algorithm));
        }
        let session = B::InboundGroupSession::new(&content.session_key)?;
        if session.session_id() != content.session_id {
            return Err(MachineError::MismatchedSessionId(content.session_id));
        }

        let guard = self
            .store
            .lock([LockKey::InboundGroup(
                content.room_id.clone(),
                content.session_id.clone(),
            )])
            .await;
        if let Some(existing) = self
            .store
            .inbound_group_session(&content.room_id, &content.session_id)
            .await?
        {
            let known_index = existing.session.first_known_index();
            let better_or_equal = known_index < session.first_known_index()
                || (known_index == session.first_known_index() && !existing.record.imported);
            if better_or_equal {
                trace!(
                    room_id = %content.room_id,
                    session_id = %content.session_id,
                    "room key is already known"
                );
                return Ok(guard);
            }
        }

        let record = InboundGroupSessionRecord {
            room_id: content.room_id.clone(),
            session_id: content.session_id.clone(),
            sender_key: event.sender_key,
            sender_device: Some(event.sender_device.clone()),
            signing_key: session.signing_key(),
            pickle: String::new(),
            first_known_index: session.first_known_index(),
            imported: false,
        };
        self.store
            .inbound_group_session_change(changes, &session, record)?;
        debug!(
            room_id = %content.room_id,
            session_id = %content.session_id,
            sender = %event.sender,
            first_known_index = session.first_known_index(),
            "received room key"
        );
        Ok(guard)
    }

    /// Exports all inbound group sessions from their first known index, for key backups.
    pub async fn export_room_keys(&self) -> Result<Vec<ExportedRoomKey>, MachineError> {
        self.store
            .inbound_group_sessions()
            .await?
            .into_iter()
            .map(|Loaded { session, record }| {
                Ok(ExportedRoomKey {
                    algorithm: algorithms::MEGOLM.to_owned(),
                    room_id: record.room_id,
                    sender_key: record.sender_key,
                    session_id: record.session_id,
                    session_key: session.export_at_first_known_index()?,
                })
            })
            .collect()
    }

    /// Imports exported room keys. Keys we already know from the same or an earlier index are
    /// skipped, as are invalid keys. Returns the number of imported keys.
    pub async fn import_room_keys(&self, keys: &[ExportedRoomKey]) -> Result<usize, MachineError> {
        let mut imported = 0;
        for key in keys {
            if key.algorithm != algorithms::MEGOLM {
                warn!(algorithm = %key.algorithm, "skipping room key of unknown algorithm");
                continue;
            }
            let session = match B::InboundGroupSession::import(&key.session_key) {
                Ok(session) => session,
                Err(err) => {
                    warn!(session_id = %key.session_id, %err, "skipping invalid room key");
                    continue;
                }
            };
            if session.session_id() != key.session_id {
                warn!(session_id = %key.session_id, "skipping room key of another session");
                continue;
            }

            let _guard = self
                .store
                .lock([LockKey::InboundGroup(
                    key.room_id.clone(),
                    key.session_id.clone(),
                )])
                .await;
            if let Some(existing) = self
                .store
                .inbound_group_session(&key.room_id, &key.session_id)
                .await?
            {
                if existing.session.first_known_index() <= session.first_known_index() {
                    continue;
                }
            }

            let record = InboundGroupSessionRecord {
                room_id: key.room_id.clone(),
                session_id: key.session_id.clone(),
                sender_key: key.sender_key,
                sender_device: None,
                signing_key: session.signing_key(),
                pickle: String::new(),
                first_known_index: session.first_known_index(),
                imported: true,
            };
            let mut changes = Changes::default();
            self.store
                .inbound_group_session_change(&mut changes, &session, record)?;
            self.store.save(changes).await?;
            imported += 1;
        }
        debug!(imported, total = keys.len(), "imported room keys");
        Ok(imported)
    }
}
