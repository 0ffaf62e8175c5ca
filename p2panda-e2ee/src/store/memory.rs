// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::crypto::x25519::PublicKey;
use crate::identifiers::{RoomId, SessionId};
use crate::store::{
    Changes, CryptoStore, InboundGroupSessionRecord, OutboundGroupSessionRecord, SessionRecord,
};

#[derive(Debug, Default)]
struct MemoryStoreInner {
    account: Option<String>,
    sessions: HashMap<PublicKey, HashMap<SessionId, SessionRecord>>,
    outbound_group_sessions: HashMap<RoomId, OutboundGroupSessionRecord>,
    inbound_group_sessions: HashMap<(RoomId, SessionId), InboundGroupSessionRecord>,
    message_hashes: HashMap<(RoomId, SessionId, u32), [u8; 32]>,
}

/// Store keeping everything in memory, for tests and short-lived clients.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptoStore for MemoryStore {
    type Error = Infallible;

    async fn account(&self) -> Result<Option<String>, Self::Error> {
        Ok(self.inner.read().await.account.clone())
    }

    async fn sessions(&self, sender_key: &PublicKey) -> Result<Vec<SessionRecord>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .get(sender_key)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>, Self::Error> {
        Ok(self
            .inner
            .read()
            .await
            .outbound_group_sessions
            .get(room_id)
            .cloned())
    }

    async fn inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
    ) -> Result<Option<InboundGroupSessionRecord>, Self::Error> {
        Ok(self
            .inner
            .read()
            .await
            .inbound_group_sessions
            .get(&(room_id.clone(), session_id.clone()))
            .cloned())
    }

    async fn inbound_group_sessions(&self) -> Result<Vec<InboundGroupSessionRecord>, Self::Error> {
        Ok(self
            .inner
            .read()
            .await
            .inbound_group_sessions
            .values()
            .cloned()
            .collect())
    }

    async fn message_hash(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
        message_index: u32,
    ) -> Result<Option<[u8; 32]>, Self::Error> {
        Ok(self
            .inner
            .read()
            .await
            .message_hashes
            .get(&(room_id.clone(), session_id.clone(), message_index))
            .copied())
    }

    async fn save_changes(&self, changes: Changes) -> Result<(), Self::Error> {
        // One write lock for the whole batch.
        let mut inner = self.inner.write().await;

        if let Some(account) = changes.account {
            inner.account = Some(account);
        }

        for session in changes.sessions {
            inner
                .sessions
                .entry(session.sender_key)
                .or_default()
                .insert(session.session_id.clone(), session);
        }

        for room_id in changes.discarded_outbound_group_sessions {
            inner.outbound_group_sessions.remove(&room_id);
        }

        for session in changes.outbound_group_sessions {
            inner
                .outbound_group_sessions
                .insert(session.room_id.clone(), session);
        }

        for session in changes.inbound_group_sessions {
            inner.inbound_group_sessions.insert(
                (session.room_id.clone(), session.session_id.clone()),
                session,
            );
        }

        for entry in changes.message_hashes {
            inner.message_hashes.insert(
                (entry.room_id, entry.session_id, entry.message_index),
                entry.hash,
            );
        }

        Ok(())
    }
}
