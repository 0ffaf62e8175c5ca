// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;
use std::marker::PhantomData;

use thiserror::Error;
use tracing::trace;

use crate::backend::{
    CryptoBackend, GroupSessionBackend, InboundGroupSessionBackend, PickleError,
    PickleKey, Resource, SessionBackend,
};
use crate::crypto::Rng;
use crate::crypto::x25519::PublicKey;
use crate::identifiers::{RoomId, SessionId};
use crate::store::{
    Changes, CryptoStore, InboundGroupSessionRecord, KeyGuard, KeyLocks,
    OutboundGroupSessionRecord, SessionRecord,
};

/// What a lock protects.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Account,
    /// Pairwise sessions with one device, by its Curve25519 identity key.
    Peer(PublicKey),
    /// Outbound group session of a room.
    Room(RoomId),
    InboundGroup(RoomId, SessionId),
}

/// A pairwise session loaded from the store.
pub struct LoadedSession<S> {
    pub session: S,
    pub last_use: u64,
}

/// A group session loaded from the store, with its record.
pub struct Loaded<R, M> {
    pub session: R,
    pub record: M,
}

/// Typed access to pickled state, serialized per [`LockKey`].
///
/// Reads don't lock. Callers which modify state hold the locks of everything they touch from
/// loading until [`SessionStore::save`] returned, which makes every read-modify-write atomic per
/// key.
pub struct SessionStore<B, S> {
    store: S,
    locks: KeyLocks<LockKey>,
    pickle_key: Option<PickleKey>,
    rng: Rng,
    _backend: PhantomData<B>,
}

impl<B, S> SessionStore<B, S>
where
    B: CryptoBackend,
    S: CryptoStore,
{
    pub fn new(store: S, pickle_key: Option<PickleKey>, rng: Rng) -> Self {
        Self {
            store,
            locks: KeyLocks::new(),
            pickle_key,
            rng,
            _backend: PhantomData,
        }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Randomness shared by everything working with this store.
    pub fn rng(&self) -> &Rng {
        &self.rng
    }

    pub async fn lock(&self, keys: impl IntoIterator<Item = LockKey>) -> KeyGuard {
        self.locks.lock_all(keys).await
    }

    pub fn pickle<R: Resource>(&self, resource: &R) -> Result<String, StoreError> {
        Ok(resource.pickle(self.pickle_key.as_ref(), &self.rng)?)
    }

    fn unpickle<R: Resource>(&self, pickle: &str) -> Result<R, StoreError> {
        Ok(R::from_pickle(pickle, self.pickle_key.as_ref())?)
    }

    pub async fn account(&self) -> Result<Option<B::Account>, StoreError> {
        let pickle = self.store.account().await.map_err(StoreError::backend)?;
        pickle.map(|pickle| self.unpickle(&pickle)).transpose()
    }

    /// Pairwise sessions with a device, most recently used first.
    pub async fn sessions(
        &self,
        sender_key: &PublicKey,
    ) -> Result<Vec<LoadedSession<B::Session>>, StoreError> {
        let mut records = self
            .store
            .sessions(sender_key)
            .await
            .map_err(StoreError::backend)?;
        records.sort_by(|a, b| b.last_use.cmp(&a.last_use));
        records
            .into_iter()
            .map(|record| {
                Ok(LoadedSession {
                    session: self.unpickle(&record.pickle)?,
                    last_use: record.last_use,
                })
            })
            .collect()
    }

    pub async fn has_sessions(&self, sender_key: &PublicKey) -> Result<bool, StoreError> {
        Ok(!self
            .store
            .sessions(sender_key)
            .await
            .map_err(StoreError::backend)?
            .is_empty())
    }

    pub async fn outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<Loaded<B::GroupSession, OutboundGroupSessionRecord>>, StoreError> {
        let record = self
            .store
            .outbound_group_session(room_id)
            .await
            .map_err(StoreError::backend)?;
        record
            .map(|record| {
                Ok(Loaded {
                    session: self.unpickle(&record.pickle)?,
                    record,
                })
            })
            .transpose()
    }

    pub async fn inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
    ) -> Result<Option<Loaded<B::InboundGroupSession, InboundGroupSessionRecord>>, StoreError>
    {
        let record = self
            .store
            .inbound_group_session(room_id, session_id)
            .await
            .map_err(StoreError::backend)?;
        record
            .map(|record| {
                Ok(Loaded {
                    session: self.unpickle(&record.pickle)?,
                    record,
                })
            })
            .transpose()
    }

    pub async fn inbound_group_sessions(
        &self,
    ) -> Result<Vec<Loaded<B::InboundGroupSession, InboundGroupSessionRecord>>, StoreError> {
        let records = self
            .store
            .inbound_group_sessions()
            .await
            .map_err(StoreError::backend)?;
        records
            .into_iter()
            .map(|record| {
                Ok(Loaded {
                    session: self.unpickle(&record.pickle)?,
                    record,
                })
            })
            .collect()
    }

    pub async fn message_hash(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
        message_index: u32,
    ) -> Result<Option<[u8; 32]>, StoreError> {
        self.store
            .message_hash(room_id, session_id, message_index)
            .await
            .map_err(StoreError::backend)
    }

    pub fn account_change(
        &self,
        changes: &mut Changes,
        account: &B::Account,
    ) -> Result<(), StoreError> {
        changes.account = Some(self.pickle(account)?);
        Ok(())
    }

    pub fn session_change(
        &self,
        changes: &mut Changes,
        sender_key: PublicKey,
        session: &B::Session,
        last_use: u64,
    ) -> Result<(), StoreError> {
        changes.sessions.push(SessionRecord {
            sender_key,
            session_id: session.session_id(),
            pickle: self.pickle(session)?,
            last_use,
        });
        Ok(())
    }

    pub fn outbound_group_session_change(
        &self,
        changes: &mut Changes,
        session: &B::GroupSession,
        mut record: OutboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        record.session_id = session.session_id();
        record.pickle = self.pickle(session)?;
        changes.outbound_group_sessions.push(record);
        Ok(())
    }

    pub fn inbound_group_session_change(
        &self,
        changes: &mut Changes,
        session: &B::InboundGroupSession,
        mut record: InboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        record.session_id = session.session_id();
        record.first_known_index = session.first_known_index();
        record.signing_key = session.signing_key();
        record.pickle = self.pickle(session)?;
        changes.inbound_group_sessions.push(record);
        Ok(())
    }

    /// Persists all changes at once.
    pub async fn save(&self, changes: Changes) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        trace!(
            sessions = changes.sessions.len(),
            inbound_group_sessions = changes.inbound_group_sessions.len(),
            "saving changes"
        );
        self.store
            .save_changes(changes)
            .await
            .map_err(StoreError::backend)
    }

    /// Loads the account, applies `update` and persists the result, all under the account lock.
    /// Nothing is persisted when `update` fails.
    pub async fn update_account<T, E>(
        &self,
        update: impl FnOnce(&mut B::Account) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let _guard = self.lock([LockKey::Account]).await;
        let mut account = self.account().await?.ok_or(StoreError::MissingAccount)?;
        let result = update(&mut account)?;

        let mut changes = Changes::default();
        self.account_change(&mut changes, &account)?;
        self.save(changes).await?;
        Ok(result)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store failed: {0}")]
    Backend(Box<dyn Error + Send + Sync>),

    #[error(transparent)]
    Pickle(#[from] PickleError),

    #[error("no account was created yet")]
    MissingAccount,
}

impl StoreError {
    fn backend(error: impl Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(error))
    }
}
