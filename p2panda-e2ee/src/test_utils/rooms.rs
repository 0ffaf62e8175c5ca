// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::events::{HistoryVisibility, Membership, MembershipChange, MembershipFilter, TrustLevel};
use crate::identifiers::{DeviceId, RoomId, UserId};
use crate::traits::RoomDirectory;

#[derive(Debug, Default)]
struct Room {
    algorithm: Option<String>,
    history_visibility: HistoryVisibility,
    members: BTreeMap<UserId, Membership>,
}

#[derive(Debug, Default)]
struct RoomsInner {
    rooms: HashMap<RoomId, Room>,
    trust_levels: HashMap<(UserId, DeviceId), TrustLevel>,
}

/// Room state shared by all devices of a test.
#[derive(Clone, Debug, Default)]
pub struct MockRooms {
    inner: Arc<RwLock<RoomsInner>>,
}

impl MockRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_room(
        &self,
        room_id: &RoomId,
        algorithm: Option<&str>,
        history_visibility: HistoryVisibility,
    ) {
        self.inner.write().await.rooms.insert(
            room_id.clone(),
            Room {
                algorithm: algorithm.map(str::to_owned),
                history_visibility,
                members: BTreeMap::new(),
            },
        );
    }

    pub async fn set_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: Membership,
    ) -> MembershipChange {
        self.inner
            .write()
            .await
            .rooms
            .entry(room_id.clone())
            .or_default()
            .members
            .insert(user_id.clone(), membership);
        MembershipChange {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
            membership,
        }
    }

    pub async fn set_trust_level(&self, user_id: &UserId, device_id: &DeviceId, level: TrustLevel) {
        self.inner
            .write()
            .await
            .trust_levels
            .insert((user_id.clone(), device_id.clone()), level);
    }
}

impl RoomDirectory for MockRooms {
    type Error = Infallible;

    async fn room_members(
        &self,
        room_id: &RoomId,
        filter: MembershipFilter,
    ) -> Result<BTreeSet<UserId>, Self::Error> {
        let inner = self.inner.read().await;
        let Some(room) = inner.rooms.get(room_id) else {
            return Ok(BTreeSet::new());
        };
        Ok(room
            .members
            .iter()
            .filter(|(_, membership)| match filter {
                MembershipFilter::Joined => **membership == Membership::Join,
                MembershipFilter::JoinedAndInvited => {
                    matches!(membership, Membership::Join | Membership::Invite)
                }
            })
            .map(|(user_id, _)| user_id.clone())
            .collect())
    }

    async fn encryption_algorithm(&self, room_id: &RoomId) -> Result<Option<String>, Self::Error> {
        Ok(self
            .inner
            .read()
            .await
            .rooms
            .get(room_id)
            .and_then(|room| room.algorithm.clone()))
    }

    async fn history_visibility(&self, room_id: &RoomId) -> Result<HistoryVisibility, Self::Error> {
        Ok(self
            .inner
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|room| room.history_visibility)
            .unwrap_or_default())
    }

    async fn trust_level(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<TrustLevel, Self::Error> {
        Ok(self
            .inner
            .read()
            .await
            .trust_levels
            .get(&(user_id.clone(), device_id.clone()))
            .copied()
            .unwrap_or_default())
    }
}
