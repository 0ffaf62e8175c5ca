// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::error::Error;

use crate::events::{HistoryVisibility, MembershipFilter, TrustLevel};
use crate::identifiers::{DeviceId, RoomId, UserId};

/// Room state and device trust, as known to the rest of the client.
pub trait RoomDirectory {
    type Error: Error + Send + Sync + 'static;

    fn room_members(
        &self,
        room_id: &RoomId,
        filter: MembershipFilter,
    ) -> impl Future<Output = Result<BTreeSet<UserId>, Self::Error>>;

    /// Encryption algorithm of the room, `None` for unencrypted rooms.
    fn encryption_algorithm(
        &self,
        room_id: &RoomId,
    ) -> impl Future<Output = Result<Option<String>, Self::Error>>;

    fn history_visibility(
        &self,
        room_id: &RoomId,
    ) -> impl Future<Output = Result<HistoryVisibility, Self::Error>>;

    fn trust_level(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> impl Future<Output = Result<TrustLevel, Self::Error>>;
}
