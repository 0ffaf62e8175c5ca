// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the collaborators this crate depends on but doesn't implement.
mod homeserver;
mod room_directory;

pub use homeserver::{
    ClaimKeysRequest, ClaimKeysResponse, Homeserver, ToDeviceMessages, UploadKeysRequest,
    UploadKeysResponse,
};
pub use room_directory::RoomDirectory;
