// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::error::Error;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::{DeviceId, UserId};
use crate::keys::{DeviceKeys, OneTimeKeys};

/// Key algorithm to claim, by device and user.
pub type ClaimKeysRequest = BTreeMap<UserId, BTreeMap<DeviceId, String>>;

/// Event contents by recipient device and user.
pub type ToDeviceMessages = BTreeMap<UserId, BTreeMap<DeviceId, Value>>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimKeysResponse {
    /// One claimed key per device, devices without published keys are missing.
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, OneTimeKeys>>,

    /// Users whose keys could not be claimed, with the reason.
    #[serde(default)]
    pub failures: BTreeMap<UserId, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadKeysRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    #[serde(default)]
    pub one_time_keys: OneTimeKeys,
    #[serde(default)]
    pub fallback_keys: OneTimeKeys,
}

impl UploadKeysRequest {
    pub fn is_empty(&self) -> bool {
        self.device_keys.is_none() && self.one_time_keys.is_empty() && self.fallback_keys.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadKeysResponse {
    /// Number of published one-time keys after the upload.
    pub one_time_key_count: u64,
}

/// Network calls to the user's homeserver.
///
/// Implementations don't retry, failed calls are retried with backoff by the caller as long as
/// [`Homeserver::is_transient`] says so.
pub trait Homeserver {
    type Error: Error + Send + Sync + 'static;

    /// Claims one key per requested device. Claiming a device twice is safe.
    fn claim_keys(
        &self,
        request: ClaimKeysRequest,
    ) -> impl Future<Output = Result<ClaimKeysResponse, Self::Error>>;

    /// Publishes device, one-time and fallback keys. Keys which were already published are
    /// ignored.
    fn upload_keys(
        &self,
        request: UploadKeysRequest,
    ) -> impl Future<Output = Result<UploadKeysResponse, Self::Error>>;

    /// Published device keys of all devices of a user.
    fn device_keys(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<BTreeMap<DeviceId, DeviceKeys>, Self::Error>>;

    fn send_to_device(
        &self,
        event_type: &str,
        messages: ToDeviceMessages,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Whether a failed call is worth retrying.
    fn is_transient(_error: &Self::Error) -> bool {
        true
    }
}
