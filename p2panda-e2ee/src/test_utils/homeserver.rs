// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::events::ToDeviceEvent;
use crate::identifiers::{DeviceId, UserId};
use crate::keys::{DeviceKeys, OneTimeKeys};
use crate::traits::{
    ClaimKeysRequest, ClaimKeysResponse, Homeserver, ToDeviceMessages, UploadKeysRequest,
    UploadKeysResponse,
};

type DeviceKey = (UserId, DeviceId);

#[derive(Debug, Default)]
struct NetworkInner {
    device_keys: BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>,
    one_time_keys: BTreeMap<DeviceKey, OneTimeKeys>,
    fallback_keys: BTreeMap<DeviceKey, OneTimeKeys>,
    inboxes: BTreeMap<DeviceKey, Vec<ToDeviceEvent>>,
    failures: u32,
    uploads: u32,
    claims: u32,
}

/// Homeserver state shared by all devices of a test.
#[derive(Clone, Debug, Default)]
pub struct MockNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection of one device to the homeserver.
    pub fn homeserver(&self, user_id: &UserId, device_id: &DeviceId) -> MockHomeserver {
        MockHomeserver {
            network: self.clone(),
            user_id: user_id.clone(),
            device_id: device_id.clone(),
        }
    }

    /// Lets the next `count` requests fail with a transient error.
    pub async fn fail_next(&self, count: u32) {
        self.inner.write().await.failures = count;
    }

    /// Takes all to-device events waiting for a device.
    pub async fn take_to_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Vec<ToDeviceEvent> {
        self.inner
            .write()
            .await
            .inboxes
            .remove(&(user_id.clone(), device_id.clone()))
            .unwrap_or_default()
    }

    pub async fn one_time_key_count(&self, user_id: &UserId, device_id: &DeviceId) -> u64 {
        self.inner
            .read()
            .await
            .one_time_keys
            .get(&(user_id.clone(), device_id.clone()))
            .map(|keys| keys.len() as u64)
            .unwrap_or_default()
    }

    /// Removes all published one-time keys of a device, as if peers had claimed them.
    pub async fn drain_one_time_keys(&self, user_id: &UserId, device_id: &DeviceId) {
        self.inner
            .write()
            .await
            .one_time_keys
            .remove(&(user_id.clone(), device_id.clone()));
    }

    pub async fn has_fallback_key(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.inner
            .read()
            .await
            .fallback_keys
            .get(&(user_id.clone(), device_id.clone()))
            .is_some_and(|keys| !keys.is_empty())
    }

    /// Replaces the published device keys of a device.
    pub async fn set_device_keys(&self, device_keys: DeviceKeys) {
        self.inner
            .write()
            .await
            .device_keys
            .entry(device_keys.user_id.clone())
            .or_default()
            .insert(device_keys.device_id.clone(), device_keys);
    }

    /// Number of successful key uploads.
    pub async fn uploads(&self) -> u32 {
        self.inner.read().await.uploads
    }

    /// Number of successful key claims.
    pub async fn claims(&self) -> u32 {
        self.inner.read().await.claims
    }

    async fn check_failure(&self) -> Result<(), MockError> {
        let mut inner = self.inner.write().await;
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(MockError::Unavailable);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MockError {
    #[error("homeserver is unavailable")]
    Unavailable,
}

#[derive(Clone, Debug)]
pub struct MockHomeserver {
    network: MockNetwork,
    user_id: UserId,
    device_id: DeviceId,
}

impl Homeserver for MockHomeserver {
    type Error = MockError;

    async fn claim_keys(
        &self,
        request: ClaimKeysRequest,
    ) -> Result<ClaimKeysResponse, Self::Error> {
        self.network.check_failure().await?;
        let mut inner = self.network.inner.write().await;
        inner.claims += 1;

        let mut response = ClaimKeysResponse::default();
        for (user_id, devices) in request {
            for device_id in devices.into_keys() {
                let device = (user_id.clone(), device_id.clone());
                let one_time_key = inner
                    .one_time_keys
                    .get_mut(&device)
                    .and_then(|keys| keys.pop_first());
                let key = one_time_key.or_else(|| {
                    inner
                        .fallback_keys
                        .get(&device)
                        .and_then(|keys| keys.last_key_value())
                        .map(|(key_id, key)| (key_id.clone(), key.clone()))
                });
                if let Some((key_id, key)) = key {
                    response
                        .one_time_keys
                        .entry(user_id.clone())
                        .or_default()
                        .insert(device_id, OneTimeKeys::from([(key_id, key)]));
                }
            }
        }
        Ok(response)
    }

    async fn upload_keys(
        &self,
        request: UploadKeysRequest,
    ) -> Result<UploadKeysResponse, Self::Error> {
        self.network.check_failure().await?;
        let mut inner = self.network.inner.write().await;
        inner.uploads += 1;

        let device = (self.user_id.clone(), self.device_id.clone());
        if let Some(device_keys) = request.device_keys {
            inner
                .device_keys
                .entry(self.user_id.clone())
                .or_default()
                .insert(self.device_id.clone(), device_keys);
        }
        if !request.fallback_keys.is_empty() {
            inner
                .fallback_keys
                .insert(device.clone(), request.fallback_keys);
        }
        let one_time_keys = inner.one_time_keys.entry(device).or_default();
        for (key_id, key) in request.one_time_keys {
            one_time_keys.entry(key_id).or_insert(key);
        }

        Ok(UploadKeysResponse {
            one_time_key_count: one_time_keys.len() as u64,
        })
    }

    async fn device_keys(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<DeviceId, DeviceKeys>, Self::Error> {
        self.network.check_failure().await?;
        Ok(self
            .network
            .inner
            .read()
            .await
            .device_keys
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        messages: ToDeviceMessages,
    ) -> Result<(), Self::Error> {
        self.network.check_failure().await?;
        let mut inner = self.network.inner.write().await;
        for (user_id, devices) in messages {
            for (device_id, content) in devices {
                inner
                    .inboxes
                    .entry((user_id.clone(), device_id))
                    .or_default()
                    .push(ToDeviceEvent {
                        sender: self.user_id.clone(),
                        event_type: event_type.to_owned(),
                        content,
                    });
            }
        }
        Ok(())
    }
}
