// SPDX-License-Identifier: MIT OR Apache-2.0

//! Orchestration of accounts, sessions and verifications of one device.
//!
//! The [`Machine`] decides when pairwise sessions need to be established and claims one-time keys
//! for them, distributes and rotates room keys, routes decrypted to-device events and keeps the
//! pool of published one-time keys filled.
//!
//! All secret state lives in the [`CryptoStore`] as pickles. Every operation loads what it needs
//! under the per-key locks of the [`SessionStore`], changes it and persists all changes in one
//! batch as its very last step. Network calls to the [`Homeserver`] are never made while holding
//! a lock on a peer or room, they are retried with backoff and can be cancelled. A cancelled
//! operation doesn't persist anything.
mod config;
mod error;
mod group;
mod one_time_keys;
mod pairwise;
#[cfg(test)]
mod tests;
mod verification;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{AccountBackend, AccountSigner, CryptoBackend, PickleKey};
use crate::crypto::Rng;
use crate::crypto::x25519::PublicKey;
use crate::events::{DecryptedToDeviceEvent, ToDeviceEvent, event_types};
use crate::identifiers::{DeviceId, DeviceKeyId, KeyId, UserId, algorithms};
use crate::keys::{DeviceKeys, IdentityKeys, OneTimeKeys, SignatureError, SignedKey, sign_object};
use crate::retry::retry_with_backoff;
use crate::store::{Changes, CryptoStore, LockKey, SessionStore, StoreError};
use crate::traits::{Homeserver, RoomDirectory, UploadKeysRequest, UploadKeysResponse};
use crate::verification::{VerificationDevice, VerificationMachine};

pub use config::{Config, EncryptionSettings};
pub use error::MachineError;
pub use one_time_keys::OneTimeKeyTracker;

/// Device of another user whose self-signed device keys were verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub keys: IdentityKeys,
}

/// End-to-end encryption engine of one device.
///
/// `B` picks the crypto backend, `S` persists its state, `H` talks to the homeserver and `R`
/// answers questions about rooms and device trust.
pub struct Machine<B, S, H, R>
where
    B: CryptoBackend,
{
    user_id: UserId,
    device_id: DeviceId,
    identity_keys: IdentityKeys,
    config: Config,
    store: SessionStore<B, S>,
    homeserver: H,
    rooms: R,
    one_time_keys: Mutex<OneTimeKeyTracker>,
    last_use: AtomicU64,
    verification: Mutex<VerificationMachine>,
}

impl<B, S, H, R> Machine<B, S, H, R>
where
    B: CryptoBackend,
    S: CryptoStore,
    H: Homeserver,
    R: RoomDirectory,
{
    /// Loads the account of this device from the store or creates a new one.
    ///
    /// A new account comes with a fallback key, call [`Machine::upload_keys`] to publish it
    /// together with the device keys.
    pub async fn new(
        user_id: UserId,
        device_id: DeviceId,
        store: S,
        homeserver: H,
        rooms: R,
        pickle_key: Option<PickleKey>,
        config: Config,
        rng: Rng,
    ) -> Result<Self, MachineError> {
        let store = SessionStore::<B, S>::new(store, pickle_key, rng);

        let identity_keys = {
            let _guard = store.lock([LockKey::Account]).await;
            match store.account().await? {
                Some(account) => account.identity_keys(),
                None => {
                    let mut account = B::Account::new(store.rng())?;
                    account.generate_fallback_key(
                        unix_time(),
                        config.fallback_key_grace,
                        store.rng(),
                    )?;
                    let mut changes = Changes::default();
                    store.account_change(&mut changes, &account)?;
                    store.save(changes).await?;
                    debug!(
                        %user_id,
                        %device_id,
                        backend = B::name(),
                        "created new account"
                    );
                    account.identity_keys()
                }
            }
        };

        let verification = VerificationMachine::new(
            VerificationDevice {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
                ed25519: identity_keys.ed25519,
            },
            config.verification_timeout,
        );

        Ok(Self {
            one_time_keys: Mutex::new(OneTimeKeyTracker::new(
                config.one_time_key_target,
                config.zero_count_grace,
            )),
            user_id,
            device_id,
            identity_keys,
            config,
            store,
            homeserver,
            rooms,
            last_use: AtomicU64::new(0),
            verification: Mutex::new(verification),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn identity_keys(&self) -> IdentityKeys {
        self.identity_keys
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &S {
        self.store.inner()
    }

    pub fn homeserver(&self) -> &H {
        &self.homeserver
    }

    /// Our device keys, signed with the device's Ed25519 key.
    pub async fn device_keys(&self) -> Result<DeviceKeys, MachineError> {
        let account = self.account().await?;
        self.sign_device_keys(&account)
    }

    fn sign_device_keys(&self, account: &B::Account) -> Result<DeviceKeys, MachineError> {
        let device_keys = DeviceKeys::new(
            self.user_id.clone(),
            self.device_id.clone(),
            self.identity_keys,
        );
        Ok(sign_object(
            &device_keys,
            &self.user_id,
            &DeviceKeyId::ed25519(&self.device_id),
            &AccountSigner(account),
        )?)
    }

    async fn account(&self) -> Result<B::Account, MachineError> {
        Ok(self
            .store
            .account()
            .await?
            .ok_or(StoreError::MissingAccount)?)
    }

    /// Publishes device keys, one-time keys and the fallback key which were not uploaded yet.
    pub async fn upload_keys(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<UploadKeysResponse>, MachineError> {
        let mut tracker = self.one_time_keys.lock().await;
        self.upload_pending_keys(&mut tracker, cancel).await
    }

    /// Handles the key counts the homeserver reports with every sync.
    ///
    /// Generates and uploads as many one-time keys as are missing to reach the target, replaces
    /// the fallback key once it was used and forgets the previous fallback key after its grace
    /// period.
    pub async fn handle_one_time_key_counts(
        &self,
        one_time_key_count: u64,
        unused_fallback_key: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<UploadKeysResponse>, MachineError> {
        let mut tracker = self.one_time_keys.lock().await;
        let now = Instant::now();
        let to_generate = tracker.keys_to_generate(one_time_key_count, now);
        let rotate_fallback_key = !unused_fallback_key && tracker.rotate_fallback_key(now);

        let rng = self.store.rng();
        let unix_now = unix_time();
        let grace = self.config.fallback_key_grace;
        self.store
            .update_account(|account| -> Result<(), MachineError> {
                if account.forget_old_fallback_key(unix_now) {
                    debug!("forgot previous fallback key");
                }
                if to_generate > 0 {
                    let count = usize::try_from(to_generate)
                        .unwrap_or(usize::MAX)
                        .min(account.max_number_of_one_time_keys());
                    account.generate_one_time_keys(count, rng)?;
                    debug!(count, one_time_key_count, "generated one-time keys");
                }
                if rotate_fallback_key {
                    account.generate_fallback_key(unix_now, grace, rng)?;
                    debug!("replaced used fallback key");
                }
                Ok(())
            })
            .await?;

        self.upload_pending_keys(&mut tracker, cancel).await
    }

    async fn upload_pending_keys(
        &self,
        tracker: &mut OneTimeKeyTracker,
        cancel: &CancellationToken,
    ) -> Result<Option<UploadKeysResponse>, MachineError> {
        let request = {
            let account = self.account().await?;
            let signer = AccountSigner(&account);
            let key_id = DeviceKeyId::ed25519(&self.device_id);
            let sign = |keys: BTreeMap<KeyId, PublicKey>, fallback: bool| {
                keys.into_iter()
                    .map(|(id, key)| {
                        let signed = sign_object(
                            &SignedKey::new(key, fallback),
                            &self.user_id,
                            &key_id,
                            &signer,
                        )?;
                        Ok((DeviceKeyId::signed_curve25519(id), signed))
                    })
                    .collect::<Result<OneTimeKeys, SignatureError>>()
            };

            UploadKeysRequest {
                device_keys: if tracker.device_keys_uploaded() {
                    None
                } else {
                    Some(self.sign_device_keys(&account)?)
                },
                one_time_keys: sign(account.one_time_keys(), false)?,
                fallback_keys: sign(account.fallback_key(), true)?,
            }
        };
        if request.is_empty() {
            return Ok(None);
        }

        let response = self
            .with_retry(cancel, || self.homeserver.upload_keys(request.clone()))
            .await?;
        self.store
            .update_account(|account| -> Result<(), MachineError> {
                account.mark_keys_as_published();
                Ok(())
            })
            .await?;
        tracker.uploaded(response.one_time_key_count, Instant::now());
        debug!(
            one_time_keys = request.one_time_keys.len(),
            fallback_keys = request.fallback_keys.len(),
            published = response.one_time_key_count,
            "uploaded keys"
        );
        Ok(Some(response))
    }

    /// Handles an event sent to this device.
    ///
    /// Encrypted events are decrypted, room keys among them get installed. Verification events
    /// are passed to the running verifications. Returns the decrypted event, `None` for events
    /// which were handled internally.
    pub async fn receive_to_device(
        &self,
        event: &ToDeviceEvent,
        cancel: &CancellationToken,
    ) -> Result<Option<DecryptedToDeviceEvent>, MachineError> {
        if event.event_type == event_types::ENCRYPTED {
            return self.decrypt_pairwise(event).await.map(Some);
        }
        if event.event_type.starts_with(event_types::KEY_VERIFICATION_PREFIX) {
            self.receive_verification_event(event, cancel).await?;
            return Ok(None);
        }
        debug!(event_type = %event.event_type, sender = %event.sender, "ignoring to-device event");
        Ok(None)
    }

    /// Verified devices of a user, without our own device.
    pub async fn devices(
        &self,
        user_id: &UserId,
        cancel: &CancellationToken,
    ) -> Result<Vec<Device>, MachineError> {
        let bundles = self
            .with_retry(cancel, || self.homeserver.device_keys(user_id))
            .await?;

        let mut devices = Vec::new();
        for (device_id, bundle) in bundles {
            if user_id == &self.user_id && device_id == self.device_id {
                continue;
            }
            if &bundle.user_id != user_id || bundle.device_id != device_id {
                warn!(%user_id, %device_id, "device keys were published for another device");
                continue;
            }
            if let Err(err) = bundle.verify_self_signature() {
                warn!(%user_id, %device_id, %err, "ignoring device with invalid device keys");
                continue;
            }
            if !bundle.supports(algorithms::OLM) {
                continue;
            }
            let Some(keys) = bundle.identity_keys() else {
                continue;
            };
            devices.push(Device {
                user_id: user_id.clone(),
                device_id,
                keys,
            });
        }
        Ok(devices)
    }

    async fn device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        cancel: &CancellationToken,
    ) -> Result<Device, MachineError> {
        self.devices(user_id, cancel)
            .await?
            .into_iter()
            .find(|device| &device.device_id == device_id)
            .ok_or_else(|| MachineError::UnknownDevice(user_id.clone(), device_id.clone()))
    }

    /// Runs a homeserver call with retries.
    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, MachineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, H::Error>>,
    {
        let rng = ChaCha20Rng::from_seed(self.store.rng().fork_seed()?);
        retry_with_backoff(&self.config.retry, rng, cancel, H::is_transient, operation)
            .await
            .map_err(MachineError::network)
    }

    /// Usage stamp of a pairwise session, higher values were used more recently.
    fn next_use(&self) -> u64 {
        let now = unix_time_millis();
        let next = |last: u64| (last + 1).max(now);
        let previous = self
            .last_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
            .unwrap_or_else(|last| last);
        next(previous)
    }
}

/// Seconds since the UNIX epoch.
pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

fn unix_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}
