// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::CryptoBackend;
use crate::events::ToDeviceEvent;
use crate::identifiers::{DeviceId, FlowId, UserId};
use crate::machine::{Device, Machine, MachineError};
use crate::store::CryptoStore;
use crate::traits::{Homeserver, RoomDirectory, ToDeviceMessages};
use crate::verification::{
    CancelCode, OutgoingVerification, ShortAuthString, VerificationDevice, VerificationMessage,
    VerificationState,
};

impl From<&Device> for VerificationDevice {
    fn from(device: &Device) -> Self {
        VerificationDevice {
            user_id: device.user_id.clone(),
            device_id: device.device_id.clone(),
            ed25519: device.keys.ed25519,
        }
    }
}

impl<B, S, H, R> Machine<B, S, H, R>
where
    B: CryptoBackend,
    S: CryptoStore,
    H: Homeserver,
    R: RoomDirectory,
{
    /// Starts verifying another device, which has to accept before keys are exchanged.
    pub async fn start_verification(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        cancel: &CancellationToken,
    ) -> Result<FlowId, MachineError> {
        let device = self.device(user_id, device_id, cancel).await?;
        let (flow_id, outgoing) = self
            .verification
            .lock()
            .await
            .start(VerificationDevice::from(&device), self.store.rng())?;
        debug!(%user_id, %device_id, %flow_id, "started verification");
        self.send_verification(vec![outgoing], cancel).await?;
        Ok(flow_id)
    }

    pub(super) async fn receive_verification_event(
        &self,
        event: &ToDeviceEvent,
        cancel: &CancellationToken,
    ) -> Result<(), MachineError> {
        let Some(message) =
            VerificationMessage::from_event(&event.event_type, event.content.clone())
        else {
            debug!(event_type = %event.event_type, "ignoring unknown verification event");
            return Ok(());
        };

        let outgoing = match message? {
            VerificationMessage::Start(start) => {
                let device = match self.device(&event.sender, &start.from_device, cancel).await {
                    Ok(device) => device,
                    Err(MachineError::UnknownDevice(user_id, device_id)) => {
                        warn!(%user_id, %device_id, "verification request from unknown device");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                };
                self.verification.lock().await.receive_start(
                    VerificationDevice::from(&device),
                    start,
                    self.store.rng(),
                )?
            }
            message => self.verification.lock().await.receive(&event.sender, message),
        };
        self.send_verification(outgoing, cancel).await
    }

    /// Accepts a verification another device started.
    pub async fn accept_verification(
        &self,
        flow_id: &FlowId,
        cancel: &CancellationToken,
    ) -> Result<(), MachineError> {
        let outgoing = self.verification.lock().await.accept(flow_id)?;
        self.send_verification(vec![outgoing], cancel).await
    }

    /// Our user confirmed that both devices show the same short codes.
    pub async fn confirm_verification(
        &self,
        flow_id: &FlowId,
        cancel: &CancellationToken,
    ) -> Result<(), MachineError> {
        let outgoing = self.verification.lock().await.confirm(flow_id)?;
        self.send_verification(outgoing, cancel).await
    }

    /// Our user saw different short codes on both devices.
    pub async fn mismatch_verification(
        &self,
        flow_id: &FlowId,
        cancel: &CancellationToken,
    ) -> Result<(), MachineError> {
        self.cancel_verification_with(flow_id, CancelCode::MismatchedSas, cancel)
            .await
    }

    pub async fn cancel_verification(
        &self,
        flow_id: &FlowId,
        cancel: &CancellationToken,
    ) -> Result<(), MachineError> {
        self.cancel_verification_with(flow_id, CancelCode::User, cancel)
            .await
    }

    async fn cancel_verification_with(
        &self,
        flow_id: &FlowId,
        code: CancelCode,
        cancel: &CancellationToken,
    ) -> Result<(), MachineError> {
        let outgoing = self.verification.lock().await.cancel(flow_id, code)?;
        self.send_verification(outgoing.into_iter().collect(), cancel)
            .await
    }

    /// Cancels all verifications which didn't finish in time.
    pub async fn check_verification_timeouts(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), MachineError> {
        let outgoing = {
            let mut verification = self.verification.lock().await;
            let outgoing = verification.cancel_timed_out(Instant::now());
            verification.prune();
            outgoing
        };
        self.send_verification(outgoing, cancel).await
    }

    pub async fn verification_state(&self, flow_id: &FlowId) -> Option<VerificationState> {
        self.verification.lock().await.state(flow_id)
    }

    pub async fn short_auth_string(&self, flow_id: &FlowId) -> Option<ShortAuthString> {
        self.verification.lock().await.short_auth_string(flow_id)
    }

    /// The other device of a successfully finished verification.
    pub async fn verified_device(&self, flow_id: &FlowId) -> Option<VerificationDevice> {
        let verification = self.verification.lock().await;
        if verification.state(flow_id) != Some(VerificationState::Done) {
            return None;
        }
        verification.other_device(flow_id).cloned()
    }

    async fn send_verification(
        &self,
        outgoing: Vec<OutgoingVerification>,
        cancel: &CancellationToken,
    ) -> Result<(), MachineError> {
        for outgoing in outgoing {
            let content = outgoing.message.to_content()?;
            let messages = ToDeviceMessages::from([(
                outgoing.user_id,
                BTreeMap::from([(outgoing.device_id, content)]),
            )]);
            self.with_retry(cancel, || {
                self.homeserver
                    .send_to_device(outgoing.message.event_type(), messages.clone())
            })
            .await?;
        }
        Ok(())
    }
}
