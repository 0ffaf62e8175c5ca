// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::crypto::Rng;
use crate::encoding::base64_encode;
use crate::identifiers::{DeviceId, FlowId, UserId};
use crate::verification::content::{CancelCode, StartContent, VerificationMessage};
use crate::verification::flow::{
    SasVerification, VerificationDevice, VerificationError, VerificationState,
};
use crate::verification::sas::ShortAuthString;

/// Verification message addressed to a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingVerification {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub message: VerificationMessage,
}

/// All verification flows of this device. Flows only live in memory.
pub struct VerificationMachine {
    own: VerificationDevice,
    timeout: Duration,
    flows: HashMap<FlowId, SasVerification>,
}

impl VerificationMachine {
    pub fn new(own: VerificationDevice, timeout: Duration) -> Self {
        Self {
            own,
            timeout,
            flows: HashMap::new(),
        }
    }

    fn outgoing(flow: &SasVerification, message: VerificationMessage) -> OutgoingVerification {
        let other = flow.other_device();
        OutgoingVerification {
            user_id: other.user_id.clone(),
            device_id: other.device_id.clone(),
            message,
        }
    }

    /// Runs a state transition on a flow.
    fn transition<T>(
        &mut self,
        flow_id: &FlowId,
        f: impl FnOnce(SasVerification) -> (SasVerification, T),
    ) -> Result<T, VerificationError> {
        let flow = self
            .flows
            .remove(flow_id)
            .ok_or_else(|| VerificationError::UnknownFlow(flow_id.clone()))?;
        let (flow, output) = f(flow);
        self.flows.insert(flow_id.clone(), flow);
        Ok(output)
    }

    pub fn start(
        &mut self,
        other: VerificationDevice,
        rng: &Rng,
    ) -> Result<(FlowId, OutgoingVerification), VerificationError> {
        let flow_id = FlowId::new(base64_encode(rng.random_array::<16>()?));
        let (flow, message) = SasVerification::start(
            self.own.clone(),
            other,
            flow_id.clone(),
            self.timeout,
            rng,
        )?;
        let outgoing = Self::outgoing(&flow, message);
        self.flows.insert(flow_id.clone(), flow);
        Ok((flow_id, outgoing))
    }

    /// Registers a verification started by `other`.
    pub fn receive_start(
        &mut self,
        other: VerificationDevice,
        start: StartContent,
        rng: &Rng,
    ) -> Result<Vec<OutgoingVerification>, VerificationError> {
        if self.flows.contains_key(&start.flow_id) {
            debug!(flow_id = %start.flow_id, "ignoring start of known flow");
            return Ok(Vec::new());
        }
        let flow_id = start.flow_id.clone();
        let (flow, message) =
            SasVerification::from_start(self.own.clone(), other, start, self.timeout, rng)?;
        let outgoing = message
            .map(|message| Self::outgoing(&flow, message))
            .into_iter()
            .collect();
        self.flows.insert(flow_id, flow);
        Ok(outgoing)
    }

    /// Handles any message but a start. Messages of unknown flows or from other users than the
    /// one we verify with are ignored.
    ///
    /// To-device events only name the sending user, so other devices of that user can pass
    /// messages into the flow as well. Such a device can cancel the flow. A key it sends either
    /// breaks the accept commitment or leads to short codes the verified device doesn't show.
    pub fn receive(
        &mut self,
        sender: &UserId,
        message: VerificationMessage,
    ) -> Vec<OutgoingVerification> {
        let flow_id = message.flow_id().clone();
        let Some(flow) = self.flows.get(&flow_id) else {
            debug!(%flow_id, "ignoring message of unknown flow");
            return Vec::new();
        };
        if &flow.other_device().user_id != sender {
            debug!(%flow_id, %sender, "ignoring message from unexpected sender");
            return Vec::new();
        }

        let now = Instant::now();
        self.transition(&flow_id, |flow| {
            let (flow, messages) = SasVerification::receive(flow, message, now);
            let outgoing = messages
                .into_iter()
                .map(|message| Self::outgoing(&flow, message))
                .collect();
            (flow, outgoing)
        })
        .unwrap_or_default()
    }

    /// Accepts a flow another device started. A flow which can't be accepted stays as it is.
    pub fn accept(&mut self, flow_id: &FlowId) -> Result<OutgoingVerification, VerificationError> {
        self.transition(flow_id, |flow| {
            let (flow, message) = SasVerification::accept(flow);
            let outgoing = message.map(|message| Self::outgoing(&flow, message));
            (flow, outgoing)
        })?
    }

    pub fn confirm(
        &mut self,
        flow_id: &FlowId,
    ) -> Result<Vec<OutgoingVerification>, VerificationError> {
        self.transition(flow_id, |flow| {
            let (flow, messages) = SasVerification::confirm(flow);
            let outgoing = messages.map(|messages| {
                messages
                    .into_iter()
                    .map(|message| Self::outgoing(&flow, message))
                    .collect()
            });
            (flow, outgoing)
        })?
    }

    pub fn cancel(
        &mut self,
        flow_id: &FlowId,
        code: CancelCode,
    ) -> Result<Option<OutgoingVerification>, VerificationError> {
        self.transition(flow_id, |flow| {
            let (flow, message) = SasVerification::cancel(flow, code);
            let outgoing = message.map(|message| Self::outgoing(&flow, message));
            (flow, outgoing)
        })
    }

    /// Cancels every flow which took longer than the timeout.
    pub fn cancel_timed_out(&mut self, now: Instant) -> Vec<OutgoingVerification> {
        let flow_ids: Vec<FlowId> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.is_timed_out(now))
            .map(|(flow_id, _)| flow_id.clone())
            .collect();

        let mut outgoing = Vec::new();
        for flow_id in flow_ids {
            if let Ok(Some(message)) = self.transition(&flow_id, |flow| {
                let (flow, message) = SasVerification::check_timeout(flow, now);
                let message = message.map(|message| Self::outgoing(&flow, message));
                (flow, message)
            }) {
                outgoing.push(message);
            }
        }
        outgoing
    }

    pub fn state(&self, flow_id: &FlowId) -> Option<VerificationState> {
        self.flows.get(flow_id).map(|flow| flow.state())
    }

    pub fn short_auth_string(&self, flow_id: &FlowId) -> Option<ShortAuthString> {
        self.flows
            .get(flow_id)
            .and_then(|flow| flow.short_auth_string())
    }

    pub fn other_device(&self, flow_id: &FlowId) -> Option<&VerificationDevice> {
        self.flows.get(flow_id).map(|flow| flow.other_device())
    }

    /// Forgets finished and cancelled flows.
    pub fn prune(&mut self) {
        self.flows
            .retain(|_, flow| !(flow.is_done() || flow.is_cancelled()));
    }
}
