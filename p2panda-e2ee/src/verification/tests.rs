// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use tokio::time::Instant;

use crate::crypto::Rng;
use crate::crypto::ed25519::SigningKey;
use crate::crypto::x25519::PublicKey;
use crate::identifiers::{DeviceId, UserId};
use crate::verification::{
    CancelCode, KeyContent, OutgoingVerification, SasVerification, VerificationDevice,
    VerificationError, VerificationMachine, VerificationMessage, VerificationState,
};

const TIMEOUT: Duration = Duration::from_secs(600);

fn device(user_id: &str, device_id: &str, rng: &Rng) -> VerificationDevice {
    VerificationDevice {
        user_id: UserId::new(user_id),
        device_id: DeviceId::new(device_id),
        ed25519: SigningKey::from_rng(rng).unwrap().verifying_key(),
    }
}

/// Delivers messages to a machine, starts are registered with the sending device's identity.
fn deliver(
    machine: &mut VerificationMachine,
    sender: &VerificationDevice,
    outgoing: Vec<OutgoingVerification>,
    rng: &Rng,
) -> Vec<OutgoingVerification> {
    let mut replies = Vec::new();
    for outgoing in outgoing {
        match outgoing.message {
            VerificationMessage::Start(start) => {
                replies.extend(machine.receive_start(sender.clone(), start, rng).unwrap());
            }
            message => replies.extend(machine.receive(&sender.user_id, message)),
        }
    }
    replies
}

struct Pair {
    rng: Rng,
    alice: VerificationDevice,
    bob: VerificationDevice,
    alice_machine: VerificationMachine,
    bob_machine: VerificationMachine,
}

impl Pair {
    fn new() -> Self {
        let rng = Rng::from_seed([1; 32]);
        let alice = device("@alice:example.org", "ALICEPHONE", &rng);
        let bob = device("@bob:example.org", "BOBLAPTOP", &rng);
        Self {
            alice_machine: VerificationMachine::new(alice.clone(), TIMEOUT),
            bob_machine: VerificationMachine::new(bob.clone(), TIMEOUT),
            rng,
            alice,
            bob,
        }
    }

    /// Runs the flow until both sides show their codes.
    fn exchange_keys(&mut self) -> crate::identifiers::FlowId {
        let (flow_id, start) = self.alice_machine.start(self.bob.clone(), &self.rng).unwrap();
        assert_eq!(start.user_id, self.bob.user_id);

        let replies = deliver(&mut self.bob_machine, &self.alice, vec![start], &self.rng);
        assert!(replies.is_empty());
        assert_eq!(
            self.bob_machine.state(&flow_id),
            Some(VerificationState::Requested)
        );

        let accept = self.bob_machine.accept(&flow_id).unwrap();
        let key = deliver(&mut self.alice_machine, &self.bob, vec![accept], &self.rng);
        let key = deliver(&mut self.bob_machine, &self.alice, key, &self.rng);
        let replies = deliver(&mut self.alice_machine, &self.bob, key, &self.rng);
        assert!(replies.is_empty());

        assert_eq!(
            self.alice_machine.state(&flow_id),
            Some(VerificationState::KeysExchanged)
        );
        assert_eq!(
            self.bob_machine.state(&flow_id),
            Some(VerificationState::KeysExchanged)
        );
        flow_id
    }
}

#[test]
fn successful_verification() {
    let mut pair = Pair::new();
    let flow_id = pair.exchange_keys();

    let alice_sas = pair.alice_machine.short_auth_string(&flow_id).unwrap();
    let bob_sas = pair.bob_machine.short_auth_string(&flow_id).unwrap();
    assert_eq!(alice_sas, bob_sas);
    assert_eq!(alice_sas.emoji(), bob_sas.emoji());

    // Bob confirms first, Alice receives the MAC before the user confirmed on that side.
    let bob_mac = pair.bob_machine.confirm(&flow_id).unwrap();
    assert_eq!(
        pair.bob_machine.state(&flow_id),
        Some(VerificationState::Confirmed)
    );
    let replies = deliver(&mut pair.alice_machine, &pair.bob, bob_mac, &pair.rng);
    assert!(replies.is_empty());
    assert_eq!(
        pair.alice_machine.state(&flow_id),
        Some(VerificationState::MacReceived)
    );

    let alice_messages = pair.alice_machine.confirm(&flow_id).unwrap();
    assert_eq!(alice_messages.len(), 2);
    assert_eq!(
        pair.alice_machine.state(&flow_id),
        Some(VerificationState::Done)
    );

    let replies = deliver(&mut pair.bob_machine, &pair.alice, alice_messages, &pair.rng);
    assert!(matches!(
        replies.as_slice(),
        [OutgoingVerification {
            message: VerificationMessage::Done(_),
            ..
        }]
    ));
    assert_eq!(
        pair.bob_machine.state(&flow_id),
        Some(VerificationState::Done)
    );

    // Late done messages don't change anything.
    assert!(deliver(&mut pair.alice_machine, &pair.bob, replies, &pair.rng).is_empty());
    assert_eq!(
        pair.alice_machine.state(&flow_id),
        Some(VerificationState::Done)
    );

    pair.alice_machine.prune();
    assert!(pair.alice_machine.state(&flow_id).is_none());
}

#[test]
fn mac_for_wrong_key_cancels() {
    let mut pair = Pair::new();

    // Alice expects another key for Bob's device than the one Bob has.
    let mut impostor = pair.bob.clone();
    impostor.ed25519 = SigningKey::from_rng(&pair.rng).unwrap().verifying_key();
    pair.bob_machine = VerificationMachine::new(impostor, TIMEOUT);
    let flow_id = pair.exchange_keys();

    let bob_messages = pair.bob_machine.confirm(&flow_id).unwrap();
    let replies = deliver(&mut pair.alice_machine, &pair.bob, bob_messages, &pair.rng);
    assert!(matches!(
        replies.as_slice(),
        [OutgoingVerification {
            message: VerificationMessage::Cancel(_),
            ..
        }]
    ));
    assert_eq!(
        pair.alice_machine.state(&flow_id),
        Some(VerificationState::Cancelled {
            code: CancelCode::KeyMismatch,
            by_us: true
        })
    );

    // Alice never reports success, even when the user confirms afterwards.
    assert!(pair.alice_machine.confirm(&flow_id).is_err());

    deliver(&mut pair.bob_machine, &pair.alice, replies, &pair.rng);
    assert_eq!(
        pair.bob_machine.state(&flow_id),
        Some(VerificationState::Cancelled {
            code: CancelCode::KeyMismatch,
            by_us: false
        })
    );
}

#[test]
fn swapped_key_breaks_commitment() {
    let mut pair = Pair::new();
    let (flow_id, start) = pair.alice_machine.start(pair.bob.clone(), &pair.rng).unwrap();
    deliver(&mut pair.bob_machine, &pair.alice, vec![start], &pair.rng);
    let accept = pair.bob_machine.accept(&flow_id).unwrap();
    deliver(&mut pair.alice_machine, &pair.bob, vec![accept], &pair.rng);

    // A key Bob didn't commit to.
    let forged = OutgoingVerification {
        user_id: pair.alice.user_id.clone(),
        device_id: pair.alice.device_id.clone(),
        message: VerificationMessage::Key(KeyContent {
            flow_id: flow_id.clone(),
            key: crate::crypto::x25519::SecretKey::from_rng(&pair.rng)
                .unwrap()
                .public_key(),
        }),
    };
    let replies = deliver(&mut pair.alice_machine, &pair.bob, vec![forged], &pair.rng);
    assert_eq!(replies.len(), 1);
    assert_eq!(
        pair.alice_machine.state(&flow_id),
        Some(VerificationState::Cancelled {
            code: CancelCode::MismatchedCommitment,
            by_us: true
        })
    );
    assert!(pair.alice_machine.short_auth_string(&flow_id).is_none());
}

#[test]
fn non_contributory_key_cancels() {
    let mut pair = Pair::new();
    let (flow_id, start) = pair.alice_machine.start(pair.bob.clone(), &pair.rng).unwrap();
    deliver(&mut pair.bob_machine, &pair.alice, vec![start], &pair.rng);
    pair.bob_machine.accept(&flow_id).unwrap();

    let weak = OutgoingVerification {
        user_id: pair.bob.user_id.clone(),
        device_id: pair.bob.device_id.clone(),
        message: VerificationMessage::Key(KeyContent {
            flow_id: flow_id.clone(),
            key: PublicKey::from_bytes([0; 32]),
        }),
    };
    deliver(&mut pair.bob_machine, &pair.alice, vec![weak], &pair.rng);
    assert_eq!(
        pair.bob_machine.state(&flow_id),
        Some(VerificationState::Cancelled {
            code: CancelCode::InvalidMessage,
            by_us: true
        })
    );
    assert!(pair.bob_machine.short_auth_string(&flow_id).is_none());
}

#[test]
fn unexpected_messages_and_user_cancellation() {
    let mut pair = Pair::new();
    let (flow_id, start) = pair.alice_machine.start(pair.bob.clone(), &pair.rng).unwrap();
    deliver(&mut pair.bob_machine, &pair.alice, vec![start], &pair.rng);

    // Bob can't confirm before keys were exchanged.
    assert!(pair.bob_machine.confirm(&flow_id).is_err());
    assert_eq!(
        pair.bob_machine.state(&flow_id),
        Some(VerificationState::Requested)
    );

    // Messages from other users are ignored.
    let cancel = VerificationMessage::cancel(flow_id.clone(), CancelCode::User);
    assert!(
        pair.bob_machine
            .receive(&UserId::new("@mallory:example.org"), cancel)
            .is_empty()
    );

    // A key before the accept is out of order.
    let key = VerificationMessage::Key(KeyContent {
        flow_id: flow_id.clone(),
        key: PublicKey::from_bytes([9; 32]),
    });
    let replies = pair.bob_machine.receive(&pair.alice.user_id, key);
    assert_eq!(replies.len(), 1);
    assert_eq!(
        pair.bob_machine.state(&flow_id),
        Some(VerificationState::Cancelled {
            code: CancelCode::UnexpectedMessage,
            by_us: true
        })
    );

    let cancel = pair
        .alice_machine
        .cancel(&flow_id, CancelCode::User)
        .unwrap()
        .unwrap();
    assert_eq!(cancel.user_id, pair.bob.user_id);
    assert!(
        pair.alice_machine
            .cancel(&flow_id, CancelCode::User)
            .unwrap()
            .is_none()
    );
}

#[test]
fn failed_accept_keeps_the_flow() {
    let mut pair = Pair::new();
    let (flow_id, start) = pair.alice_machine.start(pair.bob.clone(), &pair.rng).unwrap();
    deliver(&mut pair.bob_machine, &pair.alice, vec![start], &pair.rng);

    // Alice started the flow, there is nothing to accept.
    assert!(matches!(
        pair.alice_machine.accept(&flow_id),
        Err(VerificationError::UnexpectedState(VerificationState::Started))
    ));
    assert_eq!(
        pair.alice_machine.state(&flow_id),
        Some(VerificationState::Started)
    );

    let accept = pair.bob_machine.accept(&flow_id).unwrap();
    assert!(matches!(
        pair.bob_machine.accept(&flow_id),
        Err(VerificationError::UnexpectedState(VerificationState::Accepted))
    ));
    assert!(matches!(
        pair.bob_machine.accept(&"unknown".into()),
        Err(VerificationError::UnknownFlow(_))
    ));

    // The flow goes on as if nothing happened.
    let key = deliver(&mut pair.alice_machine, &pair.bob, vec![accept], &pair.rng);
    let key = deliver(&mut pair.bob_machine, &pair.alice, key, &pair.rng);
    deliver(&mut pair.alice_machine, &pair.bob, key, &pair.rng);
    assert_eq!(
        pair.bob_machine.state(&flow_id),
        Some(VerificationState::KeysExchanged)
    );
    assert_eq!(
        pair.alice_machine.short_auth_string(&flow_id),
        pair.bob_machine.short_auth_string(&flow_id)
    );
}

#[test]
fn other_devices_of_the_user_only_disturb() {
    let mut pair = Pair::new();
    let tablet = device("@bob:example.org", "BOBTABLET", &pair.rng);

    let (flow_id, start) = pair.alice_machine.start(pair.bob.clone(), &pair.rng).unwrap();
    deliver(&mut pair.bob_machine, &pair.alice, vec![start], &pair.rng);
    let accept = pair.bob_machine.accept(&flow_id).unwrap();
    deliver(&mut pair.alice_machine, &pair.bob, vec![accept], &pair.rng);

    // Bob's tablet sends its own key, Bob's phone committed to another one.
    let key = OutgoingVerification {
        user_id: pair.alice.user_id.clone(),
        device_id: pair.alice.device_id.clone(),
        message: VerificationMessage::Key(KeyContent {
            flow_id: flow_id.clone(),
            key: crate::crypto::x25519::SecretKey::from_rng(&pair.rng)
                .unwrap()
                .public_key(),
        }),
    };
    deliver(&mut pair.alice_machine, &tablet, vec![key], &pair.rng);
    assert_eq!(
        pair.alice_machine.state(&flow_id),
        Some(VerificationState::Cancelled {
            code: CancelCode::MismatchedCommitment,
            by_us: true
        })
    );

    // The tablet can cancel a flow it isn't part of.
    let (flow_id, start) = pair.alice_machine.start(pair.bob.clone(), &pair.rng).unwrap();
    deliver(&mut pair.bob_machine, &pair.alice, vec![start], &pair.rng);
    let cancel = VerificationMessage::cancel(flow_id.clone(), CancelCode::User);
    assert!(pair.alice_machine.receive(&tablet.user_id, cancel).is_empty());
    assert_eq!(
        pair.alice_machine.state(&flow_id),
        Some(VerificationState::Cancelled {
            code: CancelCode::User,
            by_us: false
        })
    );
}

#[test]
fn unknown_method() {
    let rng = Rng::from_seed([1; 32]);
    let alice = device("@alice:example.org", "ALICEPHONE", &rng);
    let bob = device("@bob:example.org", "BOBLAPTOP", &rng);
    let start = crate::verification::StartContent {
        flow_id: "flow".into(),
        from_device: alice.device_id.clone(),
        method: "m.qr_code.show.v1".into(),
    };
    let (flow, message) = SasVerification::from_start(bob, alice, start, TIMEOUT, &rng).unwrap();
    assert!(flow.is_cancelled());
    assert!(matches!(message, Some(VerificationMessage::Cancel(_))));
}

#[tokio::test(start_paused = true)]
async fn flows_time_out() {
    let mut pair = Pair::new();
    let (flow_id, start) = pair.alice_machine.start(pair.bob.clone(), &pair.rng).unwrap();
    deliver(&mut pair.bob_machine, &pair.alice, vec![start], &pair.rng);

    tokio::time::advance(TIMEOUT - Duration::from_secs(1)).await;
    assert!(pair.alice_machine.cancel_timed_out(Instant::now()).is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    let cancelled = pair.alice_machine.cancel_timed_out(Instant::now());
    assert_eq!(cancelled.len(), 1);
    assert_eq!(
        pair.alice_machine.state(&flow_id),
        Some(VerificationState::Cancelled {
            code: CancelCode::Timeout,
            by_us: true
        })
    );

    deliver(&mut pair.bob_machine, &pair.alice, cancelled, &pair.rng);
    assert_eq!(
        pair.bob_machine.state(&flow_id),
        Some(VerificationState::Cancelled {
            code: CancelCode::Timeout,
            by_us: false
        })
    );
}
