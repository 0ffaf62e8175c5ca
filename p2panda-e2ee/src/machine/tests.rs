// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backend::native::NativeBackend;
use crate::crypto::Rng;
use crate::events::{
    DecryptedToDeviceEvent, EncryptedRoomEvent, HistoryVisibility, MegolmEncryptedContent,
    Membership, ToDeviceEvent, TrustLevel, event_types,
};
use crate::identifiers::{DeviceId, RoomId, UserId, algorithms};
use crate::machine::{Config, Device, Machine, MachineError};
use crate::retry::RetryError;
use crate::store::{Changes, CryptoStore, MemoryStore};
use crate::test_utils::{MockHomeserver, MockNetwork, MockRooms, setup_logging};
use crate::verification::VerificationState;

type TestMachine = Machine<NativeBackend, MemoryStore, MockHomeserver, MockRooms>;

struct Setup {
    network: MockNetwork,
    rooms: MockRooms,
    cancel: CancellationToken,
}

impl Setup {
    fn new() -> Self {
        setup_logging();
        Self {
            network: MockNetwork::new(),
            rooms: MockRooms::new(),
            cancel: CancellationToken::new(),
        }
    }

    async fn machine(
        &self,
        user_id: &str,
        device_id: &str,
        seed: u8,
        config: Config,
    ) -> TestMachine {
        let user_id = UserId::new(user_id);
        let device_id = DeviceId::new(device_id);
        Machine::new(
            user_id.clone(),
            device_id.clone(),
            MemoryStore::new(),
            self.network.homeserver(&user_id, &device_id),
            self.rooms.clone(),
            None,
            config,
            Rng::from_seed([seed; 32]),
        )
        .await
        .unwrap()
    }

    /// Machine which published its device keys, one-time keys and fallback key.
    async fn device(&self, user_id: &str, device_id: &str, seed: u8) -> TestMachine {
        let machine = self.machine(user_id, device_id, seed, Config::default()).await;
        machine
            .handle_one_time_key_counts(0, true, &self.cancel)
            .await
            .unwrap();
        machine
    }

    /// Encrypted room with all machines as joined members.
    async fn room(&self, room_id: &str, members: &[&TestMachine]) -> RoomId {
        let room_id = RoomId::new(room_id);
        self.rooms
            .create_room(&room_id, Some(algorithms::MEGOLM), HistoryVisibility::Shared)
            .await;
        for member in members {
            self.rooms
                .set_membership(&room_id, member.user_id(), Membership::Join)
                .await;
        }
        room_id
    }

    /// Hands all waiting to-device events to a machine.
    async fn deliver(&self, machine: &TestMachine) -> Vec<DecryptedToDeviceEvent> {
        let mut decrypted = Vec::new();
        for event in self
            .network
            .take_to_device(machine.user_id(), machine.device_id())
            .await
        {
            if let Some(event) = machine.receive_to_device(&event, &self.cancel).await.unwrap() {
                decrypted.push(event);
            }
        }
        decrypted
    }

    async fn device_of(&self, machine: &TestMachine, other: &TestMachine) -> Device {
        let mut devices = machine
            .devices(other.user_id(), &self.cancel)
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
        devices.remove(0)
    }
}

fn room_event(
    sender: &TestMachine,
    room_id: &RoomId,
    content: MegolmEncryptedContent,
) -> EncryptedRoomEvent {
    EncryptedRoomEvent {
        sender: sender.user_id().clone(),
        room_id: room_id.clone(),
        content,
    }
}

#[tokio::test]
async fn hello_world() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let room_id = setup.room("!room:example.org", &[&alice, &bob]).await;

    let hello = alice
        .encrypt_group(&room_id, "m.room.message", json!({ "body": "hello" }), &setup.cancel)
        .await
        .unwrap();

    let room_keys = setup.deliver(&bob).await;
    assert_eq!(room_keys.len(), 1);
    assert_eq!(room_keys[0].event_type, event_types::ROOM_KEY);
    assert_eq!(room_keys[0].sender, *alice.user_id());
    assert_eq!(room_keys[0].sender_key, alice.identity_keys().curve25519);

    let decrypted = bob
        .decrypt_group(&room_event(&alice, &room_id, hello.clone()))
        .await
        .unwrap();
    assert_eq!(decrypted.message_index, 0);
    assert_eq!(decrypted.content, json!({ "body": "hello" }));
    assert_eq!(decrypted.event_type, "m.room.message");
    assert!(decrypted.verified);

    let world = alice
        .encrypt_group(&room_id, "m.room.message", json!({ "body": "world" }), &setup.cancel)
        .await
        .unwrap();
    assert_eq!(world.session_id, hello.session_id);

    // No new room key was needed.
    assert!(setup.deliver(&bob).await.is_empty());
    assert_eq!(setup.network.claims().await, 1);

    let decrypted = bob
        .decrypt_group(&room_event(&alice, &room_id, world.clone()))
        .await
        .unwrap();
    assert_eq!(decrypted.message_index, 1);
    assert_eq!(decrypted.content, json!({ "body": "world" }));

    // Messages of our own device can be read.
    let own = alice
        .decrypt_group(&room_event(&alice, &room_id, world))
        .await
        .unwrap();
    assert_eq!(own.content, json!({ "body": "world" }));
}

#[tokio::test]
async fn pairwise_conversation() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    assert_eq!(
        setup
            .network
            .one_time_key_count(bob.user_id(), bob.device_id())
            .await,
        50
    );

    let bob_device = setup.device_of(&alice, &bob).await;
    let alice_device = setup.device_of(&bob, &alice).await;
    assert_eq!(bob_device.keys, bob.identity_keys());

    for i in 0..3 {
        let content = alice
            .encrypt_pairwise(&bob_device, "m.dummy", json!({ "n": i }), &setup.cancel)
            .await
            .unwrap();
        let event = ToDeviceEvent {
            sender: alice.user_id().clone(),
            event_type: event_types::ENCRYPTED.to_owned(),
            content: serde_json::to_value(content).unwrap(),
        };
        let decrypted = bob
            .receive_to_device(&event, &setup.cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decrypted.content, json!({ "n": i }));
        assert_eq!(decrypted.sender_device, *alice.device_id());
        assert_eq!(decrypted.sender_ed25519, alice.identity_keys().ed25519);
    }

    // Bob answers within the session Alice created, without claiming a key.
    for i in 0..3 {
        let content = bob
            .encrypt_pairwise(&alice_device, "m.dummy", json!({ "n": i }), &setup.cancel)
            .await
            .unwrap();
        let event = ToDeviceEvent {
            sender: bob.user_id().clone(),
            event_type: event_types::ENCRYPTED.to_owned(),
            content: serde_json::to_value(content).unwrap(),
        };
        let decrypted = alice.decrypt_pairwise(&event).await.unwrap();
        assert_eq!(decrypted.content, json!({ "n": i }));
    }

    assert_eq!(setup.network.claims().await, 1);
    assert_eq!(
        setup
            .network
            .one_time_key_count(bob.user_id(), bob.device_id())
            .await,
        49
    );
}

#[tokio::test]
async fn rejected_pairwise_events_leave_no_trace() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let carol = setup.device("@carol:example.org", "CAROL", 3).await;

    let bob_device = setup.device_of(&alice, &bob).await;
    let content = alice
        .encrypt_pairwise(&bob_device, "m.dummy", json!({}), &setup.cancel)
        .await
        .unwrap();
    let mut event = ToDeviceEvent {
        sender: alice.user_id().clone(),
        event_type: event_types::ENCRYPTED.to_owned(),
        content: serde_json::to_value(content).unwrap(),
    };

    // Forwarded to another device.
    assert_matches!(
        carol.decrypt_pairwise(&event).await,
        Err(MachineError::MissingCiphertext)
    );

    // Claimed by another sender.
    event.sender = carol.user_id().clone();
    assert_matches!(
        bob.decrypt_pairwise(&event).await,
        Err(MachineError::MismatchedSender)
    );

    // The one-time key was not consumed by the failed attempt.
    event.sender = alice.user_id().clone();
    let decrypted = bob.decrypt_pairwise(&event).await.unwrap();
    assert_eq!(decrypted.sender, *alice.user_id());
}

#[tokio::test]
async fn replayed_message_index_is_rejected() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let room_id = setup.room("!room:example.org", &[&alice, &bob]).await;

    let hello = alice
        .encrypt_group(&room_id, "m.room.message", json!({ "body": "hello" }), &setup.cancel)
        .await
        .unwrap();
    setup.deliver(&bob).await;

    // Redelivery of the same message is fine.
    let first = bob
        .decrypt_group(&room_event(&alice, &room_id, hello.clone()))
        .await
        .unwrap();
    let second = bob
        .decrypt_group(&room_event(&alice, &room_id, hello))
        .await
        .unwrap();
    assert_eq!(first, second);

    // Roll Alice's ratchet back to produce another message with index 1.
    let snapshot = alice
        .store()
        .outbound_group_session(&room_id)
        .await
        .unwrap()
        .unwrap();
    let world = alice
        .encrypt_group(&room_id, "m.room.message", json!({ "body": "world" }), &setup.cancel)
        .await
        .unwrap();
    alice
        .store()
        .save_changes(Changes {
            outbound_group_sessions: vec![snapshot],
            ..Changes::default()
        })
        .await
        .unwrap();
    let forged = alice
        .encrypt_group(&room_id, "m.room.message", json!({ "body": "forged" }), &setup.cancel)
        .await
        .unwrap();
    assert_eq!(forged.session_id, world.session_id);

    let decrypted = bob
        .decrypt_group(&room_event(&alice, &room_id, world))
        .await
        .unwrap();
    assert_eq!(decrypted.message_index, 1);

    assert_matches!(
        bob.decrypt_group(&room_event(&alice, &room_id, forged)).await,
        Err(MachineError::ReplayDetected {
            message_index: 1,
            ..
        })
    );
}

#[tokio::test(start_paused = true)]
async fn one_time_keys_are_replenished_after_claims() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let carol = setup.device("@carol:example.org", "CAROL", 3).await;
    let published = || setup.network.one_time_key_count(bob.user_id(), bob.device_id());
    assert_eq!(published().await, 50);

    let bob_device = setup.device_of(&alice, &bob).await;
    alice
        .encrypt_pairwise(&bob_device, "m.dummy", json!({}), &setup.cancel)
        .await
        .unwrap();
    assert_eq!(published().await, 49);

    // The same report arrives twice, together with an outdated zero count.
    let uploads = setup.network.uploads().await;
    for count in [49, 49, 0] {
        bob.handle_one_time_key_counts(count, true, &setup.cancel)
            .await
            .unwrap();
    }
    assert_eq!(published().await, 50);
    assert_eq!(setup.network.uploads().await, uploads + 1);

    // Later on another peer claims a key.
    tokio::time::advance(Duration::from_secs(31)).await;
    let bob_device = setup.device_of(&carol, &bob).await;
    carol
        .encrypt_pairwise(&bob_device, "m.dummy", json!({}), &setup.cancel)
        .await
        .unwrap();
    assert_eq!(published().await, 49);
    bob.handle_one_time_key_counts(49, true, &setup.cancel)
        .await
        .unwrap();
    assert_eq!(published().await, 50);
    assert!(
        setup
            .network
            .has_fallback_key(bob.user_id(), bob.device_id())
            .await
    );
}

#[tokio::test(start_paused = true)]
async fn empty_pool_is_refilled_after_grace_period() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let published = || {
        setup
            .network
            .one_time_key_count(alice.user_id(), alice.device_id())
    };

    // Steady state: the pool was confirmed full a while ago.
    tokio::time::advance(Duration::from_secs(60)).await;
    alice
        .handle_one_time_key_counts(50, true, &setup.cancel)
        .await
        .unwrap();

    setup
        .network
        .drain_one_time_keys(alice.user_id(), alice.device_id())
        .await;
    let response = alice
        .handle_one_time_key_counts(0, true, &setup.cancel)
        .await
        .unwrap();
    assert_matches!(response, Some(response) if response.one_time_key_count == 50);
    assert_eq!(published().await, 50);

    // The upload is only a moment ago, the zero count is outdated.
    let uploads = setup.network.uploads().await;
    let response = alice
        .handle_one_time_key_counts(0, true, &setup.cancel)
        .await
        .unwrap();
    assert!(response.is_none());
    assert_eq!(setup.network.uploads().await, uploads);
}

#[tokio::test(start_paused = true)]
async fn zero_count_right_after_upload_is_ignored() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let uploads = setup.network.uploads().await;

    let response = alice
        .handle_one_time_key_counts(0, true, &setup.cancel)
        .await
        .unwrap();
    assert!(response.is_none());
    assert_eq!(setup.network.uploads().await, uploads);

    tokio::time::advance(Duration::from_secs(31)).await;
    let response = alice
        .handle_one_time_key_counts(0, true, &setup.cancel)
        .await
        .unwrap();
    assert!(response.is_some());
}

#[tokio::test]
async fn used_fallback_key_is_replaced() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let config = Config {
        one_time_key_target: 0,
        ..Config::default()
    };
    let bob = setup.machine("@bob:example.org", "BOB", 2, config).await;
    bob.upload_keys(&setup.cancel).await.unwrap();
    assert_eq!(
        setup
            .network
            .one_time_key_count(bob.user_id(), bob.device_id())
            .await,
        0
    );

    // Alice can only get the fallback key.
    let bob_device = setup.device_of(&alice, &bob).await;
    let content = alice
        .encrypt_pairwise(&bob_device, "m.dummy", json!({}), &setup.cancel)
        .await
        .unwrap();
    let event = ToDeviceEvent {
        sender: alice.user_id().clone(),
        event_type: event_types::ENCRYPTED.to_owned(),
        content: serde_json::to_value(content).unwrap(),
    };
    bob.decrypt_pairwise(&event).await.unwrap();

    let uploads = setup.network.uploads().await;
    let response = bob
        .handle_one_time_key_counts(0, false, &setup.cancel)
        .await
        .unwrap();
    assert!(response.is_some());
    assert_eq!(setup.network.uploads().await, uploads + 1);

    // The report might still be outdated, the key is not replaced twice.
    let response = bob
        .handle_one_time_key_counts(0, false, &setup.cancel)
        .await
        .unwrap();
    assert!(response.is_none());
}

#[tokio::test]
async fn departed_member_loses_access() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let carol = setup.device("@carol:example.org", "CAROL", 3).await;
    let room_id = setup.room("!room:example.org", &[&alice, &bob, &carol]).await;

    let first = alice
        .encrypt_group(&room_id, "m.room.message", json!({ "body": "hi all" }), &setup.cancel)
        .await
        .unwrap();
    assert_eq!(setup.deliver(&bob).await.len(), 1);
    assert_eq!(setup.deliver(&carol).await.len(), 1);
    carol
        .decrypt_group(&room_event(&alice, &room_id, first.clone()))
        .await
        .unwrap();

    let change = setup
        .rooms
        .set_membership(&room_id, carol.user_id(), Membership::Leave)
        .await;
    assert!(alice.handle_membership_change(&change).await.unwrap());

    let second = alice
        .encrypt_group(&room_id, "m.room.message", json!({ "body": "bye carol" }), &setup.cancel)
        .await
        .unwrap();
    assert_ne!(second.session_id, first.session_id);

    assert_eq!(setup.deliver(&bob).await.len(), 1);
    let decrypted = bob
        .decrypt_group(&room_event(&alice, &room_id, second.clone()))
        .await
        .unwrap();
    assert_eq!(decrypted.message_index, 0);

    assert!(setup.deliver(&carol).await.is_empty());
    assert_matches!(
        carol
            .decrypt_group(&room_event(&alice, &room_id, second))
            .await,
        Err(MachineError::MissingRoomKey { .. })
    );

    // Joins don't discard anything.
    let change = setup
        .rooms
        .set_membership(&room_id, carol.user_id(), Membership::Join)
        .await;
    assert!(!alice.handle_membership_change(&change).await.unwrap());
}

#[tokio::test]
async fn sharing_history_on_leave_depends_on_visibility() {
    let setup = Setup::new();
    let mut config = Config::default();
    config.encryption.share_history_on_leave = true;
    let alice = setup
        .machine("@alice:example.org", "ALICE", 1, config)
        .await;
    alice.upload_keys(&setup.cancel).await.unwrap();
    let bob = setup.device("@bob:example.org", "BOB", 2).await;

    let shared = setup.room("!shared:example.org", &[&alice, &bob]).await;
    let joined = RoomId::new("!joined:example.org");
    setup
        .rooms
        .create_room(&joined, Some(algorithms::MEGOLM), HistoryVisibility::Joined)
        .await;
    for member in [&alice, &bob] {
        setup
            .rooms
            .set_membership(&joined, member.user_id(), Membership::Join)
            .await;
    }

    for room_id in [&shared, &joined] {
        alice
            .encrypt_group(room_id, "m.room.message", json!({ "body": "hi" }), &setup.cancel)
            .await
            .unwrap();
    }

    let change = setup
        .rooms
        .set_membership(&shared, bob.user_id(), Membership::Leave)
        .await;
    assert!(!alice.handle_membership_change(&change).await.unwrap());

    // History is only visible to joined members, the key is replaced anyway.
    let change = setup
        .rooms
        .set_membership(&joined, bob.user_id(), Membership::Ban)
        .await;
    assert!(alice.handle_membership_change(&change).await.unwrap());
}

#[tokio::test]
async fn rotation_after_message_limit() {
    let setup = Setup::new();
    let mut config = Config::default();
    config.encryption.rotation_period_messages = 2;
    let alice = setup
        .machine("@alice:example.org", "ALICE", 1, config)
        .await;
    alice.upload_keys(&setup.cancel).await.unwrap();
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let room_id = setup.room("!room:example.org", &[&alice, &bob]).await;

    let mut session_ids = Vec::new();
    for i in 0..3 {
        let content = alice
            .encrypt_group(&room_id, "m.room.message", json!({ "n": i }), &setup.cancel)
            .await
            .unwrap();
        session_ids.push(content.session_id);
    }
    assert_eq!(session_ids[0], session_ids[1]);
    assert_ne!(session_ids[1], session_ids[2]);
    assert_eq!(setup.deliver(&bob).await.len(), 2);
}

#[tokio::test]
async fn blocked_and_untrusted_devices() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let carol = setup.device("@carol:example.org", "CAROL", 3).await;
    let room_id = setup.room("!room:example.org", &[&alice, &bob, &carol]).await;

    setup
        .rooms
        .set_trust_level(bob.user_id(), bob.device_id(), TrustLevel::Blocked)
        .await;
    alice
        .share_room_key(&room_id, &setup.cancel)
        .await
        .unwrap();
    assert!(setup.deliver(&bob).await.is_empty());
    assert_eq!(setup.deliver(&carol).await.len(), 1);

    let mut config = Config::default();
    config.encryption.only_allow_trusted_devices = true;
    let dave = setup.machine("@dave:example.org", "DAVE", 4, config).await;
    dave.upload_keys(&setup.cancel).await.unwrap();
    let other_room = setup.room("!other:example.org", &[&dave, &carol]).await;
    dave.share_room_key(&other_room, &setup.cancel)
        .await
        .unwrap();
    assert!(setup.deliver(&carol).await.is_empty());

    setup
        .rooms
        .set_trust_level(carol.user_id(), carol.device_id(), TrustLevel::Verified)
        .await;
    dave.share_room_key(&other_room, &setup.cancel)
        .await
        .unwrap();
    assert_eq!(setup.deliver(&carol).await.len(), 1);
}

#[tokio::test]
async fn unencrypted_rooms() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let room_id = RoomId::new("!plain:example.org");
    setup
        .rooms
        .create_room(&room_id, None, HistoryVisibility::Shared)
        .await;

    assert_matches!(
        alice
            .encrypt_group(&room_id, "m.room.message", json!({}), &setup.cancel)
            .await,
        Err(MachineError::RoomNotEncrypted(_))
    );
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;

    setup.network.fail_next(2).await;
    let bob_device = setup.device_of(&alice, &bob).await;
    alice
        .encrypt_pairwise(&bob_device, "m.dummy", json!({}), &setup.cancel)
        .await
        .unwrap();

    setup.network.fail_next(10).await;
    assert_matches!(
        alice.devices(bob.user_id(), &setup.cancel).await,
        Err(MachineError::Network(RetryError::Exhausted { attempts: 5, .. }))
    );
}

#[tokio::test]
async fn cancelled_operations_change_nothing() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let room_id = setup.room("!room:example.org", &[&alice, &bob]).await;

    alice
        .encrypt_group(&room_id, "m.room.message", json!({}), &setup.cancel)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_matches!(
        alice
            .encrypt_group(&room_id, "m.room.message", json!({}), &cancel)
            .await,
        Err(MachineError::Cancelled)
    );

    let content = alice
        .encrypt_group(&room_id, "m.room.message", json!({}), &setup.cancel)
        .await
        .unwrap();
    setup.deliver(&bob).await;
    let decrypted = bob
        .decrypt_group(&room_event(&alice, &room_id, content))
        .await
        .unwrap();
    assert_eq!(decrypted.message_index, 1);
}

#[tokio::test]
async fn room_key_backup() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let room_id = setup.room("!room:example.org", &[&alice, &bob]).await;

    let mut messages = Vec::new();
    for i in 0..2 {
        messages.push(
            alice
                .encrypt_group(&room_id, "m.room.message", json!({ "n": i }), &setup.cancel)
                .await
                .unwrap(),
        );
    }
    setup.deliver(&bob).await;

    let backup = bob.export_room_keys().await.unwrap();
    assert_eq!(backup.len(), 1);
    assert_eq!(backup[0].session_id, messages[0].session_id);

    // A new device of Bob which is not a member of the room.
    let bob_laptop = setup.device("@bob:example.org", "BOBLAPTOP", 4).await;
    assert_eq!(bob_laptop.import_room_keys(&backup).await.unwrap(), 1);
    assert_eq!(bob_laptop.import_room_keys(&backup).await.unwrap(), 0);

    for (i, message) in messages.into_iter().enumerate() {
        let decrypted = bob_laptop
            .decrypt_group(&room_event(&alice, &room_id, message))
            .await
            .unwrap();
        assert_eq!(decrypted.content, json!({ "n": i }));
        assert!(!decrypted.verified);
    }
}

#[tokio::test]
async fn concurrent_encryption_and_decryption() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;
    let room_id = setup.room("!room:example.org", &[&alice, &bob]).await;

    let (first, second) = tokio::join!(
        alice.encrypt_group(&room_id, "m.room.message", json!({ "n": 0 }), &setup.cancel),
        alice.encrypt_group(&room_id, "m.room.message", json!({ "n": 1 }), &setup.cancel),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.session_id, second.session_id);
    setup.deliver(&bob).await;

    let (first_event, second_event) = (
        room_event(&alice, &room_id, first),
        room_event(&alice, &room_id, second),
    );
    let (first, second) = tokio::join!(
        bob.decrypt_group(&first_event),
        bob.decrypt_group(&second_event),
    );
    let mut indices = vec![first.unwrap().message_index, second.unwrap().message_index];
    indices.sort();
    assert_eq!(indices, vec![0, 1]);
}

#[tokio::test]
async fn verification_between_devices() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;

    let flow_id = alice
        .start_verification(bob.user_id(), bob.device_id(), &setup.cancel)
        .await
        .unwrap();
    assert!(setup.deliver(&bob).await.is_empty());
    assert_eq!(
        bob.verification_state(&flow_id).await,
        Some(VerificationState::Requested)
    );

    bob.accept_verification(&flow_id, &setup.cancel)
        .await
        .unwrap();
    setup.deliver(&alice).await;
    setup.deliver(&bob).await;
    setup.deliver(&alice).await;

    let alice_sas = alice.short_auth_string(&flow_id).await.unwrap();
    let bob_sas = bob.short_auth_string(&flow_id).await.unwrap();
    assert_eq!(alice_sas.emoji(), bob_sas.emoji());
    assert_eq!(alice_sas.decimals(), bob_sas.decimals());

    bob.confirm_verification(&flow_id, &setup.cancel)
        .await
        .unwrap();
    alice
        .confirm_verification(&flow_id, &setup.cancel)
        .await
        .unwrap();
    setup.deliver(&alice).await;
    setup.deliver(&bob).await;
    setup.deliver(&alice).await;

    assert_eq!(
        alice.verification_state(&flow_id).await,
        Some(VerificationState::Done)
    );
    assert_eq!(
        bob.verification_state(&flow_id).await,
        Some(VerificationState::Done)
    );
    let verified = alice.verified_device(&flow_id).await.unwrap();
    assert_eq!(verified.device_id, *bob.device_id());
    assert_eq!(verified.ed25519, bob.identity_keys().ed25519);
}

#[tokio::test]
async fn mismatching_codes_cancel_verification() {
    let setup = Setup::new();
    let alice = setup.device("@alice:example.org", "ALICE", 1).await;
    let bob = setup.device("@bob:example.org", "BOB", 2).await;

    let flow_id = alice
        .start_verification(bob.user_id(), bob.device_id(), &setup.cancel)
        .await
        .unwrap();
    setup.deliver(&bob).await;
    bob.accept_verification(&flow_id, &setup.cancel)
        .await
        .unwrap();
    setup.deliver(&alice).await;
    setup.deliver(&bob).await;
    setup.deliver(&alice).await;

    alice
        .mismatch_verification(&flow_id, &setup.cancel)
        .await
        .unwrap();
    setup.deliver(&bob).await;

    assert!(alice.verified_device(&flow_id).await.is_none());
    assert_matches!(
        bob.verification_state(&flow_id).await,
        Some(VerificationState::Cancelled { by_us: false, .. })
    );
    assert_matches!(
        bob.confirm_verification(&flow_id, &setup.cancel).await,
        Err(MachineError::Verification(_))
    );
}
