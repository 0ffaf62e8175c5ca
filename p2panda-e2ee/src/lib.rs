// SPDX-License-Identifier: MIT OR Apache-2.0

//! `p2panda-e2ee` is the end-to-end encryption session engine of a federated chat client. It
//! creates, persists, advances and tears down the cryptographic sessions devices use to encrypt
//! messages to each other and within rooms, and it drives the interactive verification of devices.
//!
//! HTTP transport, the sync loop delivering events, persistence at rest and room management are
//! not part of this crate. They are consumed through the narrow [`Homeserver`], [`RoomDirectory`]
//! and [`CryptoStore`] interfaces.
//!
//! ## Sessions
//!
//! Devices encrypt to each other with **pairwise sessions**: a triple Diffie-Hellman handshake
//! using a published one-time key of the other device, followed by a double ratchet. Every
//! message gets its own key, the first messages carry everything the receiver needs to create its
//! side of the session ("pre-key messages").
//!
//! Rooms use **group sessions**. The sending device is the only writer of its outbound group
//! session, a four-part hash ratchet whose message index only ever grows. Its key is shared with
//! all devices of the room over pairwise sessions. Receivers can decrypt from the index the key
//! was shared at onwards, never earlier messages. Every decrypted index is recorded with a hash of
//! its plaintext, a different message at a known index is rejected as replay.
//!
//! Group sessions are rotated when they get too old, after a number of messages, or when a device
//! which knew the key left the room.
//!
//! ## Crypto backend
//!
//! Ratchets and accounts are reached through the capability traits of the [`backend`] module. The
//! [`Machine`] is generic over one [`CryptoBackend`](backend::CryptoBackend), the crate ships the
//! [`NativeBackend`](backend::native::NativeBackend). Secret state only ever leaves a backend as
//! an opaque, optionally encrypted pickle.
//!
//! ## Concurrency
//!
//! All state is owned by one store. Operations hold a lock per peer, room or group session from
//! loading state until persisting it, unrelated peers and rooms proceed in parallel. Network
//! calls are retried with exponential backoff and are never made while holding such a lock.
//!
//! ## Verification
//!
//! Two users can verify that their devices hold the keys the homeserver claims by comparing short
//! authentication strings (SAS), emoji or numbers derived from an ephemeral key agreement. See
//! [`verification`].
pub mod backend;
pub mod crypto;
pub mod encoding;
pub mod events;
pub mod identifiers;
pub mod keys;
pub mod machine;
pub mod message;
pub mod retry;
pub mod store;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;
pub mod verification;

pub use machine::{Config, Device, EncryptionSettings, Machine, MachineError};
pub use store::{CryptoStore, MemoryStore};
pub use traits::{Homeserver, RoomDirectory};
