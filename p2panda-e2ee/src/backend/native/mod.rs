// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pure Rust backend built on X25519, Ed25519, ChaCha20-Poly1305 and SHA256.
mod account;
mod group_session;
mod megolm;
mod ratchet;
mod session;
mod wire;

pub use account::{Account, MAX_ONE_TIME_KEYS};
pub use group_session::{GroupSession, InboundGroupSession};
pub use session::{Session, SessionKeys};

use crate::backend::CryptoBackend;

/// Backend implemented in this crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeBackend;

impl CryptoBackend for NativeBackend {
    type Account = Account;
    type Session = Session;
    type GroupSession = GroupSession;
    type InboundGroupSession = InboundGroupSession;

    fn name() -> &'static str {
        "native"
    }
}
