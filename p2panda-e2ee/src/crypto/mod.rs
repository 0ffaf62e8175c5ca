// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives used by the session engine.
//!
//! All algorithms come from audited RustCrypto and dalek crates, this module only wraps them into
//! small, typed functions and makes sure secret material gets zeroed when it's dropped.
pub mod aead;
pub mod ed25519;
pub mod hkdf;
pub mod hmac;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;
pub mod xchacha20;

pub use rng::{Rng, RngError};
pub use secret::Secret;
