// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interactive verification of devices with short authentication strings (SAS).
//!
//! Two users compare emoji or numbers derived from an ephemeral key agreement between their
//! devices. When the codes match, both devices exchange MACs over their Ed25519 keys, which proves
//! that the keys belong to the devices the users are holding.
mod content;
mod flow;
mod machine;
mod sas;
#[cfg(test)]
mod tests;

pub use content::{
    AcceptContent, CancelCode, CancelContent, DoneContent, KeyContent, MacContent, SAS_METHOD,
    StartContent, VerificationMessage,
};
pub use flow::{SasVerification, VerificationDevice, VerificationError, VerificationState};
pub use machine::{OutgoingVerification, VerificationMachine};
pub use sas::{EMOJI, Emoji, EstablishedSas, Sas, SasError, ShortAuthString};
