// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifiers for users, devices, rooms, sessions and keys.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::encoding::base64_encode;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Fully qualified user identifier, for example `@panda:example.org`.
    UserId
);

string_id!(
    /// Identifier of one device of a user.
    DeviceId
);

string_id!(
    /// Identifier of a room.
    RoomId
);

string_id!(
    /// Identifier of a pairwise or group session, derived from public session material.
    SessionId
);

string_id!(
    /// Identifier of a verification flow, chosen by the device starting it.
    FlowId
);

/// Identifier of a one-time or fallback key inside an account.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId(pub u64);

impl KeyId {
    /// Base64 representation used in key names like `signed_curve25519:AAAAAQ`.
    pub fn to_base64(self) -> String {
        base64_encode(self.0.to_be_bytes())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Algorithm names of device keys, one-time keys and encrypted events.
pub mod algorithms {
    /// Pairwise session algorithm (3DH + double ratchet, ChaCha20-Poly1305, SHA256).
    pub const OLM: &str = "m.olm.v1.curve25519-chacha20-sha2";

    /// Group session algorithm (four-part hash ratchet, ChaCha20-Poly1305, SHA256).
    pub const MEGOLM: &str = "m.megolm.v1.chacha20-sha2";

    pub const CURVE25519: &str = "curve25519";

    pub const ED25519: &str = "ed25519";

    pub const SIGNED_CURVE25519: &str = "signed_curve25519";
}

/// Key identifier of the form `<algorithm>:<device id or key id>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKeyId(String);

impl DeviceKeyId {
    pub fn new(algorithm: &str, key_name: &str) -> Self {
        Self(format!("{algorithm}:{key_name}"))
    }

    pub fn curve25519(device_id: &DeviceId) -> Self {
        Self::new(algorithms::CURVE25519, device_id.as_str())
    }

    pub fn ed25519(device_id: &DeviceId) -> Self {
        Self::new(algorithms::ED25519, device_id.as_str())
    }

    pub fn signed_curve25519(key_id: KeyId) -> Self {
        Self::new(algorithms::SIGNED_CURVE25519, &key_id.to_base64())
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(algorithm, _)| algorithm).unwrap_or(&self.0)
    }

    pub fn key_name(&self) -> &str {
        self.0.split_once(':').map(|(_, name)| name).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceKeyId({:?})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceId, DeviceKeyId, KeyId, algorithms};

    #[test]
    fn key_ids() {
        let device_id = DeviceId::new("PANDAPHONE");
        let key_id = DeviceKeyId::ed25519(&device_id);
        assert_eq!(key_id.as_str(), "ed25519:PANDAPHONE");
        assert_eq!(key_id.algorithm(), algorithms::ED25519);
        assert_eq!(key_id.key_name(), "PANDAPHONE");

        let one_time = DeviceKeyId::signed_curve25519(KeyId(1));
        assert_eq!(one_time.as_str(), "signed_curve25519:AAAAAAAAAAE");
    }
}
