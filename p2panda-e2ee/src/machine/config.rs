// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use crate::retry::RetryConfig;

/// Policy of group sessions and room key distribution.
#[derive(Clone, Debug)]
pub struct EncryptionSettings {
    /// Rotate the outbound group session of a room once it is older than this.
    pub rotation_period: Duration,

    /// Rotate the outbound group session of a room after this many messages.
    pub rotation_period_messages: u64,

    /// Only share room keys with verified devices. Blocked devices never receive room keys.
    pub only_allow_trusted_devices: bool,

    /// Keep using the outbound group session when a member leaves or gets banned. Only applies
    /// to rooms with shared or world readable history, other rooms always get a new session.
    pub share_history_on_leave: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            rotation_period: Duration::from_secs(60 * 60 * 24 * 7), // 7 days
            rotation_period_messages: 100,
            only_allow_trusted_devices: false,
            share_history_on_leave: false,
        }
    }
}

/// Configuration of a [`Machine`](crate::machine::Machine).
#[derive(Clone, Debug)]
pub struct Config {
    pub encryption: EncryptionSettings,

    /// Number of published one-time keys we aim for.
    pub one_time_key_target: u64,

    /// A reported one-time key count of zero is ignored for this long after an upload, the
    /// homeserver might not have counted our new keys yet.
    pub zero_count_grace: Duration,

    /// Time the previous fallback key stays usable after it was replaced, for pre-key messages
    /// which are still in flight.
    pub fallback_key_grace: Duration,

    /// Backoff and timeouts of homeserver calls.
    pub retry: RetryConfig,

    /// Verifications which don't finish in time get cancelled.
    pub verification_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encryption: EncryptionSettings::default(),
            one_time_key_target: 50,
            zero_count_grace: Duration::from_secs(30),
            fallback_key_grace: Duration::from_secs(60 * 60), // 1 hour
            retry: RetryConfig::default(),
            verification_timeout: Duration::from_secs(60 * 10), // 10 minutes
        }
    }
}
