// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replenishment of published one-time keys.
//!
//! The homeserver reports how many of our one-time keys are still published with every sync.
//! Reports can arrive duplicated or out of order and may be outdated, so the tracker remembers
//! down to which count it already generated keys. For a shortfall it only generates the keys it
//! didn't generate before: the counts `[49, 49, 0]` in any order lead to exactly as many keys as
//! the lowest count requires.
//!
//! The count the homeserver answers an upload with is authoritative and starts a new round. Within
//! the grace period after an upload a report of zero, or a repeat of the count the upload made up
//! for, is treated as outdated.
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
pub struct OneTimeKeyTracker {
    target: u64,
    zero_count_grace: Duration,
    /// Lowest reported count we generated keys for, since the pool was last full.
    compensated_down_to: Option<u64>,
    /// Reported count the last upload made up for.
    uploaded_for: Option<u64>,
    /// Last upload after which the homeserver reported published keys.
    last_upload: Option<Instant>,
    last_fallback_rotation: Option<Instant>,
    device_keys_uploaded: bool,
}

impl OneTimeKeyTracker {
    pub fn new(target: u64, zero_count_grace: Duration) -> Self {
        Self {
            target,
            zero_count_grace,
            compensated_down_to: None,
            uploaded_for: None,
            last_upload: None,
            last_fallback_rotation: None,
            device_keys_uploaded: false,
        }
    }

    fn within_grace(&self, since: Option<Instant>, now: Instant) -> bool {
        since.is_some_and(|since| now.saturating_duration_since(since) < self.zero_count_grace)
    }

    /// Number of keys to generate for a reported count of published keys.
    pub fn keys_to_generate(&mut self, count: u64, now: Instant) -> u64 {
        if count >= self.target {
            self.compensated_down_to = None;
            return 0;
        }

        if self.within_grace(self.last_upload, now) {
            if count == 0 {
                trace!("ignoring zero one-time key count right after upload");
                return 0;
            }
            if self.uploaded_for == Some(count) {
                trace!(count, "ignoring repeated one-time key count right after upload");
                return 0;
            }
        }

        let compensated = self.compensated_down_to.unwrap_or(self.target);
        if count >= compensated {
            return 0;
        }

        self.compensated_down_to = Some(count);
        compensated - count
    }

    /// Whether a used fallback key should be replaced now. A replacement is only done once per
    /// grace period, reports may still show the old key as used right after rotating it.
    pub fn rotate_fallback_key(&mut self, now: Instant) -> bool {
        if self.within_grace(self.last_fallback_rotation, now) {
            return false;
        }
        self.last_fallback_rotation = Some(now);
        true
    }

    pub fn device_keys_uploaded(&self) -> bool {
        self.device_keys_uploaded
    }

    /// Records a successful upload and the count the homeserver answered with.
    pub fn uploaded(&mut self, count: u64, now: Instant) {
        self.device_keys_uploaded = true;
        self.uploaded_for = self.compensated_down_to.take();
        if count > 0 {
            self.last_upload = Some(now);
        }
    }
}
