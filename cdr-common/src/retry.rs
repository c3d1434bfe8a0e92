//! # Retry
//!
//! Module providing the `RetryEntry` carried between delivery attempts and the `RetryPolicy`
//! deciding whether an entry may be attempted now.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::record::Event;

/// An event together with its delivery history. This is also the JSON body sent to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    #[serde(rename = "Data")]
    pub event: Event,
    /// Number of failed attempts so far.
    #[serde(rename = "ReserveTimes")]
    pub attempt_count: u32,
    #[serde(rename = "ReserveAt")]
    pub last_attempt_at: DateTime<Utc>,
}

impl RetryEntry {
    /// A fresh entry for a newly decoded event.
    pub fn new(event: Event, now: DateTime<Utc>) -> Self {
        Self {
            event,
            attempt_count: 0,
            last_attempt_at: now,
        }
    }

    /// Serialize this entry as the request payload.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Account for one more failed attempt made at `now`.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.last_attempt_at = now;
    }
}

/// Key identifying a retry entry: the hex MD5 digest of its serialized payload.
///
/// Entries serializing to identical payloads share a key and overwrite each other.
pub fn content_key(payload: &[u8]) -> String {
    format!("{:x}", md5::compute(payload))
}

/// What to do with an entry when it comes up for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send it now.
    Attempt,
    /// Its backoff interval has not elapsed yet, keep it as it is.
    Wait,
    /// It has exhausted its attempts.
    Drop,
}

#[derive(Clone, Debug)]
/// A retry policy with a quadratic backoff and a cap on the number of attempts.
pub struct RetryPolicy {
    /// Entries with more failed attempts than this are dropped.
    pub max_retry: u32,
    /// Multiplied by the square of the attempt count to get the backoff interval.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retry: u32, backoff_base: Duration) -> Self {
        Self {
            max_retry,
            backoff_base,
        }
    }

    /// Minimum time to wait after the last failed attempt before trying again.
    pub fn backoff_interval(&self, attempt_count: u32) -> Duration {
        let attempts = i32::try_from(attempt_count).unwrap_or(i32::MAX);

        self.backoff_base
            .checked_mul(attempts.saturating_mul(attempts))
            .unwrap_or(Duration::MAX)
    }

    /// Decide what to do with `entry` at `now`.
    /// The attempt cap is checked first, so an exhausted entry is dropped even while backing off.
    pub fn decide(&self, entry: &RetryEntry, now: DateTime<Utc>) -> RetryDecision {
        if entry.attempt_count > self.max_retry {
            return RetryDecision::Drop;
        }

        if entry.attempt_count > 0 {
            let elapsed = Duration::seconds((now - entry.last_attempt_at).num_seconds());
            if elapsed < self.backoff_interval(entry.attempt_count) {
                return RetryDecision::Wait;
            }
        }

        RetryDecision::Attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 5,
            backoff_base: Duration::seconds(53),
        }
    }
}
