//! Channel timing and retry configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reliability parameters of a channel.
///
/// Durations are (de)serialized as fractional seconds, so a TOML file reads
/// `ack_timeout = 0.5`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Total time to wait for the ACK of one transmission
    #[serde(with = "secs_f64")]
    pub ack_timeout: Duration,
    /// Upper bound on messages examined while waiting for one ACK
    pub max_retransmission_count: u32,
    /// Retransmissions after a missing ACK or a busy device
    pub busy_retries: u32,
    /// Delay before the first retransmission, doubled after each one
    #[serde(with = "secs_f64")]
    pub busy_backoff: Duration,
    /// Stale responses skipped while waiting for a channel allocation
    pub allocation_retries: u32,
    /// Consecutive corrupted messages tolerated on one read
    pub checksum_retries: u32,
    /// Wait for handshake and application responses (`None` blocks)
    #[serde(with = "opt_secs_f64", skip_serializing_if = "Option::is_none")]
    pub response_timeout: Option<Duration>,
    /// Total wait of a response synchronization
    #[serde(with = "secs_f64")]
    pub sync_timeout: Duration,
    /// Additional pings sent by a response synchronization
    pub sync_retries: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            max_retransmission_count: 20,
            busy_retries: 20,
            busy_backoff: Duration::from_millis(100),
            allocation_retries: 3,
            checksum_retries: 3,
            response_timeout: None,
            sync_timeout: Duration::from_secs(1),
            sync_retries: 3,
        }
    }
}

impl ChannelConfig {
    /// Create a backoff schedule for retransmissions.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.busy_retries, self.busy_backoff)
    }

    /// Check the configuration for values that would stall a channel.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.ack_timeout.is_zero() {
            return Err("ack_timeout must be positive".into());
        }
        if self.max_retransmission_count == 0 {
            return Err("max_retransmission_count must be positive".into());
        }
        if self.sync_timeout.is_zero() {
            return Err("sync_timeout must be positive".into());
        }
        Ok(())
    }
}

/// Exponential backoff schedule with a fixed number of retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    retries_left: u32,
    delay: Duration,
}

impl Backoff {
    /// Allow `retries` delays, starting at `initial` and doubling.
    #[must_use]
    pub fn new(retries: u32, initial: Duration) -> Self {
        Self {
            retries_left: retries,
            delay: initial,
        }
    }

    /// Next delay, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        let delay = self.delay;
        self.delay = self.delay.saturating_mul(2);
        Some(delay)
    }

    /// Retries not yet taken.
    #[must_use]
    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

mod opt_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}
