// Broker options

use crate::application::constants::{
    DEFAULT_CONFIRM_TIMEOUT, DEFAULT_JOIN_IDLE_TIME, DEFAULT_JOIN_MIN_SUCCESSES,
    DEFAULT_PRODUCER_ACQUIRE_TIMEOUT, DEFAULT_QUEUE_NAME,
};
use crate::error::{BrokerError, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// Queue that replaces "default" in actor declarations
    pub default_queue_name: String,
    /// Default for ack/nack issued through an `Acknowledger`: wait until applied
    pub blocking_acknowledge: bool,
    /// Wait for publisher confirmations
    pub confirm_delivery: bool,
    /// Bound on publish + confirmation
    pub confirm_timeout_ms: u64,
    /// Bound on waiting for a free producer
    pub max_producer_acquire_timeout_ms: u64,
    /// Bound on waiting for a free consumer channel
    pub max_channel_acquire_timeout_ms: u64,
    /// Publish retries on recoverable errors (`None`: unbounded)
    pub max_enqueue_attempts: Option<u32>,
    /// Declare retries on recoverable errors (`None`: unbounded)
    pub max_declare_attempts: Option<u32>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            default_queue_name: DEFAULT_QUEUE_NAME.to_string(),
            blocking_acknowledge: true,
            confirm_delivery: true,
            confirm_timeout_ms: DEFAULT_CONFIRM_TIMEOUT.as_millis() as u64,
            max_producer_acquire_timeout_ms: DEFAULT_PRODUCER_ACQUIRE_TIMEOUT.as_millis() as u64,
            max_channel_acquire_timeout_ms: DEFAULT_PRODUCER_ACQUIRE_TIMEOUT.as_millis() as u64,
            max_enqueue_attempts: None,
            max_declare_attempts: None,
        }
    }
}

impl BrokerOptions {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn producer_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.max_producer_acquire_timeout_ms)
    }

    pub fn channel_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.max_channel_acquire_timeout_ms)
    }

    /// Reject settings that would make every publish or acquisition fail
    pub fn validate(&self) -> Result<()> {
        if self.default_queue_name.is_empty() {
            return Err(BrokerError::Configuration(
                "default_queue_name must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("confirm_timeout_ms", self.confirm_timeout_ms),
            ("max_producer_acquire_timeout_ms", self.max_producer_acquire_timeout_ms),
            ("max_channel_acquire_timeout_ms", self.max_channel_acquire_timeout_ms),
        ] {
            if value == 0 {
                return Err(BrokerError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Polling parameters for `Broker::join`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOptions {
    /// Consecutive empty observations required
    pub min_successes: u32,
    pub idle_time: Duration,
    pub timeout: Option<Duration>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            min_successes: DEFAULT_JOIN_MIN_SUCCESSES,
            idle_time: DEFAULT_JOIN_IDLE_TIME,
            timeout: None,
        }
    }
}

impl JoinOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}
