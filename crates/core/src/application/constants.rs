// Broker constants (No magic values)
use std::time::Duration;

/// Queue substituted for actors declared on the "default" queue
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Retry backoff: first sleep (2s)
pub const DEFAULT_INTERVAL_START: Duration = Duration::from_secs(2);

/// Retry backoff: growth per attempt (2s)
pub const DEFAULT_INTERVAL_STEP: Duration = Duration::from_secs(2);

/// Retry backoff: ceiling (30s)
pub const DEFAULT_INTERVAL_MAX: Duration = Duration::from_secs(30);

/// Wait for a publisher confirmation (5s)
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for a free producer slot (10s)
pub const DEFAULT_PRODUCER_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pooled strategy: long-lived consumer connections
pub const DEFAULT_CONSUMER_POOL_SIZE: usize = 100;

/// Pooled strategy: short-lived, high-churn producer connections
pub const DEFAULT_PRODUCER_POOL_SIZE: usize = 10;

/// Shared strategy: channels per role connection
pub const DEFAULT_CHANNEL_POOL_SIZE: usize = 100;

/// Join: consecutive empty observations required
pub const DEFAULT_JOIN_MIN_SUCCESSES: u32 = 2;

/// Join: pause between observations (100ms)
pub const DEFAULT_JOIN_IDLE_TIME: Duration = Duration::from_millis(100);
