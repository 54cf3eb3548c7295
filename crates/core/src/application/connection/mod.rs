// Connection Holders
// Acquisition and release of producers and consumer channels.
// Two strategies: one pooled connection per acquisition, or one shared
// connection per role multiplexing a channel pool.

mod managed;
mod pool;
mod pooled;
mod shared;

pub use managed::ManagedConnection;
pub use pool::{PoolSlot, ResourcePool};
pub use pooled::{PooledConnectionHolder, PooledHolderOptions};
pub use shared::{SharedConnectionHolder, SharedHolderOptions};

use crate::error::{BrokerError, Result};
use crate::port::{Channel, Publish, Transport};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::warn;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection state snapshot (for diagnostics and tests)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HolderStatus {
    /// Consumer-side connections currently connected
    pub consumer_connections: usize,
    /// Producer-side connections currently connected
    pub producer_connections: usize,
}

impl HolderStatus {
    pub fn any_connected(&self) -> bool {
        self.consumer_connections + self.producer_connections > 0
    }
}

/// Resource holder contract shared by both strategies
#[async_trait]
pub trait ConnectionHolder: Send + Sync {
    /// Borrow a publisher. Waits at most `timeout` when `block` is set.
    async fn acquire_producer(&self, block: bool, timeout: Option<Duration>) -> Result<Producer>;

    /// Borrow a channel for declares, purges and consuming
    async fn acquire_consumer_channel(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<ChannelLease>;

    /// Close every connection. Idempotent; later acquisitions reconnect.
    async fn close(&self) -> Result<()>;

    fn status(&self) -> HolderStatus;
}

enum LeaseOwner {
    Connection(PoolSlot<ManagedConnection>),
    Channel(PoolSlot<dyn Channel>),
}

/// A borrowed channel. Dropping (or `release`) returns it to its owner:
/// the pooled connection goes back to its pool, a shared channel goes back
/// to the role's channel pool.
pub struct ChannelLease {
    channel: Arc<dyn Channel>,
    thread_safe: bool,
    owner: LeaseOwner,
}

impl ChannelLease {
    pub(crate) fn pooled(channel: Arc<dyn Channel>, slot: PoolSlot<ManagedConnection>) -> Self {
        Self {
            channel,
            thread_safe: false,
            owner: LeaseOwner::Connection(slot),
        }
    }

    pub(crate) fn shared(channel: Arc<dyn Channel>, slot: PoolSlot<dyn Channel>) -> Self {
        Self {
            channel,
            thread_safe: true,
            owner: LeaseOwner::Channel(slot),
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Whether acknowledgements may be issued from tasks other than the owner
    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Make sure this channel is never handed out again
    pub fn invalidate(&mut self) {
        match &mut self.owner {
            LeaseOwner::Connection(slot) => {
                if let Some(connection) = slot.get() {
                    connection.forget_default_channel();
                }
            }
            LeaseOwner::Channel(slot) => slot.discard(),
        }
    }

    pub fn release(self) {}
}

impl fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("channel_id", &self.channel.id())
            .field("thread_safe", &self.thread_safe)
            .finish()
    }
}

/// Channel-bound publisher, owned by one publish call at a time
#[derive(Debug)]
pub struct Producer {
    lease: ChannelLease,
}

impl Producer {
    pub fn new(lease: ChannelLease) -> Self {
        Self { lease }
    }

    pub fn channel_id(&self) -> u16 {
        self.lease.channel().id()
    }

    /// Publish, bounding the whole publish + confirmation by `confirm_timeout`.
    /// A channel that timed out is never reused.
    pub async fn publish(&mut self, publish: Publish, confirm_timeout: Duration) -> Result<()> {
        let channel = self.lease.channel().clone();
        let routing_key = publish.routing_key.clone();

        match tokio::time::timeout(confirm_timeout, channel.basic_publish(publish)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(
                    routing_key = %routing_key,
                    channel_id = channel.id(),
                    timeout_ms = confirm_timeout.as_millis() as u64,
                    "Publish confirmation timed out"
                );
                self.lease.invalidate();
                Err(BrokerError::Timeout(format!(
                    "no publish confirmation for '{}' within {}ms",
                    routing_key,
                    confirm_timeout.as_millis()
                )))
            }
        }
    }

    pub fn release(self) {}
}

/// Holder strategy selected at construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HolderStrategy {
    #[default]
    Pooled,
    Shared,
}

/// Strategy plus the options of both strategies
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HolderOptions {
    pub strategy: HolderStrategy,
    pub pooled: PooledHolderOptions,
    pub shared: SharedHolderOptions,
}

impl HolderOptions {
    pub fn build(&self, transport: Arc<dyn Transport>) -> Arc<dyn ConnectionHolder> {
        match self.strategy {
            HolderStrategy::Pooled => Arc::new(PooledConnectionHolder::new(
                transport,
                self.pooled.clone(),
            )),
            HolderStrategy::Shared => Arc::new(SharedConnectionHolder::new(
                transport,
                self.shared.clone(),
            )),
        }
    }
}
