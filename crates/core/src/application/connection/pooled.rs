// Pooled strategy: every acquisition borrows a whole connection

use super::{ChannelLease, ConnectionHolder, HolderStatus, ManagedConnection, Producer, ResourcePool};
use crate::application::constants::{DEFAULT_CONSUMER_POOL_SIZE, DEFAULT_PRODUCER_POOL_SIZE};
use crate::application::retry::RetryPolicy;
use crate::error::Result;
use crate::port::Transport;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PooledHolderOptions {
    /// Long-lived consumer connections (`None`: unbounded)
    pub consumer_pool_size: Option<usize>,
    /// Short-lived producer connections (`None`: unbounded)
    pub producer_pool_size: Option<usize>,
    /// Reconnect attempts before a connection error surfaces (`None`: unbounded)
    pub connect_max_retries: Option<u32>,
}

impl Default for PooledHolderOptions {
    fn default() -> Self {
        Self {
            consumer_pool_size: Some(DEFAULT_CONSUMER_POOL_SIZE),
            producer_pool_size: Some(DEFAULT_PRODUCER_POOL_SIZE),
            connect_max_retries: None,
        }
    }
}

/// Separate bounded connection pools for producers and consumers.
///
/// A consumer channel is the borrowed connection's default channel;
/// releasing it returns the whole connection to its pool.
pub struct PooledConnectionHolder {
    transport: Arc<dyn Transport>,
    connect_policy: RetryPolicy,
    consumer_pool: ResourcePool<ManagedConnection>,
    producer_pool: ResourcePool<ManagedConnection>,
}

impl PooledConnectionHolder {
    pub fn new(transport: Arc<dyn Transport>, options: PooledHolderOptions) -> Self {
        Self {
            transport,
            connect_policy: RetryPolicy::new(options.connect_max_retries),
            consumer_pool: ResourcePool::new("consumer", options.consumer_pool_size, |_| true),
            producer_pool: ResourcePool::new("producer", options.producer_pool_size, |_| true),
        }
    }

    async fn borrow(
        &self,
        pool: &ResourcePool<ManagedConnection>,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<ChannelLease> {
        let mut slot = pool.acquire(block, timeout).await?;
        let connection = slot.get_or_fill(|| {
            Arc::new(ManagedConnection::new(
                self.transport.clone(),
                self.connect_policy.clone(),
            ))
        });

        let channel = connection.default_channel().await?;
        debug!(
            pool = pool.name(),
            channel_id = channel.id(),
            in_use = pool.in_use(),
            "Borrowed pooled connection"
        );
        Ok(ChannelLease::pooled(channel, slot))
    }

    /// Connections created by either pool, borrowed or idle
    pub fn connections(&self) -> Vec<Arc<ManagedConnection>> {
        let mut connections = self.consumer_pool.members();
        connections.extend(self.producer_pool.members());
        connections
    }
}

#[async_trait]
impl ConnectionHolder for PooledConnectionHolder {
    async fn acquire_producer(&self, block: bool, timeout: Option<Duration>) -> Result<Producer> {
        let lease = self.borrow(&self.producer_pool, block, timeout).await?;
        Ok(Producer::new(lease))
    }

    async fn acquire_consumer_channel(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<ChannelLease> {
        self.borrow(&self.consumer_pool, block, timeout).await
    }

    async fn close(&self) -> Result<()> {
        for connection in self.connections() {
            if let Err(err) = connection.close().await {
                warn!(error = %err, "Failed to close pooled connection");
            }
        }
        Ok(())
    }

    fn status(&self) -> HolderStatus {
        let connected = |pool: &ResourcePool<ManagedConnection>| {
            pool.members()
                .iter()
                .filter(|connection| connection.is_connected())
                .count()
        };
        HolderStatus {
            consumer_connections: connected(&self.consumer_pool),
            producer_connections: connected(&self.producer_pool),
        }
    }
}
