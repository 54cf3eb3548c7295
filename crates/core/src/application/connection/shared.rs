// Shared strategy: one long-lived connection per role, multiplexing channels

use super::{ChannelLease, ConnectionHolder, HolderStatus, ManagedConnection, Producer, ResourcePool};
use crate::application::constants::DEFAULT_CHANNEL_POOL_SIZE;
use crate::application::retry::RetryPolicy;
use crate::error::Result;
use crate::port::{Channel, Transport};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SharedHolderOptions {
    pub consumer_channel_pool_size: Option<usize>,
    pub producer_channel_pool_size: Option<usize>,
    pub connect_max_retries: Option<u32>,
}

impl Default for SharedHolderOptions {
    fn default() -> Self {
        Self {
            consumer_channel_pool_size: Some(DEFAULT_CHANNEL_POOL_SIZE),
            producer_channel_pool_size: Some(DEFAULT_CHANNEL_POOL_SIZE),
            connect_max_retries: None,
        }
    }
}

struct SharedRole {
    name: &'static str,
    connection: ManagedConnection,
    channels: ResourcePool<dyn Channel>,
    // Held across "ensure connected, then take a channel" so no channel is
    // created on a connection that is being replaced
    lock: Mutex<()>,
}

impl SharedRole {
    fn new(
        name: &'static str,
        transport: Arc<dyn Transport>,
        connect_policy: RetryPolicy,
        channel_pool_size: Option<usize>,
    ) -> Self {
        Self {
            name,
            connection: ManagedConnection::new(transport, connect_policy),
            channels: ResourcePool::new(name, channel_pool_size, |channel| channel.is_open()),
            lock: Mutex::new(()),
        }
    }

    async fn acquire(&self, block: bool, timeout: Option<Duration>) -> Result<ChannelLease> {
        let _guard = self.lock.lock().await;

        let connection = self.connection.ensure_connected().await?;
        let mut slot = self.channels.acquire(block, timeout).await?;

        let channel = match slot.get() {
            Some(channel) => channel.clone(),
            None => {
                let channel = connection.create_channel().await?;
                slot.fill(channel.clone());
                channel
            }
        };

        debug!(
            role = self.name,
            channel_id = channel.id(),
            in_use = self.channels.in_use(),
            "Acquired shared channel"
        );
        Ok(ChannelLease::shared(channel, slot))
    }

    async fn close(&self) -> Result<()> {
        for channel in self.channels.drain_idle() {
            if let Err(err) = channel.close().await {
                debug!(role = self.name, error = %err, "Ignoring channel close failure");
            }
        }
        self.connection.close().await
    }
}

/// One consumer connection and one producer connection, each with a
/// bounded channel pool. Exhausting a channel pool raises `LimitExceeded`.
pub struct SharedConnectionHolder {
    consumer: SharedRole,
    producer: SharedRole,
}

impl SharedConnectionHolder {
    pub fn new(transport: Arc<dyn Transport>, options: SharedHolderOptions) -> Self {
        let connect_policy = RetryPolicy::new(options.connect_max_retries);
        Self {
            consumer: SharedRole::new(
                "consumer",
                transport.clone(),
                connect_policy.clone(),
                options.consumer_channel_pool_size,
            ),
            producer: SharedRole::new(
                "producer",
                transport,
                connect_policy,
                options.producer_channel_pool_size,
            ),
        }
    }
}

#[async_trait]
impl ConnectionHolder for SharedConnectionHolder {
    async fn acquire_producer(&self, block: bool, timeout: Option<Duration>) -> Result<Producer> {
        let lease = self.producer.acquire(block, timeout).await?;
        Ok(Producer::new(lease))
    }

    async fn acquire_consumer_channel(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<ChannelLease> {
        self.consumer.acquire(block, timeout).await
    }

    async fn close(&self) -> Result<()> {
        for role in [&self.consumer, &self.producer] {
            if let Err(err) = role.close().await {
                warn!(role = role.name, error = %err, "Failed to close shared connection");
            }
        }
        Ok(())
    }

    fn status(&self) -> HolderStatus {
        HolderStatus {
            consumer_connections: usize::from(self.consumer.connection.is_connected()),
            producer_connections: usize::from(self.producer.connection.is_connected()),
        }
    }
}
