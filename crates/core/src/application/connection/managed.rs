// Lazily connecting, reconnectable connection

use super::lock;
use crate::application::retry::{log_recoverable_error, retry_over_time, RetryPolicy};
use crate::error::{BrokerError, Result};
use crate::port::{Channel, Connection, Transport};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Owns at most one live transport connection and reconnects on demand.
///
/// Nothing touches the network until the first `ensure_connected`.
pub struct ManagedConnection {
    transport: Arc<dyn Transport>,
    connect_policy: RetryPolicy,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    default_channel: Mutex<Option<Arc<dyn Channel>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ManagedConnection {
    pub fn new(transport: Arc<dyn Transport>, connect_policy: RetryPolicy) -> Self {
        Self {
            transport,
            connect_policy,
            connection: Mutex::new(None),
            default_channel: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.live_connection().is_some()
    }

    fn live_connection(&self) -> Option<Arc<dyn Connection>> {
        lock(&self.connection)
            .as_ref()
            .filter(|connection| connection.is_connected())
            .cloned()
    }

    /// Return the live connection, connecting (with retries) when needed
    pub async fn ensure_connected(&self) -> Result<Arc<dyn Connection>> {
        if let Some(connection) = self.live_connection() {
            return Ok(connection);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(connection) = self.live_connection() {
            return Ok(connection);
        }

        let transport = &self.transport;
        let connection = retry_over_time(
            &self.connect_policy,
            move || async move { transport.connect().await.map_err(BrokerError::from) },
            log_recoverable_error,
        )
        .await?;

        info!(target_broker = %self.transport.describe(), "Connected");
        *lock(&self.connection) = Some(connection.clone());
        *lock(&self.default_channel) = None;
        Ok(connection)
    }

    /// The connection's own channel, reopened when it was closed
    pub async fn default_channel(&self) -> Result<Arc<dyn Channel>> {
        let connection = self.ensure_connected().await?;

        let cached = lock(&self.default_channel)
            .as_ref()
            .filter(|channel| channel.is_open())
            .cloned();
        if let Some(channel) = cached {
            return Ok(channel);
        }

        let channel = connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Opened default channel");
        *lock(&self.default_channel) = Some(channel.clone());
        Ok(channel)
    }

    /// Stop handing out the cached default channel; the next caller gets a fresh one.
    /// The abandoned channel goes away with its connection.
    pub fn forget_default_channel(&self) {
        lock(&self.default_channel).take();
    }

    pub async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let connection = self.ensure_connected().await?;
        Ok(connection.create_channel().await?)
    }

    /// Close the current connection, if any; a later `ensure_connected` reconnects
    pub async fn close(&self) -> Result<()> {
        lock(&self.default_channel).take();
        let connection = lock(&self.connection).take();

        if let Some(connection) = connection {
            if connection.is_connected() {
                connection.close().await?;
                debug!(target_broker = %self.transport.describe(), "Connection closed");
            }
        }
        Ok(())
    }
}
