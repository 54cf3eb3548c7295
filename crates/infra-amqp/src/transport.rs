// AMQP transport and connection

use crate::channel::AmqpChannel;
use crate::error::classify;
use crate::options::AmqpOptions;
use async_trait::async_trait;
use conveyor_core::port::{Channel, Connection, Transport, TransportError};
use lapin::options::ConfirmSelectOptions;
use lapin::ConnectionProperties;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Opens lapin connections to one broker
pub struct AmqpTransport {
    options: AmqpOptions,
}

impl AmqpTransport {
    pub fn new(options: AmqpOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AmqpOptions {
        &self.options
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.options.connection_name().into());
        let uri = self.options.connection_uri();
        let timeout = Duration::from_millis(self.options.connect_timeout_ms);

        let connection = tokio::time::timeout(timeout, lapin::Connection::connect(&uri, properties))
            .await
            .map_err(|_| {
                TransportError::ConnectionLost(format!(
                    "connect to {} timed out after {}ms",
                    self.options.redacted_url(),
                    timeout.as_millis()
                ))
            })?
            .map_err(classify)?;

        info!(url = %self.options.redacted_url(), "AMQP connection established");
        Ok(Arc::new(AmqpConnection { connection }))
    }

    fn describe(&self) -> String {
        self.options.redacted_url()
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self.connection.create_channel().await.map_err(classify)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(classify)?;
        debug!(channel_id = channel.id(), "AMQP channel opened");
        Ok(Arc::new(AmqpChannel::new(channel)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection.close(200, "OK").await.map_err(classify)
    }
}
