// In-memory transport
// Implements the Transport, Connection, Channel and DeliveryStream ports
// over a shared BrokerState. Waiting consumers are woken through a Notify
// on every state change and at the next head-of-queue expiry.

use crate::state::{BrokerState, ChannelKey, FaultOp};
use async_trait::async_trait;
use conveyor_core::domain::{QueueSpec, QueueStats};
use conveyor_core::port::{
    Channel, Connection, Delivery, DeliveryStream, Publish, Transport, TransportError,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Default channel limit per connection (AMQP channel_max)
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

struct Shared {
    name: String,
    state: Mutex<BrokerState>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a state mutation and wake every waiting consumer
    fn mutate<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let result = f(&mut self.lock());
        self.changed.notify_waiters();
        result
    }
}

/// Process-local AMQP-like broker.
///
/// Clones share the same queues, so a test can keep one handle for
/// inspection and fault injection while the broker under test owns another.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_channel_max(name, DEFAULT_CHANNEL_MAX)
    }

    pub fn with_channel_max(name: impl Into<String>, channel_max: u16) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(BrokerState::new(channel_max)),
                changed: Notify::new(),
            }),
        }
    }

    // ---------------------------------------------------------------
    // Fault injection
    // ---------------------------------------------------------------

    /// Taking the broker offline drops every connection; new connects fail
    /// with `ConnectionLost` until it is back online
    pub fn set_online(&self, online: bool) {
        self.shared.mutate(|state| {
            state.online = online;
            if !online {
                state.close_all_connections();
            }
        });
    }

    /// Fail the next `op` with `error`. Queued failures apply in order.
    pub fn fail_next(&self, op: FaultOp, error: TransportError) {
        self.shared.lock().push_fault(op, error);
    }

    /// While stalled, publishes never complete (no confirmation arrives)
    pub fn stall_publishes(&self, stalled: bool) {
        self.shared.mutate(|state| state.publish_stalled = stalled);
    }

    /// Delete a queue behind the broker's back
    pub fn remove_queue(&self, queue_name: &str) -> bool {
        self.shared.mutate(|state| state.remove_queue(queue_name))
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Ready messages in `queue_name`, after expiring due heads
    pub fn queue_len(&self, queue_name: &str) -> Option<usize> {
        self.shared.mutate(|state| {
            state.sweep();
            state.queue_len(queue_name)
        })
    }

    pub fn queue_spec(&self, queue_name: &str) -> Option<QueueSpec> {
        self.shared.lock().queue_spec(queue_name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.shared.lock().queue_names()
    }

    pub fn bodies(&self, queue_name: &str) -> Vec<Vec<u8>> {
        self.shared.mutate(|state| {
            state.sweep();
            state.bodies(queue_name)
        })
    }

    /// Non-passive declares issued for `queue_name`
    pub fn declare_count(&self, queue_name: &str) -> usize {
        self.shared.lock().declare_count(queue_name)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().open_connections()
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> usize {
        self.shared.lock().connects
    }

    pub fn published_count(&self) -> usize {
        self.shared.lock().published
    }

    pub fn acked_count(&self) -> usize {
        self.shared.lock().acked
    }

    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let id = self.shared.mutate(|state| state.open_connection())?;
        debug!(broker = %self.shared.name, connection = id, "Memory connection opened");
        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            id,
        }))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.shared.name)
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.shared.lock().is_connection_open(self.id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let key = self.shared.lock().open_channel(self.id)?;
        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            key,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.mutate(|state| state.close_connection(self.id));
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    key: ChannelKey,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> u16 {
        self.key.channel
    }

    fn is_open(&self) -> bool {
        self.shared.lock().is_channel_open(self.key)
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueStats, TransportError> {
        self.shared.mutate(|state| state.declare(self.key, spec))
    }

    async fn queue_declare_passive(&self, queue_name: &str) -> Result<QueueStats, TransportError> {
        self.shared
            .mutate(|state| state.declare_passive(self.key, queue_name))
    }

    async fn queue_purge(&self, queue_name: &str) -> Result<u32, TransportError> {
        self.shared.mutate(|state| state.purge(self.key, queue_name))
    }

    async fn queue_delete(
        &self,
        queue_name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, TransportError> {
        self.shared
            .mutate(|state| state.delete(self.key, queue_name, if_unused, if_empty))
    }

    async fn basic_publish(&self, publish: Publish) -> Result<(), TransportError> {
        if self.shared.lock().publish_stalled {
            debug!(routing_key = %publish.routing_key, "Publish stalled");
            std::future::pending::<()>().await;
        }
        self.shared.mutate(|state| state.publish(self.key, publish))
    }

    async fn basic_consume(
        &self,
        queue_name: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, TransportError> {
        let consumer_tag = self
            .shared
            .mutate(|state| state.consume(self.key, queue_name, prefetch))?;
        Ok(Box::new(MemoryDeliveryStream {
            shared: self.shared.clone(),
            consumer_tag,
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.shared.mutate(|state| state.ack(self.key, delivery_tag))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.shared
            .mutate(|state| state.reject(self.key, delivery_tag, requeue))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.mutate(|state| state.close_channel(self.key));
        Ok(())
    }
}

struct MemoryDeliveryStream {
    shared: Arc<Shared>,
    consumer_tag: String,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    async fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register for wake-ups before looking, so no change is missed
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let next_expiry = {
                let mut state = self.shared.lock();
                if let Some(delivery) = state.take_delivery(&self.consumer_tag)? {
                    return Ok(Some(delivery));
                }
                state.next_expiry()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn cancel(&mut self) -> Result<(), TransportError> {
        self.shared
            .mutate(|state| state.cancel(&self.consumer_tag));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::QueueArguments;
    use conveyor_core::port::MessageProperties;

    fn spec(name: &str, arguments: QueueArguments) -> QueueSpec {
        QueueSpec {
            name: name.to_string(),
            durable: true,
            auto_delete: false,
            arguments,
        }
    }

    fn publish(routing_key: &str, body: &[u8], expiration_ms: Option<u64>) -> Publish {
        Publish {
            exchange: String::new(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: MessageProperties {
                expiration_ms,
                ..Default::default()
            },
            mandatory: true,
            confirm: true,
        }
    }

    async fn channel(transport: &MemoryTransport) -> Arc<dyn Channel> {
        let connection = transport.connect().await.unwrap();
        connection.create_channel().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_is_dead_lettered() {
        let transport = MemoryTransport::default();
        let channel = channel(&transport).await;
        channel
            .queue_declare(&spec("q", QueueArguments::default()))
            .await
            .unwrap();
        let delay_arguments = QueueArguments {
            dead_letter_exchange: Some(String::new()),
            dead_letter_routing_key: Some("q".to_string()),
            ..Default::default()
        };
        channel
            .queue_declare(&spec("q.DQ", delay_arguments))
            .await
            .unwrap();

        channel
            .basic_publish(publish("q.DQ", b"later", Some(1_000)))
            .await
            .unwrap();
        assert_eq!(transport.queue_len("q.DQ"), Some(1));

        let mut stream = channel.basic_consume("q", 1).await.unwrap();
        let started = Instant::now();
        let delivery = stream
            .next(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(delivery.body, b"later".to_vec());
        assert_eq!(delivery.properties.expiration_ms, None);
        assert_eq!(transport.queue_len("q.DQ"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_times_out_on_empty_queue() {
        let transport = MemoryTransport::default();
        let channel = channel(&transport).await;
        channel
            .queue_declare(&spec("q", QueueArguments::default()))
            .await
            .unwrap();

        let mut stream = channel.basic_consume("q", 1).await.unwrap();
        assert!(stream.next(Duration::from_millis(200)).await.unwrap().is_none());
        assert!(stream.next(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken_by_publish() {
        let transport = MemoryTransport::default();
        let channel = channel(&transport).await;
        channel
            .queue_declare(&spec("q", QueueArguments::default()))
            .await
            .unwrap();
        let mut stream = channel.basic_consume("q", 1).await.unwrap();

        let publisher = {
            let channel = channel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                channel.basic_publish(publish("q", b"now", None)).await
            })
        };

        let delivery = stream.next(Duration::from_secs(5)).await.unwrap();
        publisher.await.unwrap().unwrap();
        assert_eq!(delivery.unwrap().body, b"now".to_vec());
    }

    #[tokio::test]
    async fn test_offline_broker_refuses_connections() {
        let transport = MemoryTransport::default();
        let connection = transport.connect().await.unwrap();
        assert!(connection.is_connected());

        transport.set_online(false);
        assert!(!connection.is_connected());
        assert!(matches!(
            transport.connect().await.err().unwrap(),
            TransportError::ConnectionLost(_)
        ));

        transport.set_online(true);
        assert!(transport.connect().await.is_ok());
        assert_eq!(transport.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_missing_queue_on_consume_closes_channel() {
        let transport = MemoryTransport::default();
        let channel = channel(&transport).await;

        let err = channel.basic_consume("missing", 1).await.err().unwrap();

        assert_eq!(err.reply_code(), Some(404));
        assert!(!channel.is_open());
    }
}
