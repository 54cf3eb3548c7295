// Transport Port
// Abstraction over the wire-protocol client: connections, channels,
// publish-with-confirm, consume-with-prefetch and queue declare/purge/delete

use crate::domain::{QueueSpec, QueueStats};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// AMQP reply codes the broker reacts to
pub mod reply_code {
    pub const CONTENT_TOO_LARGE: u16 = 311;
    pub const NO_ROUTE: u16 = 312;
    pub const NO_CONSUMERS: u16 = 313;
    pub const CONNECTION_FORCED: u16 = 320;
    pub const ACCESS_REFUSED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RESOURCE_LOCKED: u16 = 405;
    pub const PRECONDITION_FAILED: u16 = 406;
    pub const NOT_ALLOWED: u16 = 530;
    /// Used for publishes the server negatively confirmed
    pub const INTERNAL_ERROR: u16 = 541;

    /// Channel errors worth retrying on a fresh channel
    pub const RECOVERABLE_CHANNEL_CODES: [u16; 3] =
        [CONTENT_TOO_LARGE, NO_CONSUMERS, RESOURCE_LOCKED];
}

/// Marker in PRECONDITION_FAILED replies caused by a declare whose
/// arguments differ from the existing queue
pub const INEQUIVALENT_ARG_MARKER: &str = "inequivalent arg";

/// Transport-level failures, classified by the adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Socket/heartbeat failure or use of an already-closed connection/channel
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Connection closed by the server with a hard error
    #[error("Connection error ({code}): {message}")]
    Connection { code: u16, message: String },

    /// Channel-level (soft) error, including returned mandatory messages
    #[error("Channel error ({code}): {message}")]
    Channel { code: u16, message: String },

    #[error("Channel limit reached: {0}")]
    ChannelLimit(String),

    #[error("Transport timeout: {0}")]
    Timeout(String),
}

impl TransportError {
    pub fn channel(code: u16, message: impl Into<String>) -> Self {
        TransportError::Channel {
            code,
            message: message.into(),
        }
    }

    pub fn reply_code(&self) -> Option<u16> {
        match self {
            TransportError::Connection { code, .. } | TransportError::Channel { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }

    /// Declare refused because the queue exists with different arguments
    pub fn is_inequivalent_arguments(&self) -> bool {
        match self {
            TransportError::Channel { code, message } => {
                *code == reply_code::PRECONDITION_FAILED
                    && message.to_ascii_lowercase().contains(INEQUIVALENT_ARG_MARKER)
            }
            _ => false,
        }
    }
}

/// Message properties carried on publish and delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// delivery-mode 2
    pub persistent: bool,
    pub priority: Option<u8>,
    /// Per-message TTL in ms
    pub expiration_ms: Option<u64>,
}

/// One basic.publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Ask the server to return the message when nothing is bound to the routing key
    pub mandatory: bool,
    /// Wait for the publisher confirmation before returning
    pub confirm: bool,
}

/// One delivered message, not yet settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Entry point of a transport: opens connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError>;

    /// Human-readable target (credentials stripped) for logs
    fn describe(&self) -> String;
}

/// A network session
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Close the session; closing an already-closed session is a no-op
    async fn close(&self) -> Result<(), TransportError>;
}

/// A sub-session multiplexed on a connection
///
/// Soft errors close the channel on the server side; afterwards every
/// operation fails with `ConnectionLost` and `is_open()` reports false.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueStats, TransportError>;

    /// Declare with passive=true: only checks existence and reads counters
    async fn queue_declare_passive(&self, queue_name: &str) -> Result<QueueStats, TransportError>;

    async fn queue_purge(&self, queue_name: &str) -> Result<u32, TransportError>;

    async fn queue_delete(
        &self,
        queue_name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, TransportError>;

    /// Publish and, when `publish.confirm` is set, wait for the confirmation.
    /// A mandatory message returned unroutable fails with reply code 312.
    async fn basic_publish(&self, publish: Publish) -> Result<(), TransportError>;

    /// Set QoS and register a consumer on `queue_name`
    async fn basic_consume(
        &self,
        queue_name: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, TransportError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Deliveries of one consumer registration
#[async_trait]
pub trait DeliveryStream: Send {
    fn consumer_tag(&self) -> &str;

    /// Wait up to `timeout` for the next delivery. `Ok(None)` means nothing
    /// arrived in time; a zero timeout only checks what is already buffered.
    async fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError>;

    async fn cancel(&mut self) -> Result<(), TransportError>;
}

/// Mock channel for unit tests
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted channel recording every call
    #[derive(Default)]
    pub struct MockChannel {
        pub declared: Mutex<Vec<QueueSpec>>,
        pub published: Mutex<Vec<Publish>>,
        pub acks: Mutex<Vec<u64>>,
        pub rejects: Mutex<Vec<(u64, bool)>>,
        pub deliveries: Arc<Mutex<VecDeque<Result<Delivery, TransportError>>>>,
        pub consumes: AtomicUsize,
        pub cancels: Arc<AtomicUsize>,
        pub declare_error: Mutex<Option<TransportError>>,
        pub consume_error: Mutex<Option<TransportError>>,
        pub ack_error: Mutex<Option<TransportError>>,
        pub closed: AtomicBool,
    }

    impl MockChannel {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn fail_declares_with(&self, error: TransportError) {
            *self.declare_error.lock().unwrap() = Some(error);
        }

        pub fn fail_consume_with(&self, error: TransportError) {
            *self.consume_error.lock().unwrap() = Some(error);
        }

        pub fn fail_acks_with(&self, error: Option<TransportError>) {
            *self.ack_error.lock().unwrap() = error;
        }

        pub fn push_delivery(&self, delivery: Result<Delivery, TransportError>) {
            self.deliveries.lock().unwrap().push_back(delivery);
        }

        pub fn ack_count(&self) -> usize {
            self.acks.lock().unwrap().len()
        }

        pub fn cancel_count(&self) -> usize {
            self.cancels.load(Ordering::SeqCst)
        }
    }

    pub fn delivery(tag: u64, body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: tag,
            exchange: String::new(),
            routing_key: "mock".to_string(),
            redelivered: false,
            body: body.to_vec(),
            properties: MessageProperties::default(),
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn id(&self) -> u16 {
            1
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueStats, TransportError> {
            if let Some(error) = self.declare_error.lock().unwrap().clone() {
                return Err(error);
            }
            self.declared.lock().unwrap().push(spec.clone());
            Ok(QueueStats::default())
        }

        async fn queue_declare_passive(
            &self,
            _queue_name: &str,
        ) -> Result<QueueStats, TransportError> {
            Ok(QueueStats::default())
        }

        async fn queue_purge(&self, _queue_name: &str) -> Result<u32, TransportError> {
            Ok(0)
        }

        async fn queue_delete(
            &self,
            _queue_name: &str,
            _if_unused: bool,
            _if_empty: bool,
        ) -> Result<u32, TransportError> {
            Ok(0)
        }

        async fn basic_publish(&self, publish: Publish) -> Result<(), TransportError> {
            self.published.lock().unwrap().push(publish);
            Ok(())
        }

        async fn basic_consume(
            &self,
            _queue_name: &str,
            _prefetch: u16,
        ) -> Result<Box<dyn DeliveryStream>, TransportError> {
            if let Some(error) = self.consume_error.lock().unwrap().clone() {
                return Err(error);
            }
            let n = self.consumes.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockDeliveryStream {
                tag: format!("mock-consumer-{}", n),
                deliveries: self.deliveries.clone(),
                cancels: self.cancels.clone(),
            }))
        }

        async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
            if let Some(error) = self.ack_error.lock().unwrap().clone() {
                return Err(error);
            }
            self.acks.lock().unwrap().push(delivery_tag);
            Ok(())
        }

        async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
            if let Some(error) = self.ack_error.lock().unwrap().clone() {
                return Err(error);
            }
            self.rejects.lock().unwrap().push((delivery_tag, requeue));
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct MockDeliveryStream {
        tag: String,
        deliveries: Arc<Mutex<VecDeque<Result<Delivery, TransportError>>>>,
        cancels: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeliveryStream for MockDeliveryStream {
        fn consumer_tag(&self) -> &str {
            &self.tag
        }

        async fn next(&mut self, _timeout: Duration) -> Result<Option<Delivery>, TransportError> {
            match self.deliveries.lock().unwrap().pop_front() {
                Some(Ok(delivery)) => Ok(Some(delivery)),
                Some(Err(error)) => Err(error),
                None => Ok(None),
            }
        }

        async fn cancel(&mut self) -> Result<(), TransportError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
