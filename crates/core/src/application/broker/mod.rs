// Broker
// Queue lifecycle (declare/ensure), enqueue with delay and no-route
// recovery, and consumer binding over an injected connection holder.

mod options;
mod registry;

pub use options::{BrokerOptions, JoinOptions};
pub use registry::QueueRegistry;

use crate::application::connection::{lock, ConnectionHolder, HolderOptions, HolderStatus};
use crate::application::consumer::{Consumer, ConsumerSettings};
use crate::application::retry::{log_recoverable_error, retry_over_time, RetryPolicy};
use crate::application::topology::{DefaultTopology, Topology, TopologyConfig};
use crate::domain::{ActorDescriptor, DomainError, Message, QueueName};
use crate::error::{BrokerError, Result};
use crate::port::id_provider::UuidProvider;
use crate::port::time_provider::SystemTimeProvider;
use crate::port::{
    BrokerMiddleware, Channel, IdProvider, JsonCodec, MessageCodec, MessageProperties, Publish,
    TimeProvider, Transport,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type ConsumeStartedCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Message counts of the queue triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMessageCounts {
    pub canonical: u32,
    pub delayed: u32,
    pub dead_letter: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    Canonical,
    Delay,
    DeadLetter,
}

pub struct BrokerBuilder {
    holder: Option<Arc<dyn ConnectionHolder>>,
    transport: Option<(Arc<dyn Transport>, HolderOptions)>,
    topology: Option<Arc<dyn Topology>>,
    codec: Arc<dyn MessageCodec>,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
    middleware: Vec<Arc<dyn BrokerMiddleware>>,
    options: BrokerOptions,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            holder: None,
            transport: None,
            topology: None,
            codec: Arc::new(JsonCodec),
            time_provider: Arc::new(SystemTimeProvider),
            id_provider: Arc::new(UuidProvider),
            middleware: Vec::new(),
            options: BrokerOptions::default(),
        }
    }
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing holder; takes precedence over `transport`
    pub fn holder(mut self, holder: Arc<dyn ConnectionHolder>) -> Self {
        self.holder = Some(holder);
        self
    }

    /// Build a holder of the configured strategy over `transport`
    pub fn transport(mut self, transport: Arc<dyn Transport>, holder_options: HolderOptions) -> Self {
        self.transport = Some((transport, holder_options));
        self
    }

    pub fn topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn id_provider(mut self, id_provider: Arc<dyn IdProvider>) -> Self {
        self.id_provider = id_provider;
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn BrokerMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn options(mut self, options: BrokerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<Broker> {
        self.options.validate()?;

        let holder = match (self.holder, self.transport) {
            (Some(holder), _) => holder,
            (None, Some((transport, holder_options))) => holder_options.build(transport),
            (None, None) => {
                return Err(BrokerError::Configuration(
                    "a connection holder or a transport is required".to_string(),
                ))
            }
        };
        let topology = self
            .topology
            .unwrap_or_else(|| Arc::new(DefaultTopology::new(TopologyConfig::default())));

        Ok(Broker {
            holder,
            topology,
            codec: self.codec,
            time_provider: self.time_provider,
            id_provider: self.id_provider,
            options: self.options,
            registry: AsyncMutex::new(QueueRegistry::default()),
            actors: Mutex::new(BTreeMap::new()),
            middleware: Mutex::new(self.middleware),
            consume_started: Mutex::new(Vec::new()),
            close_callbacks: Mutex::new(Vec::new()),
        })
    }
}

/// Durable task-queue broker.
///
/// Per queue: unknown -> pending (`declare_queue`) -> ensured (all three
/// physical queues declared on the server). Registry transitions are
/// serialised by one lock per broker.
pub struct Broker {
    holder: Arc<dyn ConnectionHolder>,
    topology: Arc<dyn Topology>,
    codec: Arc<dyn MessageCodec>,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
    options: BrokerOptions,
    registry: AsyncMutex<QueueRegistry>,
    actors: Mutex<BTreeMap<String, ActorDescriptor>>,
    middleware: Mutex<Vec<Arc<dyn BrokerMiddleware>>>,
    consume_started: Mutex<Vec<ConsumeStartedCallback>>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn holder_status(&self) -> HolderStatus {
        self.holder.status()
    }

    // ---------------------------------------------------------------
    // Hooks
    // ---------------------------------------------------------------

    pub fn add_middleware(&self, middleware: Arc<dyn BrokerMiddleware>) {
        lock(&self.middleware).push(middleware);
    }

    pub fn on_consume_started(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.consume_started).push(Arc::new(callback));
    }

    pub fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.close_callbacks).push(Arc::new(callback));
    }

    fn emit(&self, notify: impl Fn(&dyn BrokerMiddleware)) {
        let middleware = lock(&self.middleware).clone();
        for m in &middleware {
            notify(m.as_ref());
        }
    }

    // ---------------------------------------------------------------
    // Actors
    // ---------------------------------------------------------------

    /// Register an actor and declare its queue (without touching the server)
    pub async fn declare_actor(&self, mut actor: ActorDescriptor) -> Result<()> {
        if actor.queue_name == crate::application::constants::DEFAULT_QUEUE_NAME {
            actor.queue_name = self.options.default_queue_name.clone();
        }

        self.emit(|m| m.before_declare_actor(&actor));
        self.declare_queue(&actor.queue_name, false).await?;
        lock(&self.actors).insert(actor.actor_name.clone(), actor.clone());
        self.emit(|m| m.after_declare_actor(&actor));
        Ok(())
    }

    pub fn get_actor(&self, actor_name: &str) -> Result<ActorDescriptor> {
        lock(&self.actors)
            .get(actor_name)
            .cloned()
            .ok_or_else(|| DomainError::ActorNotFound(actor_name.to_string()).into())
    }

    pub fn actor_names(&self) -> Vec<String> {
        lock(&self.actors).keys().cloned().collect()
    }

    /// Build a message for a registered actor, stamped with a fresh id
    pub fn new_message(
        &self,
        actor_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Message> {
        let actor = self.get_actor(actor_name)?;
        Ok(Message::new(
            self.id_provider.generate_id(),
            actor.queue_name,
            actor.actor_name,
            self.time_provider.now_millis(),
        )
        .with_args(args)
        .with_kwargs(kwargs))
    }

    // ---------------------------------------------------------------
    // Queue lifecycle
    // ---------------------------------------------------------------

    /// Declare a queue (unknown -> pending), and with `ensure` make sure its
    /// three physical queues exist on the server (pending -> ensured)
    pub async fn declare_queue(&self, queue_name: &str, ensure: bool) -> Result<()> {
        let mut registry = self.registry.lock().await;
        self.declare_queue_locked(&mut registry, queue_name, ensure)
            .await
    }

    async fn declare_queue_locked(
        &self,
        registry: &mut QueueRegistry,
        queue_name: &str,
        ensure: bool,
    ) -> Result<()> {
        if queue_name.is_empty() {
            return Err(DomainError::InvalidQueueName("queue name is empty".to_string()).into());
        }
        let names = self.topology.names(queue_name);

        if !registry.is_declared(&names.canonical) {
            self.emit(|m| m.before_declare_queue(&names.canonical));
            registry.declare(&names.canonical, &names.delayed);
            self.emit(|m| m.after_declare_queue(&names.canonical));
            self.emit(|m| m.after_declare_delay_queue(&names.delayed));
            debug!(queue = %names.canonical, "Queue declared");
        }

        if ensure {
            self.ensure_locked(registry, &names).await?;
        }
        Ok(())
    }

    async fn ensure_locked(&self, registry: &mut QueueRegistry, names: &QueueName) -> Result<()> {
        if !QueueName::is_canonical(&names.canonical) {
            return Err(DomainError::NotCanonical(names.canonical.clone()).into());
        }

        if registry.is_pending(&names.canonical) {
            registry.mark_pending(&names.delayed);
            registry.mark_pending(&names.dead_letter);
        }

        let steps = [
            (QueueKind::DeadLetter, &names.dead_letter),
            (QueueKind::Delay, &names.delayed),
            (QueueKind::Canonical, &names.canonical),
        ];
        let policy = RetryPolicy::new(self.options.max_declare_attempts);
        let canonical = names.canonical.as_str();

        for (kind, physical) in steps {
            if !registry.is_pending(physical) {
                continue;
            }
            retry_over_time(
                &policy,
                move || self.declare_physical(kind, canonical),
                log_recoverable_error,
            )
            .await?;
            registry.mark_ensured(physical);
        }
        Ok(())
    }

    async fn declare_physical(&self, kind: QueueKind, queue_name: &str) -> Result<()> {
        let lease = self
            .holder
            .acquire_consumer_channel(true, Some(self.options.channel_acquire_timeout()))
            .await?;
        let channel: &dyn Channel = lease.channel().as_ref();

        match kind {
            QueueKind::Canonical => {
                self.topology
                    .declare_canonical_queue(channel, queue_name, true)
                    .await
            }
            QueueKind::Delay => {
                self.topology
                    .declare_delay_queue(channel, queue_name, true)
                    .await
            }
            QueueKind::DeadLetter => {
                self.topology
                    .declare_dead_letter_queue(channel, queue_name, true)
                    .await
            }
        }
    }

    /// Canonical names of every declared queue
    pub async fn get_declared_queues(&self) -> Vec<String> {
        self.registry.lock().await.declared()
    }

    pub async fn get_declared_delay_queues(&self) -> Vec<String> {
        self.registry.lock().await.delay_queues()
    }

    pub async fn get_queue_message_counts(&self, queue_name: &str) -> Result<QueueMessageCounts> {
        let names = self.topology.names(queue_name);
        let lease = self
            .holder
            .acquire_consumer_channel(true, Some(self.options.channel_acquire_timeout()))
            .await?;
        let channel = lease.channel();

        Ok(QueueMessageCounts {
            canonical: channel.queue_declare_passive(&names.canonical).await?.message_count,
            delayed: channel.queue_declare_passive(&names.delayed).await?.message_count,
            dead_letter: channel.queue_declare_passive(&names.dead_letter).await?.message_count,
        })
    }

    /// Purge the three physical queues unless the queue is still pending
    pub async fn flush(&self, queue_name: &str) -> Result<()> {
        let names = self.topology.names(queue_name);
        if self.registry.lock().await.is_pending(&names.canonical) {
            debug!(queue = %names.canonical, "Queue pending, nothing to flush");
            return Ok(());
        }

        let lease = self
            .holder
            .acquire_consumer_channel(true, Some(self.options.channel_acquire_timeout()))
            .await?;
        for name in names.physical() {
            let purged = lease.channel().queue_purge(name).await?;
            debug!(queue = %name, purged = purged, "Queue purged");
        }
        Ok(())
    }

    pub async fn flush_all(&self) -> Result<()> {
        for queue_name in self.get_declared_queues().await {
            self.flush(&queue_name).await?;
        }
        Ok(())
    }

    /// Best-effort delete of the three physical queues. The queue is left
    /// pending so later use recreates it.
    pub async fn delete_queue(&self, queue_name: &str, if_unused: bool, if_empty: bool) -> Result<()> {
        let names = self.topology.names(queue_name);
        let mut registry = self.registry.lock().await;

        for name in names.physical() {
            let lease = self
                .holder
                .acquire_consumer_channel(true, Some(self.options.channel_acquire_timeout()))
                .await?;
            match lease.channel().queue_delete(name, if_unused, if_empty).await {
                Ok(count) => debug!(queue = %name, messages = count, "Queue deleted"),
                Err(err) => match BrokerError::from(err) {
                    BrokerError::NotAllowed(reason) => {
                        warn!(queue = %name, reason = %reason, "Queue delete not allowed, skipping")
                    }
                    err => return Err(err),
                },
            }
        }

        registry.forget(&names.canonical);
        registry.mark_pending(&names.canonical);
        Ok(())
    }

    pub async fn delete_all(&self, include_pending: bool) -> Result<()> {
        let queues = {
            let registry = self.registry.lock().await;
            let mut queues: Vec<String> = registry.declared();
            if include_pending {
                queues.extend(registry.pending());
            }
            queues
        };

        let mut canonical: Vec<String> = queues
            .iter()
            .map(|name| self.topology.names(name).canonical)
            .collect();
        canonical.sort();
        canonical.dedup();

        for queue_name in canonical {
            self.delete_queue(&queue_name, false, false).await?;
        }
        Ok(())
    }

    /// Poll until the canonical and delay queues are observed empty
    /// `min_successes` times in a row
    pub async fn join(&self, queue_name: &str, options: JoinOptions) -> Result<()> {
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let mut successes = 0;

        while successes < options.min_successes {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(BrokerError::QueueJoinTimeout(queue_name.to_string()));
            }

            let counts = self.get_queue_message_counts(queue_name).await?;
            if counts.canonical + counts.delayed == 0 {
                successes += 1;
            } else {
                successes = 0;
            }

            if successes < options.min_successes {
                tokio::time::sleep(options.idle_time).await;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Enqueue
    // ---------------------------------------------------------------

    /// Publish `message`, delayed by `delay` ms when given. Returns the
    /// message as published (retargeted at the delay queue when delayed).
    pub async fn enqueue(&self, message: Message, delay: Option<u64>) -> Result<Message> {
        let names = self.topology.names(&message.queue_name);
        self.declare_queue(&names.canonical, true).await?;

        let message = match delay {
            Some(delay) => {
                if let Some(max_delay) = self.topology.max_delay_time() {
                    if delay > max_delay {
                        return Err(BrokerError::DelayTooLong {
                            delay,
                            max_delay,
                            queue_name: message.queue_name,
                        });
                    }
                }
                let eta = self
                    .time_provider
                    .now_millis()
                    .saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
                message.delayed(names.delayed.clone(), eta)
            }
            None => message,
        };

        debug!(
            message_id = %message.message_id,
            queue = %message.queue_name,
            delay_ms = ?delay,
            "Enqueueing message"
        );
        self.emit(|m| m.before_enqueue(&message, delay));

        let publish = Publish {
            exchange: String::new(),
            routing_key: message.queue_name.clone(),
            body: self.codec.encode(&message)?,
            properties: MessageProperties {
                message_id: Some(message.message_id.clone()),
                content_type: Some(self.codec.content_type().to_string()),
                persistent: true,
                priority: message.options.broker_priority,
                expiration_ms: delay,
            },
            mandatory: true,
            confirm: self.options.confirm_delivery,
        };

        match self.publish(&publish).await {
            Ok(()) => {}
            Err(err) if err.is_no_route() => {
                warn!(
                    queue = %publish.routing_key,
                    error = %err,
                    "No route for message, redeclaring queue and retrying once"
                );
                {
                    let mut registry = self.registry.lock().await;
                    registry.forget(&names.canonical);
                    self.declare_queue_locked(&mut registry, &names.canonical, true)
                        .await?;
                }
                self.publish(&publish).await?;
            }
            Err(err) => return Err(err),
        }

        self.emit(|m| m.after_enqueue(&message, delay));
        Ok(message)
    }

    async fn publish(&self, publish: &Publish) -> Result<()> {
        let policy = RetryPolicy::new(self.options.max_enqueue_attempts);
        retry_over_time(
            &policy,
            move || self.publish_once(publish.clone()),
            log_recoverable_error,
        )
        .await
    }

    async fn publish_once(&self, publish: Publish) -> Result<()> {
        let mut producer = self
            .holder
            .acquire_producer(true, Some(self.options.producer_acquire_timeout()))
            .await?;
        let result = producer
            .publish(publish, self.options.confirm_timeout())
            .await;
        producer.release();
        result
    }

    // ---------------------------------------------------------------
    // Consume
    // ---------------------------------------------------------------

    /// Bind a consumer to `queue_name`. A queue missing on the server is
    /// redeclared before returning.
    pub async fn consume(&self, queue_name: &str, prefetch: u16, timeout: Duration) -> Result<Consumer> {
        let mut consumer = self.open_consumer(queue_name, prefetch, timeout).await?;

        match consumer.check().await {
            Ok(()) => {
                self.registry.lock().await.mark_ensured(queue_name);
            }
            Err(BrokerError::QueueNotFound(reason)) => {
                info!(queue = %queue_name, reason = %reason, "Queue does not exist, declaring it");
                let names = self.topology.names(queue_name);
                {
                    let mut registry = self.registry.lock().await;
                    registry.forget(&names.canonical);
                    registry.mark_pending(&names.canonical);
                    self.declare_queue_locked(&mut registry, &names.canonical, true)
                        .await?;
                }
                if !consumer.is_channel_open() {
                    consumer.close().await;
                    consumer = self.open_consumer(queue_name, prefetch, timeout).await?;
                }
            }
            Err(err) => return Err(err),
        }

        let callbacks = lock(&self.consume_started).clone();
        for callback in &callbacks {
            callback(queue_name);
        }
        info!(queue = %queue_name, prefetch = prefetch, "Consumer started");
        Ok(consumer)
    }

    async fn open_consumer(&self, queue_name: &str, prefetch: u16, timeout: Duration) -> Result<Consumer> {
        let lease = self
            .holder
            .acquire_consumer_channel(true, Some(self.options.channel_acquire_timeout()))
            .await?;
        Ok(Consumer::new(
            lease,
            queue_name,
            self.codec.clone(),
            ConsumerSettings {
                prefetch,
                read_timeout: timeout,
                blocking_acknowledge: self.options.blocking_acknowledge,
            },
        ))
    }

    // ---------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------

    /// Close every connection. Safe to call repeatedly; `on_close`
    /// callbacks run every time, even when closing failed.
    pub async fn close(&self) -> Result<()> {
        let result = self.holder.close().await;
        if let Err(err) = &result {
            warn!(error = %err, "Failed to close connection holder");
        }

        let callbacks = lock(&self.close_callbacks).clone();
        for callback in &callbacks {
            callback();
        }
        info!("Broker closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_without_holder_is_configuration_error() {
        let err = Broker::builder().build().err().unwrap();
        assert!(matches!(err, BrokerError::Configuration(_)));
    }

    #[test]
    fn test_build_rejects_zero_confirm_timeout() {
        let options = BrokerOptions {
            confirm_timeout_ms: 0,
            ..Default::default()
        };
        let err = Broker::builder().options(options).build().err().unwrap();
        assert!(matches!(err, BrokerError::Configuration(_)));
    }
}
