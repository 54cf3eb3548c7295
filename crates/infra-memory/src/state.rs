// In-memory broker state
// One lock guards queues, channels and consumers. Expiry is lazy and
// head-of-queue only: every access sweeps expired heads into their
// dead-letter targets.

use conveyor_core::domain::{Overflow, QueueSpec, QueueStats};
use conveyor_core::port::{reply_code, Delivery, MessageProperties, Publish, TransportError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Connect,
    Declare,
    Publish,
    Consume,
    Ack,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ChannelKey {
    pub connection: u64,
    pub channel: u16,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    pub priority: u8,
    pub expires_at: Option<Instant>,
}

struct MemoryQueue {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
}

impl MemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            messages: VecDeque::new(),
        }
    }

    /// Messages are ordered by priority (highest first) when the queue has
    /// a max priority, FIFO within one priority
    fn push(&mut self, message: StoredMessage) {
        if self.spec.arguments.max_priority.is_none() {
            self.messages.push_back(message);
            return;
        }
        let index = self
            .messages
            .iter()
            .position(|m| m.priority < message.priority)
            .unwrap_or(self.messages.len());
        self.messages.insert(index, message);
    }

    /// Requeued messages go back to the front of their priority band
    fn push_front(&mut self, message: StoredMessage) {
        let index = self
            .messages
            .iter()
            .position(|m| m.priority <= message.priority)
            .unwrap_or(self.messages.len());
        self.messages.insert(index, message);
    }

    fn stats(&self, consumer_count: usize) -> QueueStats {
        QueueStats {
            message_count: self.messages.len() as u32,
            consumer_count: consumer_count as u32,
        }
    }
}

struct ChannelState {
    open: bool,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

struct ConnectionState {
    open: bool,
    next_channel_id: u16,
}

struct ConsumerState {
    channel: ChannelKey,
    queue: String,
    prefetch: u16,
}

pub(crate) struct BrokerState {
    pub online: bool,
    pub channel_max: u16,
    pub publish_stalled: bool,
    queues: HashMap<String, MemoryQueue>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<ChannelKey, ChannelState>,
    consumers: HashMap<String, ConsumerState>,
    faults: HashMap<FaultOp, VecDeque<TransportError>>,
    declare_counts: HashMap<String, usize>,
    next_connection_id: u64,
    next_consumer_id: u64,
    pub connects: usize,
    pub published: usize,
    pub acked: usize,
}

impl BrokerState {
    pub fn new(channel_max: u16) -> Self {
        Self {
            online: true,
            channel_max,
            publish_stalled: false,
            queues: HashMap::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            consumers: HashMap::new(),
            faults: HashMap::new(),
            declare_counts: HashMap::new(),
            next_connection_id: 0,
            next_consumer_id: 0,
            connects: 0,
            published: 0,
            acked: 0,
        }
    }

    // ---------------------------------------------------------------
    // Faults
    // ---------------------------------------------------------------

    pub fn push_fault(&mut self, op: FaultOp, error: TransportError) {
        self.faults.entry(op).or_default().push_back(error);
    }

    /// Take a scripted failure for `op`, applying its side effects the way a
    /// server would: soft errors close the channel, hard errors the connection
    fn take_fault(&mut self, op: FaultOp, key: Option<ChannelKey>) -> Result<(), TransportError> {
        let error = match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => error,
            None => return Ok(()),
        };
        if let Some(key) = key {
            match &error {
                TransportError::Channel { code, .. } if *code != reply_code::NO_ROUTE => {
                    self.close_channel(key)
                }
                TransportError::Connection { .. } | TransportError::ConnectionLost(_) => {
                    self.close_connection(key.connection)
                }
                _ => {}
            }
        }
        Err(error)
    }

    // ---------------------------------------------------------------
    // Connections and channels
    // ---------------------------------------------------------------

    pub fn open_connection(&mut self) -> Result<u64, TransportError> {
        self.take_fault(FaultOp::Connect, None)?;
        if !self.online {
            return Err(TransportError::ConnectionLost(
                "connection refused: broker offline".to_string(),
            ));
        }
        self.next_connection_id += 1;
        self.connects += 1;
        self.connections.insert(
            self.next_connection_id,
            ConnectionState {
                open: true,
                next_channel_id: 0,
            },
        );
        Ok(self.next_connection_id)
    }

    pub fn is_connection_open(&self, connection: u64) -> bool {
        self.online
            && self
                .connections
                .get(&connection)
                .is_some_and(|state| state.open)
    }

    pub fn open_connections(&self) -> usize {
        self.connections.values().filter(|state| state.open).count()
    }

    pub fn open_channel(&mut self, connection: u64) -> Result<ChannelKey, TransportError> {
        if !self.is_connection_open(connection) {
            return Err(TransportError::ConnectionLost(
                "connection already closed".to_string(),
            ));
        }
        let open_channels = self
            .channels
            .iter()
            .filter(|(key, state)| key.connection == connection && state.open)
            .count();
        if open_channels >= usize::from(self.channel_max) {
            return Err(TransportError::ChannelLimit(format!(
                "channel_max {} reached",
                self.channel_max
            )));
        }

        let state = match self.connections.get_mut(&connection) {
            Some(state) => state,
            None => {
                return Err(TransportError::ConnectionLost(
                    "connection already closed".to_string(),
                ))
            }
        };
        state.next_channel_id = state.next_channel_id.wrapping_add(1).max(1);
        let key = ChannelKey {
            connection,
            channel: state.next_channel_id,
        };
        self.channels.insert(
            key,
            ChannelState {
                open: true,
                next_delivery_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(key)
    }

    pub fn is_channel_open(&self, key: ChannelKey) -> bool {
        self.is_connection_open(key.connection)
            && self.channels.get(&key).is_some_and(|state| state.open)
    }

    fn ensure_open(&self, key: ChannelKey) -> Result<(), TransportError> {
        if self.is_channel_open(key) {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost(
                "channel already closed".to_string(),
            ))
        }
    }

    /// Close a channel: its consumers go away and unacked messages return
    /// to their queues, flagged redelivered
    pub fn close_channel(&mut self, key: ChannelKey) {
        self.consumers.retain(|_, consumer| consumer.channel != key);

        let unacked = match self.channels.get_mut(&key) {
            Some(state) if state.open => {
                state.open = false;
                std::mem::take(&mut state.unacked)
            }
            _ => return,
        };
        for (_, (queue_name, mut message)) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.push_front(message);
            }
        }
        debug!(connection = key.connection, channel_id = key.channel, "Channel closed");
    }

    pub fn close_connection(&mut self, connection: u64) {
        let keys: Vec<ChannelKey> = self
            .channels
            .keys()
            .filter(|key| key.connection == connection)
            .copied()
            .collect();
        for key in keys {
            self.close_channel(key);
        }
        if let Some(state) = self.connections.get_mut(&connection) {
            state.open = false;
        }
    }

    pub fn close_all_connections(&mut self) {
        let ids: Vec<u64> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id);
        }
    }

    /// Fail an operation with a soft error: the channel closes
    fn channel_error(&mut self, key: ChannelKey, code: u16, message: String) -> TransportError {
        self.close_channel(key);
        TransportError::Channel { code, message }
    }

    // ---------------------------------------------------------------
    // Queues
    // ---------------------------------------------------------------

    fn consumer_count(&self, queue_name: &str) -> usize {
        self.consumers
            .values()
            .filter(|consumer| consumer.queue == queue_name)
            .count()
    }

    fn not_found(&mut self, key: ChannelKey, queue_name: &str) -> TransportError {
        self.channel_error(
            key,
            reply_code::NOT_FOUND,
            format!("NOT_FOUND - no queue '{}' in vhost '/'", queue_name),
        )
    }

    pub fn declare(&mut self, key: ChannelKey, spec: &QueueSpec) -> Result<QueueStats, TransportError> {
        self.ensure_open(key)?;
        self.take_fault(FaultOp::Declare, Some(key))?;
        *self.declare_counts.entry(spec.name.clone()).or_default() += 1;

        let conflict = match self.queues.get(&spec.name) {
            Some(existing) => inequivalent_argument(&existing.spec, spec),
            None => {
                self.queues
                    .insert(spec.name.clone(), MemoryQueue::new(spec.clone()));
                None
            }
        };
        if let Some(argument) = conflict {
            return Err(self.channel_error(
                key,
                reply_code::PRECONDITION_FAILED,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg '{}' for queue '{}' in vhost '/'",
                    argument, spec.name
                ),
            ));
        }

        self.sweep();
        let consumers = self.consumer_count(&spec.name);
        Ok(self
            .queues
            .get(&spec.name)
            .map(|queue| queue.stats(consumers))
            .unwrap_or_default())
    }

    pub fn declare_passive(&mut self, key: ChannelKey, queue_name: &str) -> Result<QueueStats, TransportError> {
        self.ensure_open(key)?;
        self.sweep();
        let consumers = self.consumer_count(queue_name);
        match self.queues.get(queue_name) {
            Some(queue) => Ok(queue.stats(consumers)),
            None => Err(self.not_found(key, queue_name)),
        }
    }

    pub fn purge(&mut self, key: ChannelKey, queue_name: &str) -> Result<u32, TransportError> {
        self.ensure_open(key)?;
        self.sweep();
        match self.queues.get_mut(queue_name) {
            Some(queue) => {
                let purged = queue.messages.len() as u32;
                queue.messages.clear();
                Ok(purged)
            }
            None => Err(self.not_found(key, queue_name)),
        }
    }

    pub fn delete(
        &mut self,
        key: ChannelKey,
        queue_name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, TransportError> {
        self.ensure_open(key)?;
        self.take_fault(FaultOp::Delete, Some(key))?;
        self.sweep();
        let consumers = self.consumer_count(queue_name);
        let message_count = match self.queues.get(queue_name) {
            Some(queue) => queue.messages.len(),
            None => return Ok(0),
        };

        if if_unused && consumers > 0 {
            return Err(self.channel_error(
                key,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - queue '{}' in use", queue_name),
            ));
        }
        if if_empty && message_count > 0 {
            return Err(self.channel_error(
                key,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - queue '{}' not empty", queue_name),
            ));
        }

        self.remove_queue(queue_name);
        Ok(message_count as u32)
    }

    /// Drop a queue with its consumers, as an operator would
    pub fn remove_queue(&mut self, queue_name: &str) -> bool {
        self.consumers.retain(|_, consumer| consumer.queue != queue_name);
        self.queues.remove(queue_name).is_some()
    }

    // ---------------------------------------------------------------
    // Publish
    // ---------------------------------------------------------------

    pub fn publish(&mut self, key: ChannelKey, publish: Publish) -> Result<(), TransportError> {
        self.ensure_open(key)?;
        self.take_fault(FaultOp::Publish, Some(key))?;
        self.sweep();

        if !self.queues.contains_key(&publish.routing_key) {
            if publish.mandatory {
                // basic.return; the channel stays open
                return Err(TransportError::channel(reply_code::NO_ROUTE, "NO_ROUTE"));
            }
            debug!(routing_key = %publish.routing_key, "Dropping unroutable message");
            return Ok(());
        }

        let now = Instant::now();
        let message = StoredMessage {
            exchange: publish.exchange,
            routing_key: publish.routing_key.clone(),
            body: publish.body,
            priority: publish.properties.priority.unwrap_or(0),
            expires_at: None,
            properties: publish.properties,
            redelivered: false,
        };
        self.published += 1;
        self.route(&publish.routing_key, message, now)
    }

    /// Store `message` in `queue_name`, applying the queue's TTL, priority
    /// cap and length limit
    fn route(&mut self, queue_name: &str, mut message: StoredMessage, now: Instant) -> Result<(), TransportError> {
        let (arguments, length) = match self.queues.get(queue_name) {
            Some(queue) => (queue.spec.arguments.clone(), queue.messages.len()),
            None => return Ok(()),
        };

        let ttl = match (message.properties.expiration_ms, arguments.message_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        message.expires_at = ttl.and_then(|ttl| now.checked_add(Duration::from_millis(ttl)));
        message.priority = match arguments.max_priority {
            Some(max) => message.priority.min(max),
            None => 0,
        };

        if let Some(max_length) = arguments.max_length {
            if length as u64 >= max_length {
                match arguments.overflow.unwrap_or(Overflow::DropHead) {
                    Overflow::DropHead => {
                        let head = self
                            .queues
                            .get_mut(queue_name)
                            .and_then(|queue| queue.messages.pop_front());
                        if let Some(head) = head {
                            self.dead_letter(queue_name, head, now);
                        }
                    }
                    Overflow::RejectPublish => return Err(nacked(queue_name)),
                    Overflow::RejectPublishDlx => {
                        self.dead_letter(queue_name, message, now);
                        return Err(nacked(queue_name));
                    }
                }
            }
        }

        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.push(message);
        }
        Ok(())
    }

    /// Forward a message through its queue's dead-letter settings, if any
    fn dead_letter(&mut self, queue_name: &str, mut message: StoredMessage, now: Instant) {
        let arguments = match self.queues.get(queue_name) {
            Some(queue) => queue.spec.arguments.clone(),
            None => return,
        };
        if arguments.dead_letter_exchange.is_none() {
            debug!(queue = %queue_name, "Discarding message without dead-letter target");
            return;
        }

        let target = arguments
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        message.properties.expiration_ms = None;
        message.redelivered = false;
        message.routing_key = target.clone();
        debug!(from = %queue_name, to = %target, "Dead-lettering message");
        // A full dead-letter target drops the message
        let _ = self.route(&target, message, now);
    }

    /// Expire messages at queue heads. Expired messages may land at the head
    /// of other queues, so sweep until nothing moves.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        loop {
            let mut expired = Vec::new();
            for (name, queue) in self.queues.iter_mut() {
                while queue
                    .messages
                    .front()
                    .and_then(|m| m.expires_at)
                    .is_some_and(|at| at <= now)
                {
                    if let Some(message) = queue.messages.pop_front() {
                        expired.push((name.clone(), message));
                    }
                }
            }
            if expired.is_empty() {
                return;
            }
            for (queue_name, message) in expired {
                self.dead_letter(&queue_name, message, now);
            }
        }
    }

    /// Earliest pending head expiry across all queues
    pub fn next_expiry(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(|queue| queue.messages.front().and_then(|m| m.expires_at))
            .min()
    }

    // ---------------------------------------------------------------
    // Consume
    // ---------------------------------------------------------------

    pub fn consume(&mut self, key: ChannelKey, queue_name: &str, prefetch: u16) -> Result<String, TransportError> {
        self.ensure_open(key)?;
        self.take_fault(FaultOp::Consume, Some(key))?;
        if !self.queues.contains_key(queue_name) {
            return Err(self.not_found(key, queue_name));
        }

        self.next_consumer_id += 1;
        let tag = format!("ctag-{}.{}", key.channel, self.next_consumer_id);
        self.consumers.insert(
            tag.clone(),
            ConsumerState {
                channel: key,
                queue: queue_name.to_string(),
                prefetch,
            },
        );
        Ok(tag)
    }

    pub fn cancel(&mut self, consumer_tag: &str) {
        self.consumers.remove(consumer_tag);
    }

    /// Hand the next message of the consumer's queue to its channel, unless
    /// the channel already holds `prefetch` unacked messages
    pub fn take_delivery(&mut self, consumer_tag: &str) -> Result<Option<Delivery>, TransportError> {
        let (key, queue_name, prefetch) = match self.consumers.get(consumer_tag) {
            Some(consumer) => (consumer.channel, consumer.queue.clone(), consumer.prefetch),
            None => {
                return Err(TransportError::ConnectionLost(format!(
                    "consumer {} is no longer registered",
                    consumer_tag
                )))
            }
        };
        self.ensure_open(key)?;
        self.sweep();

        let in_flight = self
            .channels
            .get(&key)
            .map(|state| state.unacked.len())
            .unwrap_or_default();
        if prefetch > 0 && in_flight >= usize::from(prefetch) {
            return Ok(None);
        }

        let message = match self
            .queues
            .get_mut(&queue_name)
            .and_then(|queue| queue.messages.pop_front())
        {
            Some(message) => message,
            None => return Ok(None),
        };
        let channel = match self.channels.get_mut(&key) {
            Some(channel) => channel,
            None => {
                return Err(TransportError::ConnectionLost(
                    "channel already closed".to_string(),
                ))
            }
        };
        channel.next_delivery_tag += 1;
        let delivery_tag = channel.next_delivery_tag;
        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        channel.unacked.insert(delivery_tag, (queue_name, message));
        Ok(Some(delivery))
    }

    fn take_unacked(&mut self, key: ChannelKey, delivery_tag: u64) -> Result<(String, StoredMessage), TransportError> {
        self.ensure_open(key)?;
        self.take_fault(FaultOp::Ack, Some(key))?;
        match self
            .channels
            .get_mut(&key)
            .and_then(|state| state.unacked.remove(&delivery_tag))
        {
            Some(entry) => Ok(entry),
            None => Err(self.channel_error(
                key,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
            )),
        }
    }

    pub fn ack(&mut self, key: ChannelKey, delivery_tag: u64) -> Result<(), TransportError> {
        self.take_unacked(key, delivery_tag)?;
        self.acked += 1;
        Ok(())
    }

    pub fn reject(&mut self, key: ChannelKey, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let (queue_name, mut message) = self.take_unacked(key, delivery_tag)?;
        if requeue {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.push_front(message);
            }
        } else {
            self.dead_letter(&queue_name, message, Instant::now());
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    pub fn queue_len(&self, queue_name: &str) -> Option<usize> {
        self.queues.get(queue_name).map(|queue| queue.messages.len())
    }

    pub fn queue_spec(&self, queue_name: &str) -> Option<QueueSpec> {
        self.queues.get(queue_name).map(|queue| queue.spec.clone())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bodies(&self, queue_name: &str) -> Vec<Vec<u8>> {
        self.queues
            .get(queue_name)
            .map(|queue| queue.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn declare_count(&self, queue_name: &str) -> usize {
        self.declare_counts.get(queue_name).copied().unwrap_or_default()
    }

    pub fn unacked(&self) -> usize {
        self.channels.values().map(|state| state.unacked.len()).sum()
    }
}

fn nacked(queue_name: &str) -> TransportError {
    TransportError::channel(
        reply_code::INTERNAL_ERROR,
        format!("publish nacked: queue '{}' is full", queue_name),
    )
}

/// First setting on which a redeclare differs from the existing queue
fn inequivalent_argument(existing: &QueueSpec, requested: &QueueSpec) -> Option<String> {
    if existing.durable != requested.durable {
        return Some("durable".to_string());
    }
    if existing.auto_delete != requested.auto_delete {
        return Some("auto_delete".to_string());
    }

    let current = existing.arguments.to_table();
    let wanted = requested.arguments.to_table();
    current
        .keys()
        .chain(wanted.keys())
        .find(|name| current.get(*name) != wanted.get(*name))
        .cloned()
}
