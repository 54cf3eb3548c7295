// Consumer
// Pulls and decodes deliveries for one queue on a borrowed channel.
// The task holding `&mut Consumer` owns the channel; other tasks settle
// messages through an `Acknowledger`, whose actions the owner applies at
// the start of every pull (acks first, then nacks, in submission order).

mod proxy;
mod reader;

pub use proxy::MessageProxy;
pub use reader::QueueReader;

use crate::application::connection::ChannelLease;
use crate::error::{BrokerError, Result};
use crate::port::{Channel, MessageCodec};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Nack { requeue: bool },
}

impl Settle {
    async fn apply(self, proxy: &MessageProxy) -> Result<bool> {
        match self {
            Settle::Ack => proxy.ack().await,
            Settle::Nack { requeue } => proxy.nack(requeue).await,
        }
    }
}

/// Settle action waiting for the owner task
struct Deferred {
    proxy: MessageProxy,
    settle: Settle,
    done: Option<oneshot::Sender<Result<bool>>>,
}

/// Consumer settings taken from the broker options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub prefetch: u16,
    pub read_timeout: Duration,
    pub blocking_acknowledge: bool,
}

pub struct Consumer {
    reader: QueueReader,
    channel: Arc<dyn Channel>,
    lease: ChannelLease,
    codec: Arc<dyn MessageCodec>,
    settings: ConsumerSettings,
    ack_tx: mpsc::UnboundedSender<Deferred>,
    ack_rx: mpsc::UnboundedReceiver<Deferred>,
    nack_tx: mpsc::UnboundedSender<Deferred>,
    nack_rx: mpsc::UnboundedReceiver<Deferred>,
}

impl Consumer {
    pub fn new(
        lease: ChannelLease,
        queue_name: impl Into<String>,
        codec: Arc<dyn MessageCodec>,
        settings: ConsumerSettings,
    ) -> Self {
        let channel = lease.channel().clone();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (nack_tx, nack_rx) = mpsc::unbounded_channel();
        Self {
            reader: QueueReader::new(channel.clone(), queue_name, settings.prefetch),
            channel,
            lease,
            codec,
            settings,
            ack_tx,
            ack_rx,
            nack_tx,
            nack_rx,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.reader.queue_name()
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Probe the queue once without leaving a consumer registered
    pub async fn check(&mut self) -> Result<()> {
        self.reader.check().await
    }

    /// Apply deferred settle actions, then wait up to the read timeout for
    /// one message. `Ok(None)` means nothing arrived in time, or the delivery
    /// could not be decoded and was dead-lettered.
    pub async fn next(&mut self) -> Result<Option<MessageProxy>> {
        self.drain_deferred().await;

        let delivery = match self.reader.pop(self.settings.read_timeout).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return Ok(None),
            Err(err) => return Err(BrokerError::Connection(err.to_string())),
        };

        match self.codec.decode(&delivery.body) {
            Ok(message) => Ok(Some(MessageProxy::new(
                message,
                &delivery,
                self.channel.clone(),
            ))),
            Err(err) => {
                error!(
                    queue = %self.queue_name(),
                    delivery_tag = delivery.delivery_tag,
                    error = %err,
                    "Undecodable message, rejecting to dead-letter queue"
                );
                if let Err(err) = self.channel.basic_reject(delivery.delivery_tag, false).await {
                    warn!(
                        queue = %self.queue_name(),
                        delivery_tag = delivery.delivery_tag,
                        error = %err,
                        "Failed to reject undecodable message"
                    );
                }
                Ok(None)
            }
        }
    }

    async fn drain_deferred(&mut self) {
        while let Ok(deferred) = self.ack_rx.try_recv() {
            run_deferred(deferred).await;
        }
        while let Ok(deferred) = self.nack_rx.try_recv() {
            run_deferred(deferred).await;
        }
    }

    pub async fn ack(&self, proxy: &MessageProxy) -> Result<bool> {
        proxy.ack().await
    }

    pub async fn nack(&self, proxy: &MessageProxy, requeue: bool) -> Result<bool> {
        proxy.nack(requeue).await
    }

    /// Handle for settling messages from other tasks
    pub fn acknowledger(&self) -> Acknowledger {
        Acknowledger {
            ack_tx: self.ack_tx.clone(),
            nack_tx: self.nack_tx.clone(),
            thread_safe: self.lease.is_thread_safe(),
            blocking_default: self.settings.blocking_acknowledge,
        }
    }

    /// Apply what is still queued, cancel the registration and release the
    /// channel. Errors are logged, never raised.
    pub async fn close(mut self) {
        self.drain_deferred().await;
        if let Err(err) = self.reader.close().await {
            debug!(queue = %self.queue_name(), error = %err, "Ignoring consumer close failure");
        }
        self.lease.release();
    }
}

async fn run_deferred(deferred: Deferred) {
    let result = deferred.settle.apply(&deferred.proxy).await;
    match deferred.done {
        Some(done) => {
            let _ = done.send(result);
        }
        None => {
            if let Err(err) = result {
                warn!(
                    message_id = %deferred.proxy.message_id(),
                    error = %err,
                    "Deferred acknowledgement failed"
                );
            }
        }
    }
}

/// Settles messages of one consumer from any task
#[derive(Clone)]
pub struct Acknowledger {
    ack_tx: mpsc::UnboundedSender<Deferred>,
    nack_tx: mpsc::UnboundedSender<Deferred>,
    thread_safe: bool,
    blocking_default: bool,
}

impl Acknowledger {
    /// `block` defaults to the broker's `blocking_acknowledge`. A blocking
    /// call returns the settle result once applied; a non-blocking call
    /// returns `true` as soon as the action is queued.
    pub async fn ack(
        &self,
        proxy: &MessageProxy,
        block: Option<bool>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.settle(proxy, Settle::Ack, block, timeout).await
    }

    pub async fn nack(
        &self,
        proxy: &MessageProxy,
        requeue: bool,
        block: Option<bool>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.settle(proxy, Settle::Nack { requeue }, block, timeout)
            .await
    }

    async fn settle(
        &self,
        proxy: &MessageProxy,
        settle: Settle,
        block: Option<bool>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let block = block.unwrap_or(self.blocking_default);
        if self.thread_safe && block {
            return settle.apply(proxy).await;
        }

        let queue = match settle {
            Settle::Ack => &self.ack_tx,
            Settle::Nack { .. } => &self.nack_tx,
        };
        let (done, waiter) = if block {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        queue
            .send(Deferred {
                proxy: proxy.clone(),
                settle,
                done,
            })
            .map_err(|_| consumer_closed())?;

        let waiter = match waiter {
            Some(waiter) => waiter,
            None => return Ok(true),
        };
        let outcome = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, waiter).await.map_err(|_| {
                BrokerError::Timeout(format!(
                    "acknowledgement of {} not applied within {}ms",
                    proxy.message_id(),
                    timeout.as_millis()
                ))
            })?,
            None => waiter.await,
        };
        outcome.map_err(|_| consumer_closed())?
    }
}

fn consumer_closed() -> BrokerError {
    BrokerError::InvalidState("consumer is closed".to_string())
}
