// Message Proxy
// Handle over one delivered message, settled at most once on the wire

use crate::application::connection::lock;
use crate::domain::{Message, MessageId};
use crate::error::{BrokerError, Result};
use crate::port::{Channel, Delivery};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acked,
    Rejected,
}

#[derive(Default)]
struct AckState {
    outcome: Option<Outcome>,
    last_error: Option<BrokerError>,
}

struct ProxyInner {
    message: Message,
    delivery_tag: u64,
    redelivered: bool,
    channel: Arc<dyn Channel>,
    state: Mutex<AckState>,
    // Serialises settle calls so a concurrent ack and nack cannot both hit the wire
    settle_lock: tokio::sync::Mutex<()>,
}

/// A delivered message as handed to the execution runtime.
///
/// Clones share the acknowledgement state. `ack` and `nack` are idempotent:
/// once settled, further calls return whether the requested outcome matches
/// the recorded one and never touch the channel again.
///
/// `ack` and `nack` settle on the delivering channel immediately, so call
/// them only from the task that owns the consumer. Other tasks go through
/// `Consumer::acknowledger`, which defers to the owner when the channel is
/// not thread-safe.
#[derive(Clone)]
pub struct MessageProxy {
    inner: Arc<ProxyInner>,
}

impl MessageProxy {
    pub fn new(message: Message, delivery: &Delivery, channel: Arc<dyn Channel>) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                message,
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                channel,
                state: Mutex::new(AckState::default()),
                settle_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    pub fn message_id(&self) -> &MessageId {
        &self.inner.message.message_id
    }

    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    /// Whether the message reached a terminal state (acked or rejected)
    pub fn acknowledged(&self) -> bool {
        lock(&self.inner.state).outcome.is_some()
    }

    pub fn last_acknowledge_error(&self) -> Option<BrokerError> {
        lock(&self.inner.state).last_error.clone()
    }

    pub async fn ack(&self) -> Result<bool> {
        self.settle(Outcome::Acked, false).await
    }

    /// Reject; without `requeue` the message is dead-lettered
    pub async fn nack(&self, requeue: bool) -> Result<bool> {
        self.settle(Outcome::Rejected, requeue).await
    }

    async fn settle(&self, requested: Outcome, requeue: bool) -> Result<bool> {
        let _guard = self.inner.settle_lock.lock().await;

        let settled = lock(&self.inner.state).outcome;
        if let Some(outcome) = settled {
            return Ok(outcome == requested);
        }

        let tag = self.inner.delivery_tag;
        let result = match requested {
            Outcome::Acked => self.inner.channel.basic_ack(tag).await,
            Outcome::Rejected => self.inner.channel.basic_reject(tag, requeue).await,
        };

        let mut state = lock(&self.inner.state);
        match result {
            Ok(()) => {
                state.outcome = Some(requested);
                state.last_error = None;
                Ok(true)
            }
            Err(err) => {
                let err = BrokerError::from(err);
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl fmt::Debug for MessageProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProxy")
            .field("message_id", self.message_id())
            .field("delivery_tag", &self.inner.delivery_tag)
            .field("acknowledged", &self.acknowledged())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::transport::mocks::{delivery, MockChannel};
    use crate::port::TransportError;

    fn proxy(channel: &Arc<MockChannel>, tag: u64) -> MessageProxy {
        let message = Message::new("m-1", "q", "actor", 0);
        MessageProxy::new(message, &delivery(tag, b"{}"), channel.clone())
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let channel = MockChannel::new();
        let proxy = proxy(&channel, 7);

        assert!(proxy.ack().await.unwrap());
        assert!(proxy.ack().await.unwrap());
        assert!(!proxy.nack(false).await.unwrap());

        assert!(proxy.acknowledged());
        assert_eq!(*channel.acks.lock().unwrap(), vec![7]);
        assert!(channel.rejects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nack_then_ack_reports_mismatch() {
        let channel = MockChannel::new();
        let proxy = proxy(&channel, 3);

        assert!(proxy.nack(true).await.unwrap());
        assert!(!proxy.clone().ack().await.unwrap());
        assert_eq!(*channel.rejects.lock().unwrap(), vec![(3, true)]);
        assert_eq!(channel.ack_count(), 0);
    }

    #[tokio::test]
    async fn test_ack_failure_is_recorded_and_raised() {
        let channel = MockChannel::new();
        channel.fail_acks_with(Some(TransportError::ConnectionLost("gone".into())));
        let proxy = proxy(&channel, 1);

        let err = proxy.ack().await.unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
        assert!(!proxy.acknowledged());
        assert_eq!(proxy.last_acknowledge_error(), Some(err));

        channel.fail_acks_with(None);
        assert!(proxy.ack().await.unwrap());
        assert!(proxy.last_acknowledge_error().is_none());
    }
}
