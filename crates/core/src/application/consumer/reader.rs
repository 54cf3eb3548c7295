// Queue Reader
// Single-queue puller on one channel. Any failure while consuming cancels
// the registration so the next pop starts a fresh one.

use crate::error::{BrokerError, Result};
use crate::port::{Channel, Delivery, DeliveryStream, TransportError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct QueueReader {
    channel: Arc<dyn Channel>,
    queue_name: String,
    prefetch: u16,
    stream: Option<Box<dyn DeliveryStream>>,
    buffer: VecDeque<Delivery>,
}

impl QueueReader {
    pub fn new(channel: Arc<dyn Channel>, queue_name: impl Into<String>, prefetch: u16) -> Self {
        Self {
            channel,
            queue_name: queue_name.into(),
            prefetch,
            stream: None,
            buffer: VecDeque::new(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn is_consuming(&self) -> bool {
        self.stream.is_some()
    }

    /// Probe the queue: start consuming, take whatever is already buffered,
    /// then cancel. The registration never outlives the probe, and probing
    /// a reader that is already consuming is refused.
    pub async fn check(&mut self) -> Result<()> {
        if self.is_consuming() {
            return Err(BrokerError::InvalidState(format!(
                "already consuming from '{}'",
                self.queue_name
            )));
        }

        let mut stream = self
            .channel
            .basic_consume(&self.queue_name, self.prefetch)
            .await?;
        let drained = stream.next(Duration::ZERO).await;
        let cancelled = stream.cancel().await;

        if let Some(delivery) = drained? {
            self.buffer.push_back(delivery);
        }
        Ok(cancelled?)
    }

    /// Wait up to `timeout` for one delivery
    pub async fn pop(
        &mut self,
        timeout: Duration,
    ) -> std::result::Result<Option<Delivery>, TransportError> {
        if let Some(delivery) = self.buffer.pop_front() {
            return Ok(Some(delivery));
        }

        match self.try_pop(timeout).await {
            Ok(delivery) => Ok(delivery),
            Err(err) => {
                self.stop().await;
                Err(err)
            }
        }
    }

    async fn try_pop(
        &mut self,
        timeout: Duration,
    ) -> std::result::Result<Option<Delivery>, TransportError> {
        if self.stream.is_none() {
            let stream = self
                .channel
                .basic_consume(&self.queue_name, self.prefetch)
                .await?;
            debug!(
                queue = %self.queue_name,
                consumer_tag = %stream.consumer_tag(),
                "Started consuming"
            );
            self.stream = Some(stream);
        }

        match self.stream.as_mut() {
            Some(stream) => stream.next(timeout).await,
            None => Ok(None),
        }
    }

    async fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.cancel().await {
                debug!(queue = %self.queue_name, error = %err, "Ignoring cancel failure");
            }
        }
    }

    /// Cancel the consumer registration, if any
    pub async fn close(&mut self) -> std::result::Result<(), TransportError> {
        match self.stream.take() {
            Some(mut stream) => stream.cancel().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::transport::mocks::{delivery, MockChannel};
    use crate::port::transport::reply_code;

    #[tokio::test]
    async fn test_check_always_cancels() {
        let channel = MockChannel::new();
        let mut reader = QueueReader::new(channel.clone(), "q", 1);

        reader.check().await.unwrap();

        assert_eq!(channel.cancel_count(), 1);
        assert!(!reader.is_consuming());
    }

    #[tokio::test]
    async fn test_check_buffers_drained_delivery() {
        let channel = MockChannel::new();
        channel.push_delivery(Ok(delivery(1, b"{}")));
        let mut reader = QueueReader::new(channel.clone(), "q", 1);

        reader.check().await.unwrap();
        let popped = reader.pop(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(popped.delivery_tag, 1);
        assert_eq!(channel.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_check_reports_missing_queue() {
        let channel = MockChannel::new();
        channel.fail_consume_with(TransportError::channel(reply_code::NOT_FOUND, "no queue 'q'"));
        let mut reader = QueueReader::new(channel, "q", 1);

        let err = reader.check().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_check_refuses_an_active_consumer() {
        let channel = MockChannel::new();
        let mut reader = QueueReader::new(channel.clone(), "q", 1);
        reader.pop(Duration::ZERO).await.unwrap();

        let err = reader.check().await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
        assert!(reader.is_consuming());
        assert_eq!(channel.cancel_count(), 0);
    }

    #[tokio::test]
    async fn test_pop_failure_cancels_and_restarts() {
        let channel = MockChannel::new();
        channel.push_delivery(Err(TransportError::ConnectionLost("reset".into())));
        channel.push_delivery(Ok(delivery(2, b"{}")));
        let mut reader = QueueReader::new(channel.clone(), "q", 1);

        assert!(reader.pop(Duration::ZERO).await.is_err());
        assert!(!reader.is_consuming());
        assert_eq!(channel.cancel_count(), 1);

        let popped = reader.pop(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(popped.delivery_tag, 2);
        assert!(reader.is_consuming());
        assert_eq!(channel.consumes.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pop_on_empty_queue_returns_none() {
        let channel = MockChannel::new();
        let mut reader = QueueReader::new(channel, "q", 1);

        assert!(reader.pop(Duration::ZERO).await.unwrap().is_none());
        assert!(reader.is_consuming());
        reader.close().await.unwrap();
        assert!(!reader.is_consuming());
    }
}
