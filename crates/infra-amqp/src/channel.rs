// AMQP channel and consumer stream

use crate::error::{classify, confirmation_outcome};
use async_trait::async_trait;
use conveyor_core::domain::{ArgumentValue, QueueSpec, QueueStats};
use conveyor_core::port::{
    Channel, Delivery, DeliveryStream, MessageProperties, Publish, TransportError,
};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, QueueDeclareOptions, QueueDeleteOptions,
    QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use std::time::Duration;
use tracing::debug;

const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub(crate) struct AmqpChannel {
    channel: lapin::Channel,
}

impl AmqpChannel {
    pub fn new(channel: lapin::Channel) -> Self {
        Self { channel }
    }

    async fn declare(&self, spec: &QueueSpec, passive: bool) -> Result<QueueStats, TransportError> {
        let options = QueueDeclareOptions {
            passive,
            durable: spec.durable,
            exclusive: false,
            auto_delete: spec.auto_delete,
            nowait: false,
        };
        let queue = self
            .channel
            .queue_declare(&spec.name, options, argument_table(spec))
            .await
            .map_err(classify)?;
        Ok(QueueStats {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }
}

fn argument_table(spec: &QueueSpec) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in spec.arguments.to_table() {
        let value = match value {
            ArgumentValue::Str(s) => AMQPValue::LongString(LongString::from(s)),
            ArgumentValue::Int(i) => AMQPValue::LongLongInt(i),
        };
        table.insert(ShortString::from(name), value);
    }
    table
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(expiration) = properties.expiration_ms {
        basic = basic.with_expiration(ShortString::from(expiration.to_string()));
    }
    basic
}

fn message_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        message_id: properties.message_id().as_ref().map(|s| s.as_str().to_string()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        persistent: *properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        priority: *properties.priority(),
        expiration_ms: properties
            .expiration()
            .as_ref()
            .and_then(|s| s.as_str().parse().ok()),
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueStats, TransportError> {
        self.declare(spec, false).await
    }

    async fn queue_declare_passive(&self, queue_name: &str) -> Result<QueueStats, TransportError> {
        let spec = QueueSpec {
            name: queue_name.to_string(),
            durable: false,
            auto_delete: false,
            arguments: Default::default(),
        };
        self.declare(&spec, true).await
    }

    async fn queue_purge(&self, queue_name: &str) -> Result<u32, TransportError> {
        self.channel
            .queue_purge(queue_name, QueuePurgeOptions::default())
            .await
            .map_err(classify)
    }

    async fn queue_delete(
        &self,
        queue_name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, TransportError> {
        let options = QueueDeleteOptions {
            if_unused,
            if_empty,
            nowait: false,
        };
        self.channel
            .queue_delete(queue_name, options)
            .await
            .map_err(classify)
    }

    async fn basic_publish(&self, publish: Publish) -> Result<(), TransportError> {
        let options = BasicPublishOptions {
            mandatory: publish.mandatory,
            immediate: false,
        };
        let confirm = self
            .channel
            .basic_publish(
                &publish.exchange,
                &publish.routing_key,
                options,
                &publish.body,
                basic_properties(&publish.properties),
            )
            .await
            .map_err(classify)?;

        if !publish.confirm {
            return Ok(());
        }

        let confirmation = confirm.await.map_err(classify)?;
        confirmation_outcome(confirmation, &publish.routing_key)
    }

    async fn basic_consume(
        &self,
        queue_name: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, TransportError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(classify)?;
        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;

        debug!(queue = %queue_name, consumer_tag = %consumer.tag(), "basic.consume ok");
        Ok(Box::new(AmqpDeliveryStream {
            channel: self.channel.clone(),
            tag: consumer.tag().as_str().to_string(),
            consumer,
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(classify)
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(classify)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel.close(200, "OK").await.map_err(classify)
    }
}

struct AmqpDeliveryStream {
    channel: lapin::Channel,
    tag: String,
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    async fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let delivery = match tokio::time::timeout(timeout, self.consumer.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                return Err(TransportError::ConnectionLost(format!(
                    "consumer {} was cancelled by the server",
                    self.tag
                )))
            }
            Ok(Some(delivery)) => delivery.map_err(classify)?,
        };

        Ok(Some(Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            properties: message_properties(&delivery.properties),
            body: delivery.data,
        }))
    }

    async fn cancel(&mut self) -> Result<(), TransportError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::QueueArguments;

    #[test]
    fn test_argument_table() {
        let spec = QueueSpec {
            name: "q.DQ".to_string(),
            durable: true,
            auto_delete: false,
            arguments: QueueArguments {
                message_ttl: Some(60_000),
                dead_letter_exchange: Some(String::new()),
                dead_letter_routing_key: Some("q".to_string()),
                ..Default::default()
            },
        };

        let table = argument_table(&spec);
        let inner = table.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(60_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-routing-key")),
            Some(&AMQPValue::LongString(LongString::from("q")))
        );
        assert_eq!(inner.len(), 3);
    }

    #[test]
    fn test_properties_round_trip_through_basic_properties() {
        let properties = MessageProperties {
            message_id: Some("m-1".to_string()),
            content_type: Some("application/json".to_string()),
            persistent: true,
            priority: Some(3),
            expiration_ms: Some(1500),
        };

        let basic = basic_properties(&properties);
        assert_eq!(*basic.delivery_mode(), Some(2));
        assert_eq!(message_properties(&basic), properties);
    }
}
