// Queue Topology
// Naming, per-queue arguments and drift-tolerant declares for the
// canonical / delay / dead-letter queue triple

use crate::domain::{QueueArguments, QueueName, QueueSpec};
use crate::error::Result;
use crate::port::Channel;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Declare-time settings shared by the three queues
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub durable: bool,
    pub auto_delete: bool,
    /// Exchange used for dead-lettering ("" is the default exchange)
    pub dlx_exchange_name: String,
    pub max_priority: Option<u8>,
    /// TTL of dead-lettered messages; unset keeps them until purged
    pub dead_letter_message_ttl_ms: Option<u64>,
    /// Longest accepted delay, also the delay queue's TTL failsafe
    #[serde(alias = "delay_queue_ttl_ms")]
    pub max_delay_time_ms: Option<u64>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            dlx_exchange_name: String::new(),
            max_priority: None,
            dead_letter_message_ttl_ms: None,
            max_delay_time_ms: None,
        }
    }
}

/// Which delay-expiry routing to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyKind {
    /// Expired delay messages move to the canonical queue
    #[default]
    Default,
    /// Expired delay messages move to the dead-letter queue
    DlxRouting,
}

impl TopologyKind {
    pub fn build(self, config: TopologyConfig) -> Arc<dyn Topology> {
        match self {
            TopologyKind::Default => Arc::new(DefaultTopology::new(config)),
            TopologyKind::DlxRouting => Arc::new(DlxRoutingTopology::new(config)),
        }
    }
}

/// Memoised `QueueName::resolve`
#[derive(Debug, Default)]
pub struct QueueNameCache {
    names: RwLock<HashMap<String, QueueName>>,
}

impl QueueNameCache {
    pub fn resolve(&self, queue_name: &str) -> QueueName {
        if let Some(names) = self
            .names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
        {
            return names.clone();
        }

        let names = QueueName::resolve(queue_name);
        self.names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue_name.to_string(), names.clone());
        names
    }
}

/// Queue topology
///
/// Implementations provide the config and name resolution; argument
/// builders and declares have defaults that variants override piecemeal.
#[async_trait]
pub trait Topology: Send + Sync {
    fn config(&self) -> &TopologyConfig;

    fn names(&self, queue_name: &str) -> QueueName;

    fn max_delay_time(&self) -> Option<u64> {
        self.config().max_delay_time_ms
    }

    fn canonical_queue_arguments(&self, queue_name: &str, dlx: bool) -> QueueArguments {
        let config = self.config();
        let mut arguments = QueueArguments {
            max_priority: config.max_priority,
            ..Default::default()
        };
        if dlx {
            arguments.dead_letter_exchange = Some(config.dlx_exchange_name.clone());
            arguments.dead_letter_routing_key = Some(self.names(queue_name).dead_letter);
        }
        arguments
    }

    /// Per-message TTL drives the delay; on expiry the message is
    /// dead-lettered to the canonical queue
    fn delay_queue_arguments(&self, queue_name: &str) -> QueueArguments {
        let config = self.config();
        let mut arguments = self.canonical_queue_arguments(queue_name, false);
        arguments.dead_letter_exchange = Some(config.dlx_exchange_name.clone());
        arguments.dead_letter_routing_key = Some(self.names(queue_name).canonical);
        arguments.message_ttl = config.max_delay_time_ms;
        arguments
    }

    fn dead_letter_queue_arguments(&self, _queue_name: &str) -> QueueArguments {
        QueueArguments {
            message_ttl: self.config().dead_letter_message_ttl_ms,
            ..Default::default()
        }
    }

    fn queue_spec(&self, name: &str, arguments: QueueArguments) -> QueueSpec {
        QueueSpec {
            name: name.to_string(),
            durable: self.config().durable,
            auto_delete: self.config().auto_delete,
            arguments,
        }
    }

    async fn declare_canonical_queue(
        &self,
        channel: &dyn Channel,
        queue_name: &str,
        ignore_different_topology: bool,
    ) -> Result<()> {
        let name = self.names(queue_name).canonical;
        let spec = self.queue_spec(&name, self.canonical_queue_arguments(queue_name, true));
        declare_queue(channel, &spec, ignore_different_topology).await
    }

    async fn declare_delay_queue(
        &self,
        channel: &dyn Channel,
        queue_name: &str,
        ignore_different_topology: bool,
    ) -> Result<()> {
        let name = self.names(queue_name).delayed;
        let spec = self.queue_spec(&name, self.delay_queue_arguments(queue_name));
        declare_queue(channel, &spec, ignore_different_topology).await
    }

    async fn declare_dead_letter_queue(
        &self,
        channel: &dyn Channel,
        queue_name: &str,
        ignore_different_topology: bool,
    ) -> Result<()> {
        let name = self.names(queue_name).dead_letter;
        let spec = self.queue_spec(&name, self.dead_letter_queue_arguments(queue_name));
        declare_queue(channel, &spec, ignore_different_topology).await
    }
}

/// Declare one physical queue. Only the "inequivalent arguments" conflict
/// can be ignored; every other failure propagates.
pub async fn declare_queue(
    channel: &dyn Channel,
    spec: &QueueSpec,
    ignore_different_topology: bool,
) -> Result<()> {
    info!(queue = %spec.name, channel_id = channel.id(), "Declaring queue");

    match channel.queue_declare(spec).await {
        Ok(_) => Ok(()),
        Err(err) if ignore_different_topology && err.is_inequivalent_arguments() => {
            warn!(
                queue = %spec.name,
                error = %err,
                "Queue exists with different arguments, keeping the existing one"
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Delay queue dead-letters into the canonical queue
#[derive(Debug, Default)]
pub struct DefaultTopology {
    config: TopologyConfig,
    names: QueueNameCache,
}

impl DefaultTopology {
    pub fn new(config: TopologyConfig) -> Self {
        Self {
            config,
            names: QueueNameCache::default(),
        }
    }
}

impl Topology for DefaultTopology {
    fn config(&self) -> &TopologyConfig {
        &self.config
    }

    fn names(&self, queue_name: &str) -> QueueName {
        self.names.resolve(queue_name)
    }
}

/// Delay queue dead-letters into the dead-letter queue, which then acts
/// as an audit sink; dead-lettered messages never expire
#[derive(Debug, Default)]
pub struct DlxRoutingTopology {
    config: TopologyConfig,
    names: QueueNameCache,
}

impl DlxRoutingTopology {
    pub fn new(config: TopologyConfig) -> Self {
        let config = TopologyConfig {
            dead_letter_message_ttl_ms: None,
            ..config
        };
        Self {
            config,
            names: QueueNameCache::default(),
        }
    }
}

impl Topology for DlxRoutingTopology {
    fn config(&self) -> &TopologyConfig {
        &self.config
    }

    fn names(&self, queue_name: &str) -> QueueName {
        self.names.resolve(queue_name)
    }

    fn delay_queue_arguments(&self, queue_name: &str) -> QueueArguments {
        let mut arguments = self.canonical_queue_arguments(queue_name, false);
        arguments.dead_letter_exchange = Some(self.config.dlx_exchange_name.clone());
        arguments.dead_letter_routing_key = Some(self.names(queue_name).dead_letter);
        arguments.message_ttl = self.config.max_delay_time_ms;
        arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::port::transport::mocks::MockChannel;
    use crate::port::transport::reply_code;
    use crate::port::TransportError;

    fn config() -> TopologyConfig {
        TopologyConfig {
            max_priority: Some(10),
            max_delay_time_ms: Some(60_000),
            dead_letter_message_ttl_ms: Some(86_400_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_canonical_arguments_route_to_dead_letter() {
        let topology = DefaultTopology::new(config());
        let args = topology.canonical_queue_arguments("emails", true);

        assert_eq!(args.dead_letter_exchange.as_deref(), Some(""));
        assert_eq!(args.dead_letter_routing_key.as_deref(), Some("emails.XQ"));
        assert_eq!(args.max_priority, Some(10));
        assert_eq!(args.message_ttl, None);
    }

    #[test]
    fn test_delay_arguments_route_to_canonical() {
        let topology = DefaultTopology::new(config());
        let args = topology.delay_queue_arguments("emails.DQ");

        assert_eq!(args.dead_letter_routing_key.as_deref(), Some("emails"));
        assert_eq!(args.message_ttl, Some(60_000));
        assert_eq!(args.max_priority, Some(10));
    }

    #[test]
    fn test_dead_letter_ttl_is_optional() {
        let with_ttl = DefaultTopology::new(config());
        let without_ttl = DefaultTopology::new(TopologyConfig::default());

        assert_eq!(
            with_ttl.dead_letter_queue_arguments("emails").message_ttl,
            Some(86_400_000)
        );
        assert_eq!(
            without_ttl.dead_letter_queue_arguments("emails"),
            QueueArguments::default()
        );
    }

    #[test]
    fn test_dlx_routing_variant_only_changes_delay_routing() {
        let default = DefaultTopology::new(config());
        let dlx = DlxRoutingTopology::new(config());

        assert_eq!(
            dlx.delay_queue_arguments("emails").dead_letter_routing_key.as_deref(),
            Some("emails.XQ")
        );
        assert_eq!(
            dlx.canonical_queue_arguments("emails", true),
            default.canonical_queue_arguments("emails", true)
        );
        assert_eq!(dlx.dead_letter_queue_arguments("emails").message_ttl, None);
    }

    #[test]
    fn test_names_are_memoised_and_stable() {
        let topology = DefaultTopology::new(TopologyConfig::default());
        let first = topology.names("reports.DQ");
        let second = topology.names("reports.DQ");

        assert_eq!(first, second);
        assert_eq!(first.canonical, "reports");
    }

    #[tokio::test]
    async fn test_declare_sends_spec() {
        let topology = DefaultTopology::new(config());
        let channel = MockChannel::new();

        topology
            .declare_delay_queue(channel.as_ref(), "emails", false)
            .await
            .unwrap();

        let declared = channel.declared.lock().unwrap();
        assert_eq!(declared.len(), 1);
        assert_eq!(declared[0].name, "emails.DQ");
        assert!(declared[0].durable);
        assert!(!declared[0].auto_delete);
    }

    #[tokio::test]
    async fn test_inequivalent_arguments_ignored_only_on_opt_in() {
        let topology = DefaultTopology::new(config());
        let channel = MockChannel::new();
        channel.fail_declares_with(TransportError::channel(
            reply_code::PRECONDITION_FAILED,
            "PRECONDITION_FAILED - inequivalent arg 'x-max-priority' for queue 'emails'",
        ));

        assert!(topology
            .declare_canonical_queue(channel.as_ref(), "emails", true)
            .await
            .is_ok());

        let err = topology
            .declare_canonical_queue(channel.as_ref(), "emails", false)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_other_declare_failures_always_propagate() {
        let topology = DefaultTopology::new(config());
        let channel = MockChannel::new();
        channel.fail_declares_with(TransportError::channel(
            reply_code::NOT_FOUND,
            "NOT_FOUND - no queue 'emails'",
        ));

        let err = topology
            .declare_dead_letter_queue(channel.as_ref(), "emails", true)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
