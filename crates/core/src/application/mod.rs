// Application Layer - Topology, retries, connection holders, broker and consumer

pub mod broker;
pub mod connection;
pub mod constants;
pub mod consumer;
pub mod retry;
pub mod topology;

// Re-exports
pub use broker::{Broker, BrokerBuilder, BrokerOptions, JoinOptions, QueueMessageCounts};
pub use connection::{
    ChannelLease, ConnectionHolder, HolderOptions, HolderStatus, HolderStrategy,
    PooledConnectionHolder, PooledHolderOptions, Producer, SharedConnectionHolder,
    SharedHolderOptions,
};
pub use consumer::{Acknowledger, Consumer, MessageProxy, QueueReader};
pub use retry::{retry_over_time, RetryDecision, RetryPolicy};
pub use topology::{DefaultTopology, DlxRoutingTopology, Topology, TopologyConfig, TopologyKind};
