// Port Layer - Interfaces for external dependencies

pub mod codec;
pub mod id_provider; // For deterministic testing
pub mod middleware;
pub mod time_provider;
pub mod transport;

// Re-exports
pub use codec::{DecodeError, EncodeError, JsonCodec, MessageCodec};
pub use id_provider::IdProvider;
pub use middleware::BrokerMiddleware;
pub use time_provider::TimeProvider;
pub use transport::{
    reply_code, Channel, Connection, Delivery, DeliveryStream, MessageProperties, Publish,
    Transport, TransportError,
};
