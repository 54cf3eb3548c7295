// Conveyor Infrastructure - AMQP Adapter
// Implements: Transport, Connection, Channel, DeliveryStream over lapin

mod channel;
mod error;
mod options;
mod transport;

pub use error::classify;
pub use options::AmqpOptions;
pub use transport::AmqpTransport;

// Note: lapin::Error is classified here into the port's TransportError;
// the core crate never sees lapin types
