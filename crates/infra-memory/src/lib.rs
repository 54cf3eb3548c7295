// Conveyor Infrastructure - In-memory Transport
// Implements: Transport, Connection, Channel, DeliveryStream (AMQP-like semantics)

mod state;
pub mod transport;

pub use state::FaultOp;
pub use transport::{MemoryTransport, DEFAULT_CHANNEL_MAX};
