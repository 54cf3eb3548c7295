// Conveyor Core - Domain, Ports & Broker Logic
// NO infrastructure dependencies: transports live in the infra crates

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use application::{Broker, BrokerBuilder, BrokerOptions, Consumer, MessageProxy};
pub use error::{BrokerError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
