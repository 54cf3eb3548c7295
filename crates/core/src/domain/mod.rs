// Domain Layer - Pure naming rules and entities

pub mod error;
pub mod message;
pub mod queue;

// Re-exports
pub use error::DomainError;
pub use message::{ActorDescriptor, Message, MessageId, MessageOptions};
pub use queue::{
    canonical_queue_name, dead_letter_queue_name, delay_queue_name, ArgumentValue, Overflow,
    QueueArguments, QueueName, QueueSpec, QueueStats, DEAD_LETTER_QUEUE_SUFFIX,
    DELAY_QUEUE_SUFFIX,
};
