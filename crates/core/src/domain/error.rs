// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("Queue name {0:?} is not canonical")]
    NotCanonical(String),

    #[error("Actor not found: {0}")]
    ActorNotFound(String),
}
