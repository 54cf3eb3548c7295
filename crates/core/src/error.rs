// Central Error Type for the Broker
// Transport errors are reclassified here, once, at the connection-holder boundary

use crate::port::transport::reply_code;
use crate::port::{DecodeError, EncodeError, TransportError};
use thiserror::Error;

/// Library-level error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Domain error: {0}")]
    Domain(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection unusable; recoverable by reconnecting
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection closed by the server with a hard error
    #[error("Connection closed ({code}): {message}")]
    ConnectionClosed { code: u16, message: String },

    #[error("Channel error ({code}): {message}")]
    Channel { code: u16, message: String },

    #[error("No route: {0}")]
    NoRoute(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Operation not allowed: {0}")]
    NotAllowed(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error(
        "Message delay {delay}ms exceeds max_delay_time {max_delay}ms configured for queue '{queue_name}'"
    )]
    DelayTooLong {
        delay: u64,
        max_delay: u64,
        queue_name: String,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Resource limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Queue join timed out: {0}")]
    QueueJoinTimeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl BrokerError {
    /// Lost connection: retried after reconnecting
    pub fn is_recoverable_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }

    /// Soft channel error worth retrying on a fresh channel
    pub fn is_recoverable_channel(&self) -> bool {
        match self {
            BrokerError::Channel { code, .. } => {
                reply_code::RECOVERABLE_CHANNEL_CODES.contains(code)
            }
            _ => false,
        }
    }

    pub fn is_no_route(&self) -> bool {
        matches!(self, BrokerError::NoRoute(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::QueueNotFound(_))
    }

    pub fn is_not_allowed(&self) -> bool {
        matches!(self, BrokerError::NotAllowed(_))
    }
}

impl From<TransportError> for BrokerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionLost(message) => BrokerError::Connection(message),
            TransportError::Connection { code, message } | TransportError::Channel { code, message }
                if code == reply_code::NOT_ALLOWED =>
            {
                BrokerError::NotAllowed(message)
            }
            TransportError::Connection { code, message } => {
                BrokerError::ConnectionClosed { code, message }
            }
            TransportError::Channel { code, message } => match code {
                reply_code::NO_ROUTE => BrokerError::NoRoute(message),
                reply_code::NOT_FOUND => BrokerError::QueueNotFound(message),
                reply_code::PRECONDITION_FAILED => BrokerError::PreconditionFailed(message),
                _ => BrokerError::Channel { code, message },
            },
            TransportError::ChannelLimit(message) => BrokerError::LimitExceeded(message),
            TransportError::Timeout(message) => BrokerError::Timeout(message),
        }
    }
}

impl From<crate::domain::DomainError> for BrokerError {
    fn from(err: crate::domain::DomainError) -> Self {
        BrokerError::Domain(err.to_string())
    }
}

/// Result type alias using BrokerError
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclassification() {
        let cases = [
            (
                TransportError::ConnectionLost("reset".into()),
                BrokerError::Connection("reset".into()),
            ),
            (
                TransportError::channel(312, "NO_ROUTE"),
                BrokerError::NoRoute("NO_ROUTE".into()),
            ),
            (
                TransportError::channel(404, "NOT_FOUND"),
                BrokerError::QueueNotFound("NOT_FOUND".into()),
            ),
            (
                TransportError::Connection {
                    code: 530,
                    message: "NOT_ALLOWED".into(),
                },
                BrokerError::NotAllowed("NOT_ALLOWED".into()),
            ),
            (
                TransportError::Connection {
                    code: 403,
                    message: "ACCESS_REFUSED".into(),
                },
                BrokerError::ConnectionClosed {
                    code: 403,
                    message: "ACCESS_REFUSED".into(),
                },
            ),
            (
                TransportError::ChannelLimit("2047".into()),
                BrokerError::LimitExceeded("2047".into()),
            ),
        ];

        for (transport, expected) in cases {
            assert_eq!(BrokerError::from(transport), expected);
        }
    }

    #[test]
    fn test_recoverable_sets() {
        assert!(BrokerError::Connection("x".into()).is_recoverable_connection());
        assert!(BrokerError::Channel {
            code: 405,
            message: "locked".into()
        }
        .is_recoverable_channel());
        assert!(!BrokerError::NoRoute("x".into()).is_recoverable_channel());
        assert!(!BrokerError::Timeout("x".into()).is_recoverable_connection());
    }

    #[test]
    fn test_delay_too_long_message() {
        let err = BrokerError::DelayTooLong {
            delay: 2000,
            max_delay: 1000,
            queue_name: "emails".into(),
        };
        assert_eq!(
            err.to_string(),
            "Message delay 2000ms exceeds max_delay_time 1000ms configured for queue 'emails'"
        );
    }
}
