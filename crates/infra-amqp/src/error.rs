// lapin error classification

use conveyor_core::port::{reply_code, TransportError};
use lapin::protocol::AMQPErrorKind;
use lapin::publisher_confirm::Confirmation;

/// Map a client error onto the port's transport error kinds.
///
/// Soft protocol errors close only the channel; hard ones close the
/// connection. Anything signalling a dead socket or a closed
/// channel/connection is `ConnectionLost`.
pub fn classify(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::ProtocolError(amqp) => {
            let code = amqp.get_id();
            let message = amqp.get_message().as_str().to_string();
            match amqp.kind() {
                AMQPErrorKind::Soft(_) => TransportError::Channel { code, message },
                AMQPErrorKind::Hard(_) => TransportError::Connection { code, message },
            }
        }
        lapin::Error::ChannelsLimitReached => {
            TransportError::ChannelLimit("channel_max reached".to_string())
        }
        lapin::Error::IOError(io) => TransportError::ConnectionLost(io.to_string()),
        lapin::Error::InvalidChannelState(state) => {
            TransportError::ConnectionLost(format!("channel is {:?}", state))
        }
        lapin::Error::InvalidConnectionState(state) => {
            TransportError::ConnectionLost(format!("connection is {:?}", state))
        }
        other => TransportError::ConnectionLost(other.to_string()),
    }
}

/// A mandatory publish came back from the server
pub(crate) fn returned(code: u16, text: &str) -> TransportError {
    TransportError::channel(code, text.to_string())
}

pub(crate) fn nacked(routing_key: &str) -> TransportError {
    TransportError::channel(
        reply_code::INTERNAL_ERROR,
        format!("publish to '{}' nacked by the server", routing_key),
    )
}

/// Outcome of a confirmed publish. A returned message wins over the
/// ack/nack flag, which is read before the message is taken.
pub(crate) fn confirmation_outcome(
    confirmation: Confirmation,
    routing_key: &str,
) -> Result<(), TransportError> {
    let is_nack = confirmation.is_nack();
    if let Some(message) = confirmation.take_message() {
        return Err(returned(message.reply_code, message.reply_text.as_str()));
    }
    if is_nack {
        return Err(nacked(routing_key));
    }
    Ok(())
}
