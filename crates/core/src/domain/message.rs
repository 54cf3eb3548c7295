// Message Domain Model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message identifier (UUID v4 string)
pub type MessageId = String;

/// Broker-relevant message options
///
/// Unknown options are preserved in `extra` so runtimes can carry their
/// own metadata (retries, time limits, ...) through the broker untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageOptions {
    /// Earliest execution time (ms since epoch), stamped on delayed enqueue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<i64>,

    /// Native broker priority (requires a max priority on the queue)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_priority: Option<u8>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Logical message exchanged between producers and the execution runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub queue_name: String,
    pub actor_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub options: MessageOptions,
    /// Creation time (ms since epoch)
    pub message_timestamp: i64,
}

impl Message {
    pub fn new(
        message_id: impl Into<MessageId>,
        queue_name: impl Into<String>,
        actor_name: impl Into<String>,
        message_timestamp: i64,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            queue_name: queue_name.into(),
            actor_name: actor_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            options: MessageOptions::default(),
            message_timestamp,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_broker_priority(mut self, priority: u8) -> Self {
        self.options.broker_priority = Some(priority);
        self
    }

    /// Copy retargeted at the delay queue with its eta stamped
    pub fn delayed(&self, delay_queue_name: impl Into<String>, eta: i64) -> Self {
        let mut message = self.clone();
        message.queue_name = delay_queue_name.into();
        message.options.eta = Some(eta);
        message
    }
}

/// Actor registration as seen by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorDescriptor {
    pub actor_name: String,
    pub queue_name: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl ActorDescriptor {
    pub fn new(actor_name: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            actor_name: actor_name.into(),
            queue_name: queue_name.into(),
            options: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delayed_copy_keeps_original() {
        let message = Message::new("id-1", "emails", "send_email", 1_000);
        let delayed = message.delayed("emails.DQ", 6_000);

        assert_eq!(delayed.queue_name, "emails.DQ");
        assert_eq!(delayed.options.eta, Some(6_000));
        assert_eq!(delayed.message_id, "id-1");
        assert_eq!(message.queue_name, "emails");
        assert_eq!(message.options.eta, None);
    }

    #[test]
    fn test_unknown_options_survive_serialization() {
        let raw = json!({
            "message_id": "id-2",
            "queue_name": "q",
            "actor_name": "a",
            "args": [1, "two"],
            "kwargs": {"k": true},
            "options": {"broker_priority": 3, "retries": 2},
            "message_timestamp": 42
        });

        let message: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(message.options.broker_priority, Some(3));
        assert_eq!(message.options.extra["retries"], json!(2));

        let back = serde_json::to_value(&message).unwrap();
        assert_eq!(back["options"]["retries"], json!(2));
        assert!(back["options"].get("eta").is_none());
    }
}
