// Queue Domain Model
// Physical naming convention and broker-native queue arguments

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Suffix of the delay queue derived from a canonical name
pub const DELAY_QUEUE_SUFFIX: &str = ".DQ";

/// Suffix of the dead-letter queue derived from a canonical name
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".XQ";

/// Strip one trailing delay or dead-letter suffix.
pub fn canonical_queue_name(queue_name: &str) -> &str {
    queue_name
        .strip_suffix(DELAY_QUEUE_SUFFIX)
        .or_else(|| queue_name.strip_suffix(DEAD_LETTER_QUEUE_SUFFIX))
        .unwrap_or(queue_name)
}

/// Name of the delay queue for any of the three physical names.
pub fn delay_queue_name(queue_name: &str) -> String {
    if queue_name.ends_with(DELAY_QUEUE_SUFFIX) {
        return queue_name.to_string();
    }
    format!("{}{}", canonical_queue_name(queue_name), DELAY_QUEUE_SUFFIX)
}

/// Name of the dead-letter queue for any of the three physical names.
pub fn dead_letter_queue_name(queue_name: &str) -> String {
    if queue_name.ends_with(DEAD_LETTER_QUEUE_SUFFIX) {
        return queue_name.to_string();
    }
    format!(
        "{}{}",
        canonical_queue_name(queue_name),
        DEAD_LETTER_QUEUE_SUFFIX
    )
}

/// The three physical queues backing one logical queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName {
    pub canonical: String,
    pub delayed: String,
    pub dead_letter: String,
}

impl QueueName {
    /// Derive the triple from any of its members
    pub fn resolve(queue_name: &str) -> Self {
        Self {
            canonical: canonical_queue_name(queue_name).to_string(),
            delayed: delay_queue_name(queue_name),
            dead_letter: dead_letter_queue_name(queue_name),
        }
    }

    pub fn is_canonical(queue_name: &str) -> bool {
        canonical_queue_name(queue_name) == queue_name
    }

    /// Physical names in (canonical, delayed, dead-letter) order
    pub fn physical(&self) -> [&str; 3] {
        [&self.canonical, &self.delayed, &self.dead_letter]
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

/// Overflow behaviour for length-limited queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Overflow {
    DropHead,
    RejectPublish,
    RejectPublishDlx,
}

impl Overflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Overflow::DropHead => "drop-head",
            Overflow::RejectPublish => "reject-publish",
            Overflow::RejectPublishDlx => "reject-publish-dlx",
        }
    }
}

/// Wire value of a queue argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentValue {
    Str(String),
    Int(i64),
}

impl fmt::Display for ArgumentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentValue::Str(s) => write!(f, "'{}'", s),
            ArgumentValue::Int(i) => write!(f, "{}", i),
        }
    }
}

/// Broker-native per-queue options, fixed at declare time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueArguments {
    /// x-message-ttl (ms)
    pub message_ttl: Option<u64>,
    /// x-dead-letter-exchange
    pub dead_letter_exchange: Option<String>,
    /// x-dead-letter-routing-key
    pub dead_letter_routing_key: Option<String>,
    /// x-max-priority
    pub max_priority: Option<u8>,
    /// x-expires (ms of unuse before the queue is deleted)
    pub expires: Option<u64>,
    /// x-max-length
    pub max_length: Option<u64>,
    /// x-overflow
    pub overflow: Option<Overflow>,
    /// x-queue-type (classic, quorum, stream)
    pub queue_type: Option<String>,
}

impl QueueArguments {
    /// Flatten into `x-*` argument names, the form sent on the wire
    pub fn to_table(&self) -> BTreeMap<String, ArgumentValue> {
        let mut table = BTreeMap::new();
        if let Some(ttl) = self.message_ttl {
            table.insert("x-message-ttl".to_string(), ArgumentValue::Int(ttl as i64));
        }
        if let Some(exchange) = &self.dead_letter_exchange {
            table.insert(
                "x-dead-letter-exchange".to_string(),
                ArgumentValue::Str(exchange.clone()),
            );
        }
        if let Some(routing_key) = &self.dead_letter_routing_key {
            table.insert(
                "x-dead-letter-routing-key".to_string(),
                ArgumentValue::Str(routing_key.clone()),
            );
        }
        if let Some(priority) = self.max_priority {
            table.insert(
                "x-max-priority".to_string(),
                ArgumentValue::Int(i64::from(priority)),
            );
        }
        if let Some(expires) = self.expires {
            table.insert("x-expires".to_string(), ArgumentValue::Int(expires as i64));
        }
        if let Some(max_length) = self.max_length {
            table.insert(
                "x-max-length".to_string(),
                ArgumentValue::Int(max_length as i64),
            );
        }
        if let Some(overflow) = self.overflow {
            table.insert(
                "x-overflow".to_string(),
                ArgumentValue::Str(overflow.as_str().to_string()),
            );
        }
        if let Some(queue_type) = &self.queue_type {
            table.insert(
                "x-queue-type".to_string(),
                ArgumentValue::Str(queue_type.clone()),
            );
        }
        table
    }
}

/// Everything a declare sends for one physical queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: QueueArguments,
}

/// Counters reported by a (passive) declare
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub message_count: u32,
    pub consumer_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_from_any_member() {
        let expected = QueueName {
            canonical: "emails".to_string(),
            delayed: "emails.DQ".to_string(),
            dead_letter: "emails.XQ".to_string(),
        };

        assert_eq!(QueueName::resolve("emails"), expected);
        assert_eq!(QueueName::resolve("emails.DQ"), expected);
        assert_eq!(QueueName::resolve("emails.XQ"), expected);
    }

    #[test]
    fn test_names_are_pairwise_distinct() {
        for name in ["default", "a", "with.dots", "DQ", "x.DQ.y"] {
            let names = QueueName::resolve(name);
            assert_ne!(names.canonical, names.delayed);
            assert_ne!(names.canonical, names.dead_letter);
            assert_ne!(names.delayed, names.dead_letter);
        }
    }

    #[test]
    fn test_only_one_suffix_is_stripped() {
        assert_eq!(canonical_queue_name("q.DQ.DQ"), "q.DQ");
        assert_eq!(delay_queue_name("q.DQ.DQ"), "q.DQ.DQ");
        assert_eq!(dead_letter_queue_name("q.XQ.DQ"), "q.XQ.XQ");
        assert!(QueueName::is_canonical("q"));
        assert!(!QueueName::is_canonical("q.XQ"));
    }

    #[test]
    fn test_arguments_table() {
        let args = QueueArguments {
            message_ttl: Some(1000),
            dead_letter_exchange: Some(String::new()),
            dead_letter_routing_key: Some("q.XQ".to_string()),
            max_priority: Some(10),
            overflow: Some(Overflow::RejectPublish),
            ..Default::default()
        };

        let table = args.to_table();
        assert_eq!(table.len(), 5);
        assert_eq!(table["x-message-ttl"], ArgumentValue::Int(1000));
        assert_eq!(table["x-dead-letter-exchange"], ArgumentValue::Str(String::new()));
        assert_eq!(
            table["x-dead-letter-routing-key"],
            ArgumentValue::Str("q.XQ".to_string())
        );
        assert_eq!(table["x-max-priority"], ArgumentValue::Int(10));
        assert_eq!(
            table["x-overflow"],
            ArgumentValue::Str("reject-publish".to_string())
        );
    }
}
