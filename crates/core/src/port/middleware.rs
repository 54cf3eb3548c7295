// Broker Middleware Port
// Observers notified around queue declaration, enqueue and actor registration

use crate::domain::{ActorDescriptor, Message};

/// Broker lifecycle observer. Every hook defaults to a no-op.
pub trait BrokerMiddleware: Send + Sync {
    fn before_declare_actor(&self, _actor: &ActorDescriptor) {}

    fn after_declare_actor(&self, _actor: &ActorDescriptor) {}

    fn before_declare_queue(&self, _queue_name: &str) {}

    fn after_declare_queue(&self, _queue_name: &str) {}

    fn after_declare_delay_queue(&self, _queue_name: &str) {}

    fn before_enqueue(&self, _message: &Message, _delay: Option<u64>) {}

    fn after_enqueue(&self, _message: &Message, _delay: Option<u64>) {}
}

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Records every notification as `"<hook>:<subject>"`
    #[derive(Default)]
    pub struct RecordingMiddleware {
        events: Mutex<Vec<String>>,
    }

    impl RecordingMiddleware {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, event: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.as_str() == event)
                .count()
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl BrokerMiddleware for RecordingMiddleware {
        fn before_declare_actor(&self, actor: &ActorDescriptor) {
            self.record(format!("before_declare_actor:{}", actor.actor_name));
        }

        fn after_declare_actor(&self, actor: &ActorDescriptor) {
            self.record(format!("after_declare_actor:{}", actor.actor_name));
        }

        fn before_declare_queue(&self, queue_name: &str) {
            self.record(format!("before_declare_queue:{}", queue_name));
        }

        fn after_declare_queue(&self, queue_name: &str) {
            self.record(format!("after_declare_queue:{}", queue_name));
        }

        fn after_declare_delay_queue(&self, queue_name: &str) {
            self.record(format!("after_declare_delay_queue:{}", queue_name));
        }

        fn before_enqueue(&self, message: &Message, _delay: Option<u64>) {
            self.record(format!("before_enqueue:{}", message.queue_name));
        }

        fn after_enqueue(&self, message: &Message, _delay: Option<u64>) {
            self.record(format!("after_enqueue:{}", message.queue_name));
        }
    }
}
