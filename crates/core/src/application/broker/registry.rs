// Declared-queue registry
// Per-queue state: unknown -> pending (declared, not yet on the server) -> ensured

use std::collections::{BTreeSet, HashSet};

/// Queue bookkeeping of one broker. Callers hold the broker's registry
/// lock for every mutation.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    /// Canonical names of declared queues
    declared: BTreeSet<String>,
    /// Physical names still to be declared on the server
    pending: HashSet<String>,
    delay_queues: BTreeSet<String>,
}

impl QueueRegistry {
    pub fn is_declared(&self, canonical: &str) -> bool {
        self.declared.contains(canonical)
    }

    pub fn is_pending(&self, queue_name: &str) -> bool {
        self.pending.contains(queue_name)
    }

    /// Unknown -> pending. Returns false when already declared.
    pub fn declare(&mut self, canonical: &str, delayed: &str) -> bool {
        if !self.declared.insert(canonical.to_string()) {
            return false;
        }
        self.pending.insert(canonical.to_string());
        self.delay_queues.insert(delayed.to_string());
        true
    }

    pub fn mark_pending(&mut self, queue_name: &str) {
        self.pending.insert(queue_name.to_string());
    }

    /// Call only right after the physical declare succeeded
    pub fn mark_ensured(&mut self, queue_name: &str) {
        self.pending.remove(queue_name);
    }

    /// Drop from the declared set so the next declare starts over
    pub fn forget(&mut self, canonical: &str) {
        self.declared.remove(canonical);
    }

    pub fn declared(&self) -> Vec<String> {
        self.declared.iter().cloned().collect()
    }

    pub fn delay_queues(&self) -> Vec<String> {
        self.delay_queues.iter().cloned().collect()
    }

    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self.pending.iter().cloned().collect();
        pending.sort();
        pending
    }
}
