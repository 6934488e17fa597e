//! Dedup shield for at-least-once producers.
//!
//! Remembers every row message already surfaced, keyed by
//! `topic|partition|key|value`. Rows replayed after a resume carry the same
//! value (including `updated`) and are dropped. Resolved messages always pass.

use std::collections::HashSet;

use crate::feed::FeedMessage;

#[derive(Debug, Default)]
pub struct SeenSet {
    seen: HashSet<Vec<u8>>,
}

impl SeenSet {
    pub fn new() -> Self {
        SeenSet::default()
    }

    /// Returns true the first time a logical row is offered, false for repeats.
    pub fn first_sighting(&mut self, m: &FeedMessage) -> bool {
        if m.is_resolved() {
            return true;
        }
        self.seen.insert(dedup_key(m))
    }

    /// Number of distinct rows surfaced.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn dedup_key(m: &FeedMessage) -> Vec<u8> {
    let key = m.key.as_deref().unwrap_or_default();
    let value = m.value.as_deref().unwrap_or_default();
    let mut buf =
        Vec::with_capacity(m.topic.len() + m.partition.len() + key.len() + value.len() + 3);
    buf.extend_from_slice(m.topic.as_bytes());
    buf.push(b'|');
    buf.extend_from_slice(m.partition.as_bytes());
    buf.push(b'|');
    buf.extend_from_slice(key);
    buf.push(b'|');
    buf.extend_from_slice(value);
    buf
}
