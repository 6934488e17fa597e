//! Key spans and the span frontier.

pub mod frontier;

use std::fmt;

pub use frontier::SpanFrontier;

/// Half-open interval `[key, end_key)` of opaque byte keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl Span {
    pub fn new(key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Span {
            key: key.into(),
            end_key: end_key.into(),
        }
    }

    /// A span with `key >= end_key` covers nothing.
    pub fn is_empty(&self) -> bool {
        self.key >= self.end_key
    }

    /// True if the intersection with `other` is non-empty.
    pub fn overlaps(&self, other: &Span) -> bool {
        !self.is_empty() && !other.is_empty() && self.key < other.end_key && other.key < self.end_key
    }

    /// True if every key of `other` is inside `self`.
    pub fn contains(&self, other: &Span) -> bool {
        self.key <= other.key && other.end_key <= self.end_key
    }

    /// The common part of two spans, if any.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        if !self.overlaps(other) {
            return None;
        }
        let key = self.key.as_slice().max(other.key.as_slice());
        let end_key = self.end_key.as_slice().min(other.end_key.as_slice());
        Some(Span::new(key, end_key))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}-{}}}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.end_key)
        )
    }
}
