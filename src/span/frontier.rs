//! Span Frontier.
//!
//! Tracks a high-water timestamp for every piece of a fixed key space and
//! answers "what is the oldest high-water anywhere" in O(1).
//!
//! - Entries are disjoint and always cover exactly the initially tracked spans.
//! - Entries are indexed by start key for overlap queries.
//! - A binary min-heap over (ts, start key) keeps the oldest entry at the root.
//!   Entries remember their heap slot so an in-place advance sifts in O(log n).

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use crate::hlc::Timestamp;
use crate::span::Span;

/// One tracked sub-span and its high-water timestamp.
#[derive(Clone, Debug)]
struct FrontierEntry {
    span: Span,
    ts: Timestamp,
    /// Position of this entry in `SpanFrontier::heap`.
    heap_index: usize,
}

/// Interval map from spans to timestamps with an O(1) minimum.
#[derive(Clone, Debug)]
pub struct SpanFrontier {
    /// Entry storage. Entries are split but never removed, so ids are stable.
    entries: Vec<FrontierEntry>,
    /// Start key -> entry id.
    index: BTreeMap<Vec<u8>, usize>,
    /// Min-heap of entry ids.
    heap: Vec<usize>,
}

impl SpanFrontier {
    /// Create a frontier tracking `spans`, all at the zero timestamp.
    ///
    /// # Panics
    /// If two spans overlap.
    pub fn new<I>(spans: I) -> Self
    where
        I: IntoIterator<Item = Span>,
    {
        let mut frontier = SpanFrontier {
            entries: Vec::new(),
            index: BTreeMap::new(),
            heap: Vec::new(),
        };
        for span in spans {
            if span.is_empty() {
                continue;
            }
            assert!(
                frontier.overlapping(&span).is_empty(),
                "span frontier: {} overlaps an already tracked span",
                span
            );
            frontier.insert(span, Timestamp::ZERO);
        }
        frontier
    }

    /// The minimum timestamp over all tracked spans, or zero if nothing is tracked.
    pub fn frontier(&self) -> Timestamp {
        self.heap
            .first()
            .map(|&id| self.entries[id].ts)
            .unwrap_or(Timestamp::ZERO)
    }

    /// Entries in start key order.
    pub fn entries(&self) -> impl Iterator<Item = (&Span, Timestamp)> + '_ {
        self.index.values().map(move |&id| {
            let entry = &self.entries[id];
            (&entry.span, entry.ts)
        })
    }

    /// Number of disjoint sub-spans currently tracked.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Advance every tracked piece of `span` to at least `ts`.
    ///
    /// Returns true iff the frontier moved forward. Parts of `span` outside
    /// the tracked key space are ignored.
    pub fn forward(&mut self, span: &Span, ts: Timestamp) -> bool {
        let prev = self.frontier();

        for id in self.overlapping(span) {
            if self.entries[id].ts >= ts {
                continue;
            }

            let entry_span = self.entries[id].span.clone();
            if span.contains(&entry_span) {
                self.entries[id].ts = ts;
                self.fix(self.entries[id].heap_index);
                continue;
            }

            // Partial overlap: the inside keeps this entry, the outside
            // fragments become new entries at the old timestamp.
            let old_ts = self.entries[id].ts;
            let inside = match entry_span.intersect(span) {
                Some(inside) => inside,
                None => continue,
            };
            let left = Span::new(entry_span.key.clone(), inside.key.clone());
            let right = Span::new(inside.end_key.clone(), entry_span.end_key.clone());

            self.index.remove(&entry_span.key);
            self.index.insert(inside.key.clone(), id);
            self.entries[id].span = inside;
            self.entries[id].ts = ts;
            self.fix(self.entries[id].heap_index);

            for fragment in [left, right] {
                if !fragment.is_empty() {
                    self.insert(fragment, old_ts);
                }
            }
        }

        prev < self.frontier()
    }

    /// Ids of entries overlapping `span`, in key order.
    fn overlapping(&self, span: &Span) -> Vec<usize> {
        let mut ids = Vec::new();
        if span.is_empty() {
            return ids;
        }

        // The entry starting at or before span.key may reach into it.
        if let Some((_, &id)) = self
            .index
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(span.key.as_slice())))
            .next_back()
        {
            if self.entries[id].span.end_key > span.key {
                ids.push(id);
            }
        }

        ids.extend(
            self.index
                .range::<[u8], _>((
                    Bound::Excluded(span.key.as_slice()),
                    Bound::Excluded(span.end_key.as_slice()),
                ))
                .map(|(_, &id)| id),
        );
        ids
    }

    fn insert(&mut self, span: Span, ts: Timestamp) {
        let id = self.entries.len();
        self.index.insert(span.key.clone(), id);
        self.entries.push(FrontierEntry {
            span,
            ts,
            heap_index: self.heap.len(),
        });
        self.heap.push(id);
        self.sift_up(self.heap.len() - 1);
    }

    // -------------------------------------------------------------------------
    // Heap maintenance
    // -------------------------------------------------------------------------

    fn less(&self, i: usize, j: usize) -> bool {
        let a = &self.entries[self.heap[i]];
        let b = &self.entries[self.heap[j]];
        (a.ts, &a.span.key) < (b.ts, &b.span.key)
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        let (a, b) = (self.heap[i], self.heap[j]);
        self.entries[a].heap_index = i;
        self.entries[b].heap_index = j;
    }

    /// Restore heap order after the entry at `i` changed.
    fn fix(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns true if the element moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut smallest = left;
            let right = left + 1;
            if right < n && self.less(right, left) {
                smallest = right;
            }
            if !self.less(smallest, i) {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
        i > start
    }
}

impl fmt::Display for SpanFrontier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (span, ts)) in self.entries().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}@{}", span, ts)?;
        }
        Ok(())
    }
}
