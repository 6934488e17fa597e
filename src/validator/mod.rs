//! Validators: checks a change-feed's output against its guarantees.
//!
//! Every row and resolved message read from a feed is fed to a validator.
//! Broken guarantees are recorded as `Violation`s and never stop the run;
//! only errors talking to the cluster do.

mod fingerprint;
mod order;
mod resolved;

use std::fmt;

use crate::error::Result;
use crate::hlc::Timestamp;

pub use fingerprint::FingerprintValidator;
pub use order::OrderValidator;
pub use resolved::ResolvedValidator;

/// A broken feed guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Type of violation.
    pub kind: ViolationKind,
    /// Description of the violation.
    pub description: String,
}

/// Types of guarantee violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A row for a key arrived with an older timestamp than one already seen.
    OutOfOrderRow,
    /// The same key and timestamp arrived twice with different values.
    DuplicateMismatch,
    /// A partition's resolved timestamp went backwards.
    ResolvedRegression,
    /// A row arrived at or below its partition's resolved timestamp.
    RowBehindResolved,
    /// The table rebuilt from the feed differs from the source table.
    FingerprintMismatch,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)
    }
}

/// Checks a stream of feed messages.
pub trait Validator: Send {
    /// Notes a row update.
    fn note_row(&mut self, partition: &str, key: &str, value: &str, updated: Timestamp);

    /// Notes a resolved timestamp. Errors only when the validator cannot do
    /// its job (e.g. the source table is unreadable).
    fn note_resolved(&mut self, partition: &str, resolved: Timestamp) -> Result<()>;

    /// Every violation seen so far.
    fn violations(&self) -> Vec<Violation>;
}

/// Fans every message out to a list of validators.
pub struct Validators(Vec<Box<dyn Validator>>);

impl Validators {
    pub fn new(validators: Vec<Box<dyn Validator>>) -> Self {
        Validators(validators)
    }
}

impl Validator for Validators {
    fn note_row(&mut self, partition: &str, key: &str, value: &str, updated: Timestamp) {
        for v in &mut self.0 {
            v.note_row(partition, key, value, updated);
        }
    }

    fn note_resolved(&mut self, partition: &str, resolved: Timestamp) -> Result<()> {
        for v in &mut self.0 {
            v.note_resolved(partition, resolved)?;
        }
        Ok(())
    }

    fn violations(&self) -> Vec<Violation> {
        self.0.iter().flat_map(|v| v.violations()).collect()
    }
}

/// Wraps a validator and counts what passes through it.
pub struct CountValidator {
    inner: Box<dyn Validator>,
    /// Rows noted.
    pub num_rows: usize,
    /// Resolved timestamps noted.
    pub num_resolved: usize,
    /// Rows that were followed by a resolved timestamp.
    pub num_resolved_rows: usize,
    /// Resolved timestamps that followed at least one row.
    pub num_resolved_with_rows: usize,
    rows_since_resolved: usize,
}

impl CountValidator {
    pub fn new(inner: Box<dyn Validator>) -> Self {
        CountValidator {
            inner,
            num_rows: 0,
            num_resolved: 0,
            num_resolved_rows: 0,
            num_resolved_with_rows: 0,
            rows_since_resolved: 0,
        }
    }

    /// Violation descriptions, one per broken guarantee.
    pub fn failures(&self) -> Vec<String> {
        self.violations().iter().map(|v| v.to_string()).collect()
    }
}

impl Validator for CountValidator {
    fn note_row(&mut self, partition: &str, key: &str, value: &str, updated: Timestamp) {
        self.num_rows += 1;
        self.rows_since_resolved += 1;
        self.inner.note_row(partition, key, value, updated);
    }

    fn note_resolved(&mut self, partition: &str, resolved: Timestamp) -> Result<()> {
        self.num_resolved += 1;
        if self.rows_since_resolved > 0 {
            self.num_resolved_with_rows += 1;
            self.num_resolved_rows += self.rows_since_resolved;
            self.rows_since_resolved = 0;
        }
        self.inner.note_resolved(partition, resolved)
    }

    fn violations(&self) -> Vec<Violation> {
        self.inner.violations()
    }
}

impl fmt::Debug for CountValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountValidator")
            .field("num_rows", &self.num_rows)
            .field("num_resolved", &self.num_resolved)
            .field("num_resolved_rows", &self.num_resolved_rows)
            .field("num_resolved_with_rows", &self.num_resolved_with_rows)
            .field("violations", &self.violations().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: i64) -> Timestamp {
        Timestamp::from_wall(wall)
    }

    #[test]
    fn test_count_validator() {
        let mut v = CountValidator::new(Box::new(Validators::new(Vec::new())));
        v.note_resolved("0", ts(1)).unwrap();
        assert_eq!((v.num_resolved, v.num_resolved_with_rows, v.num_resolved_rows), (1, 0, 0));

        v.note_row("0", "[1]", "{}", ts(2));
        v.note_row("0", "[2]", "{}", ts(2));
        v.note_resolved("0", ts(3)).unwrap();
        assert_eq!(v.num_rows, 2);
        assert_eq!((v.num_resolved, v.num_resolved_with_rows, v.num_resolved_rows), (2, 1, 2));

        // A resolved with no new rows does not count as one with rows.
        v.note_resolved("0", ts(4)).unwrap();
        assert_eq!((v.num_resolved, v.num_resolved_with_rows, v.num_resolved_rows), (3, 1, 2));

        v.note_row("0", "[1]", "{}", ts(5));
        assert_eq!(v.num_resolved_rows, 2);
        assert!(v.failures().is_empty());
    }

    #[test]
    fn test_validators_concatenate_failures() {
        let checks: Vec<Box<dyn Validator>> = vec![
            Box::new(OrderValidator::new("foo")),
            Box::new(ResolvedValidator::new("foo")),
        ];
        let mut v = Validators::new(checks);
        v.note_resolved("0", ts(5)).unwrap();
        v.note_row("0", "[1]", "a", ts(4));
        v.note_row("0", "[1]", "b", ts(3));

        let kinds: Vec<ViolationKind> = v.violations().iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ViolationKind::OutOfOrderRow,
                ViolationKind::RowBehindResolved,
                ViolationKind::RowBehindResolved,
            ]
        );
    }
}
