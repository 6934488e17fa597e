use std::collections::HashMap;

use crate::error::Result;
use crate::hlc::Timestamp;
use crate::validator::{Validator, Violation, ViolationKind};

/// Checks resolved timestamps: monotonic per partition, and never followed
/// by a row at or below them on the same partition.
pub struct ResolvedValidator {
    topic: String,
    resolved: HashMap<String, Timestamp>,
    violations: Vec<Violation>,
}

impl ResolvedValidator {
    pub fn new(topic: impl Into<String>) -> Self {
        ResolvedValidator {
            topic: topic.into(),
            resolved: HashMap::new(),
            violations: Vec::new(),
        }
    }
}

impl Validator for ResolvedValidator {
    fn note_row(&mut self, partition: &str, key: &str, _value: &str, updated: Timestamp) {
        if let Some(resolved) = self.resolved.get(partition) {
            if updated <= *resolved {
                self.violations.push(Violation {
                    kind: ViolationKind::RowBehindResolved,
                    description: format!(
                        "topic {} partition {}: saw new row timestamp {} after {} was resolved (key {})",
                        self.topic, partition, updated, resolved, key
                    ),
                });
            }
        }
    }

    fn note_resolved(&mut self, partition: &str, resolved: Timestamp) -> Result<()> {
        let prev = self.resolved.entry(partition.to_string()).or_default();
        if resolved < *prev {
            self.violations.push(Violation {
                kind: ViolationKind::ResolvedRegression,
                description: format!(
                    "topic {} partition {}: saw resolved timestamp {} after {} was resolved",
                    self.topic, partition, resolved, prev
                ),
            });
            return Ok(());
        }
        *prev = resolved;
        Ok(())
    }

    fn violations(&self) -> Vec<Violation> {
        self.violations.clone()
    }
}
