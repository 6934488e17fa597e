use std::collections::HashMap;

use crate::error::Result;
use crate::hlc::Timestamp;
use crate::validator::{Validator, Violation, ViolationKind};

/// Checks that each key's updates arrive in timestamp order on its partition.
///
/// Replays of an update already seen are fine as long as they carry the
/// same value.
pub struct OrderValidator {
    topic: String,
    /// (partition, key) -> (updated, value), sorted by updated.
    seen: HashMap<(String, String), Vec<(Timestamp, String)>>,
    violations: Vec<Violation>,
}

impl OrderValidator {
    pub fn new(topic: impl Into<String>) -> Self {
        OrderValidator {
            topic: topic.into(),
            seen: HashMap::new(),
            violations: Vec::new(),
        }
    }
}

impl Validator for OrderValidator {
    fn note_row(&mut self, partition: &str, key: &str, value: &str, updated: Timestamp) {
        let history = self
            .seen
            .entry((partition.to_string(), key.to_string()))
            .or_default();

        let idx = history.partition_point(|(ts, _)| *ts < updated);
        if let Some((ts, prev)) = history.get(idx) {
            if *ts == updated {
                if prev != value {
                    self.violations.push(Violation {
                        kind: ViolationKind::DuplicateMismatch,
                        description: format!(
                            "topic {} partition {}: saw new row timestamp {} twice for key {} with different values: {} vs {}",
                            self.topic, partition, updated, key, prev, value
                        ),
                    });
                }
                return;
            }
        }

        if let Some((latest, _)) = history.last() {
            if updated < *latest {
                self.violations.push(Violation {
                    kind: ViolationKind::OutOfOrderRow,
                    description: format!(
                        "topic {} partition {}: saw new row timestamp {} after {} was seen for key {}",
                        self.topic, partition, updated, latest, key
                    ),
                });
            }
        }
        history.insert(idx, (updated, value.to_string()));
    }

    fn note_resolved(&mut self, _partition: &str, _resolved: Timestamp) -> Result<()> {
        Ok(())
    }

    fn violations(&self) -> Vec<Violation> {
        self.violations.clone()
    }
}
