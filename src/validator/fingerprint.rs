//! Rebuilds the watched table from the feed and compares it with the source.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::span::{Span, SpanFrontier};
use crate::validator::{Validator, Violation, ViolationKind};

struct BufferedRow {
    key: String,
    value: String,
    updated: Timestamp,
}

/// Applies rows to a shadow copy of the table once every partition has
/// resolved past them, and checks the shadow against the source table read
/// as of each applied timestamp.
///
/// For the shadow to match at an update timestamp `t`, the feed must have
/// delivered every change at or below `t`; a lost or misordered update shows
/// up as a fingerprint mismatch.
pub struct FingerprintValidator {
    cluster: Arc<dyn Cluster>,
    table: String,
    /// One span per partition; its frontier is the cluster-wide resolved.
    partitions: SpanFrontier,
    resolved: Timestamp,
    buffer: Vec<BufferedRow>,
    /// Primary key (as rendered by feeds) -> row columns.
    shadow: BTreeMap<String, Value>,
    violations: Vec<Violation>,
}

impl FingerprintValidator {
    pub fn new(cluster: Arc<dyn Cluster>, table: impl Into<String>, partitions: &[String]) -> Self {
        let spans = partitions.iter().map(|p| partition_span(p));
        FingerprintValidator {
            cluster,
            table: table.into(),
            partitions: SpanFrontier::new(spans),
            resolved: Timestamp::ZERO,
            buffer: Vec::new(),
            shadow: BTreeMap::new(),
            violations: Vec::new(),
        }
    }

    fn apply(&mut self, row: &BufferedRow) -> Result<()> {
        let parsed: Value = serde_json::from_str(&row.value)?;
        match parsed.get("after") {
            None => {
                return Err(Error::Decode(format!("row without `after`: {}", row.value)));
            }
            Some(Value::Null) => {
                self.shadow.remove(&row.key);
            }
            Some(after) => {
                self.shadow.insert(row.key.clone(), after.clone());
            }
        }
        Ok(())
    }

    /// Compares the shadow with the source table as of `ts`.
    fn check(&mut self, ts: Timestamp) -> Result<()> {
        let source: BTreeMap<String, Value> = self
            .cluster
            .scan_as_of(&self.table, ts)?
            .into_iter()
            .map(|row| (row.key, row.value))
            .collect();
        let expected = fingerprint(&source);
        let actual = fingerprint(&self.shadow);
        if expected != actual {
            self.violations.push(Violation {
                kind: ViolationKind::FingerprintMismatch,
                description: format!(
                    "fingerprints did not match at {}: {} (source, {} rows) vs {} (feed, {} rows)",
                    ts,
                    expected.to_hex(),
                    source.len(),
                    actual.to_hex(),
                    self.shadow.len()
                ),
            });
        }
        Ok(())
    }

    /// Applies every buffered row at or below `resolved`, checking before
    /// and after each distinct update timestamp.
    fn move_to(&mut self, resolved: Timestamp) -> Result<()> {
        self.buffer.sort_by(|a, b| a.updated.cmp(&b.updated));
        let ready = self.buffer.partition_point(|row| row.updated <= resolved);
        let rows: Vec<BufferedRow> = self.buffer.drain(..ready).collect();
        debug!(table = %self.table, %resolved, rows = rows.len(), "fingerprinting");

        let mut last_applied: Option<Timestamp> = None;
        for group in rows.chunk_by(|a, b| a.updated == b.updated) {
            let updated = group[0].updated;
            if let Some(last) = last_applied {
                if last < updated.prev() {
                    // Nothing changed in between, so the source must still
                    // match just before this update.
                    self.check(updated.prev())?;
                }
            }
            for row in group {
                self.apply(row)?;
            }
            self.check(updated)?;
            last_applied = Some(updated);
        }
        if last_applied != Some(resolved) {
            self.check(resolved)?;
        }
        Ok(())
    }
}

/// The span holding exactly the key `partition`.
fn partition_span(partition: &str) -> Span {
    let mut end_key = partition.as_bytes().to_vec();
    end_key.push(0);
    Span::new(partition.as_bytes(), end_key)
}

fn fingerprint(rows: &BTreeMap<String, Value>) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for (key, value) in rows {
        hasher.update(key.as_bytes());
        hasher.update(b"\0");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize()
}

impl Validator for FingerprintValidator {
    fn note_row(&mut self, _partition: &str, key: &str, value: &str, updated: Timestamp) {
        self.buffer.push(BufferedRow {
            key: key.to_string(),
            value: value.to_string(),
            updated,
        });
    }

    fn note_resolved(&mut self, partition: &str, resolved: Timestamp) -> Result<()> {
        if !self.partitions.forward(&partition_span(partition), resolved) {
            return Ok(());
        }
        let frontier = self.partitions.frontier();
        if frontier <= self.resolved {
            return Ok(());
        }
        self.resolved = frontier;
        self.move_to(frontier)
    }

    fn violations(&self) -> Vec<Violation> {
        self.violations.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{TableRow, Transaction};
    use serde_json::json;
    use std::sync::Mutex;

    /// Source table double: a list of (ts, id, row-or-delete) versions.
    #[derive(Default)]
    struct History {
        versions: Mutex<Vec<(Timestamp, i64, Option<Value>)>>,
        scans: Mutex<Vec<Timestamp>>,
    }

    impl History {
        fn write(&self, wall: i64, id: i64) {
            self.versions.lock().unwrap().push((
                Timestamp::from_wall(wall),
                id,
                Some(json!({"id": id, "ts": wall.to_string()})),
            ));
        }

        fn delete(&self, wall: i64, id: i64) {
            self.versions.lock().unwrap().push((Timestamp::from_wall(wall), id, None));
        }
    }

    impl Cluster for History {
        fn create_table(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn set_range_merges(&self, _: bool) -> Result<()> {
            Ok(())
        }
        fn split_at(&self, _: &str, _: i64) -> Result<()> {
            Ok(())
        }
        fn begin(&self) -> Result<Box<dyn Transaction>> {
            Err(Error::Database("read only".into()))
        }
        fn push(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn delete_all(&self, _: &str) -> Result<usize> {
            Ok(0)
        }
        fn count_rows(&self, _: &str) -> Result<usize> {
            Ok(0)
        }
        fn scan_as_of(&self, _: &str, ts: Timestamp) -> Result<Vec<TableRow>> {
            self.scans.lock().unwrap().push(ts);
            let mut rows: BTreeMap<i64, Option<Value>> = BTreeMap::new();
            for (v_ts, id, row) in self.versions.lock().unwrap().iter() {
                if *v_ts <= ts {
                    rows.insert(*id, row.clone());
                }
            }
            Ok(rows
                .into_iter()
                .filter_map(|(id, row)| row.map(|value| TableRow { key: format!("[{}]", id), value }))
                .collect())
        }
    }

    fn row_value(wall: i64, id: i64) -> String {
        json!({"after": {"id": id, "ts": wall.to_string()}, "updated": format!("{}.0000000000", wall)})
            .to_string()
    }

    fn delete_value(wall: i64) -> String {
        json!({"after": null, "updated": format!("{}.0000000000", wall)}).to_string()
    }

    fn partitions() -> Vec<String> {
        vec!["0".into(), "1".into()]
    }

    #[test]
    fn test_matching_feed() {
        let source = Arc::new(History::default());
        source.write(1, 1);
        source.write(2, 2);
        source.delete(3, 1);

        let mut v = FingerprintValidator::new(source.clone(), "foo", &partitions());
        v.note_row("0", "[1]", &row_value(1, 1), Timestamp::from_wall(1));
        v.note_row("1", "[2]", &row_value(2, 2), Timestamp::from_wall(2));
        v.note_row("0", "[1]", &delete_value(3), Timestamp::from_wall(3));

        // Only one partition resolved: nothing is applied yet.
        v.note_resolved("0", Timestamp::from_wall(4)).unwrap();
        assert!(source.scans.lock().unwrap().is_empty());

        v.note_resolved("1", Timestamp::from_wall(4)).unwrap();
        assert!(v.violations().is_empty());
        let scans = source.scans.lock().unwrap().clone();
        assert_eq!(scans.first(), Some(&Timestamp::from_wall(1)));
        assert_eq!(scans.last(), Some(&Timestamp::from_wall(4)));
    }

    #[test]
    fn test_missed_update_is_caught() {
        let source = Arc::new(History::default());
        source.write(1, 1);
        source.write(2, 2);

        let mut v = FingerprintValidator::new(source, "foo", &partitions());
        // The feed lost the update to key 2.
        v.note_row("0", "[1]", &row_value(1, 1), Timestamp::from_wall(1));
        v.note_resolved("0", Timestamp::from_wall(3)).unwrap();
        v.note_resolved("1", Timestamp::from_wall(3)).unwrap();

        let violations = v.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::FingerprintMismatch);
        assert!(violations[0].description.contains("at 3.0000000000"));
    }

    #[test]
    fn test_rows_above_resolved_stay_buffered() {
        let source = Arc::new(History::default());
        source.write(1, 1);
        source.write(5, 2);

        let mut v = FingerprintValidator::new(source.clone(), "foo", &["".to_string()]);
        v.note_row("", "[1]", &row_value(1, 1), Timestamp::from_wall(1));
        v.note_row("", "[2]", &row_value(5, 2), Timestamp::from_wall(5));
        v.note_resolved("", Timestamp::from_wall(2)).unwrap();
        assert!(v.violations().is_empty());
        assert_eq!(v.buffer.len(), 1);

        // A repeated resolved does not fingerprint again.
        let scans = source.scans.lock().unwrap().len();
        v.note_resolved("", Timestamp::from_wall(2)).unwrap();
        assert_eq!(source.scans.lock().unwrap().len(), scans);

        v.note_resolved("", Timestamp::from_wall(6)).unwrap();
        assert!(v.violations().is_empty());
        assert!(v.buffer.is_empty());
    }
}
