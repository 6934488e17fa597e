//! Schema change classification for watched tables.
//!
//! A changefeed sees a table event whenever the descriptor of a watched table
//! changes. Some changes are invisible to the feed's output (adding a column
//! without a backfill), some require a new scan boundary, and truncation ends
//! the feed.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hlc::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableEventKind {
    Unknown,
    AddColumnNoBackfill,
    AddColumnWithBackfill,
    DropColumn,
    Truncate,
}

impl fmt::Display for TableEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableEventKind::Unknown => "unknown",
            TableEventKind::AddColumnNoBackfill => "add column (no backfill)",
            TableEventKind::AddColumnWithBackfill => "add column (backfill)",
            TableEventKind::DropColumn => "drop column",
            TableEventKind::Truncate => "truncate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationDirection {
    Add,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationState {
    DeleteOnly,
    DeleteAndWriteOnly,
}

/// A pending schema change on a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub direction: MutationDirection,
    pub state: MutationState,
    /// The mutation adds or drops a column and so needs a backfill.
    pub column: bool,
}

/// The parts of a table descriptor event classification looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub primary_index_id: u32,
    pub mutations: Vec<Mutation>,
}

impl TableDescriptor {
    pub fn has_column_backfill_mutation(&self) -> bool {
        self.mutations.iter().any(|m| m.column)
    }

    fn has_drop_in_write_only(&self) -> bool {
        self.mutations.iter().any(|m| {
            m.direction == MutationDirection::Drop && m.state == MutationState::DeleteAndWriteOnly
        })
    }

    fn has_add_mutation(&self) -> bool {
        self.mutations.iter().any(|m| m.direction == MutationDirection::Add)
    }
}

/// A descriptor change observed at `at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEvent {
    pub before: TableDescriptor,
    pub after: TableDescriptor,
    pub at: Timestamp,
}

impl TableEvent {
    pub fn kind(&self) -> TableEventKind {
        let (before, after) = (&self.before, &self.after);
        let added_columns = before.columns.len() < after.columns.len();
        if added_columns
            && before.has_column_backfill_mutation()
            && !after.has_column_backfill_mutation()
        {
            TableEventKind::AddColumnWithBackfill
        } else if added_columns && !before.has_column_backfill_mutation() {
            TableEventKind::AddColumnNoBackfill
        } else if !before.has_drop_in_write_only() && after.has_drop_in_write_only() {
            // Only the event that introduces the drop counts, so the scan
            // boundary is added once.
            TableEventKind::DropColumn
        } else if before.primary_index_id != after.primary_index_id && !before.has_add_mutation() {
            // A new primary index without a primary key change in flight
            // is how truncation shows up.
            TableEventKind::Truncate
        } else {
            TableEventKind::Unknown
        }
    }
}

/// Which table events a feed may ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaChangeEvents {
    #[default]
    Default,
    ColumnChanges,
}

/// Per-kind policy: `true` means the event is filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEventFilter(HashMap<TableEventKind, bool>);

impl TableEventFilter {
    pub fn new(policy: impl IntoIterator<Item = (TableEventKind, bool)>) -> Self {
        TableEventFilter(policy.into_iter().collect())
    }

    /// Ignores column additions that need no backfill.
    pub fn default_policy() -> Self {
        TableEventFilter::new([
            (TableEventKind::DropColumn, false),
            (TableEventKind::AddColumnWithBackfill, false),
            (TableEventKind::AddColumnNoBackfill, true),
            (TableEventKind::Unknown, true),
        ])
    }

    /// Surfaces every column change.
    pub fn column_changes() -> Self {
        TableEventFilter::new([
            (TableEventKind::DropColumn, false),
            (TableEventKind::AddColumnWithBackfill, false),
            (TableEventKind::AddColumnNoBackfill, false),
            (TableEventKind::Unknown, true),
        ])
    }

    pub fn for_events(events: SchemaChangeEvents) -> Self {
        match events {
            SchemaChangeEvents::Default => TableEventFilter::default_policy(),
            SchemaChangeEvents::ColumnChanges => TableEventFilter::column_changes(),
        }
    }

    /// Whether `event` can be ignored. Truncation is always an error.
    pub fn should_filter(&self, event: &TableEvent) -> Result<bool> {
        let kind = event.kind();
        if kind == TableEventKind::Truncate {
            return Err(Error::TableTruncated(event.before.name.clone()));
        }
        self.0
            .get(&kind)
            .copied()
            .ok_or(Error::UnhandledTableEvent(kind))
    }
}

impl Default for TableEventFilter {
    fn default() -> Self {
        TableEventFilter::default_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(columns: &[&str]) -> TableDescriptor {
        TableDescriptor {
            name: "foo".into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_index_id: 1,
            mutations: Vec::new(),
        }
    }

    fn event(before: TableDescriptor, after: TableDescriptor) -> TableEvent {
        TableEvent {
            before,
            after,
            at: Timestamp::from_wall(1),
        }
    }

    fn backfill() -> Mutation {
        Mutation {
            direction: MutationDirection::Add,
            state: MutationState::DeleteOnly,
            column: true,
        }
    }

    #[test]
    fn test_classify() {
        let e = event(desc(&["id"]), desc(&["id", "a"]));
        assert_eq!(e.kind(), TableEventKind::AddColumnNoBackfill);

        let mut before = desc(&["id"]);
        before.mutations.push(backfill());
        let e = event(before, desc(&["id", "a"]));
        assert_eq!(e.kind(), TableEventKind::AddColumnWithBackfill);

        let mut after = desc(&["id", "a"]);
        after.mutations.push(Mutation {
            direction: MutationDirection::Drop,
            state: MutationState::DeleteAndWriteOnly,
            column: true,
        });
        let e = event(desc(&["id", "a"]), after.clone());
        assert_eq!(e.kind(), TableEventKind::DropColumn);
        // Already dropping before: not a new drop.
        assert_eq!(event(after.clone(), after).kind(), TableEventKind::Unknown);

        let mut truncated = desc(&["id"]);
        truncated.primary_index_id = 2;
        assert_eq!(event(desc(&["id"]), truncated).kind(), TableEventKind::Truncate);
    }

    #[test]
    fn test_primary_key_change_is_not_truncate() {
        let mut before = desc(&["id"]);
        before.mutations.push(Mutation {
            direction: MutationDirection::Add,
            state: MutationState::DeleteAndWriteOnly,
            column: false,
        });
        let mut after = desc(&["id"]);
        after.primary_index_id = 2;
        assert_eq!(event(before, after).kind(), TableEventKind::Unknown);
    }

    #[test]
    fn test_policies() {
        let add = event(desc(&["id"]), desc(&["id", "a"]));
        assert!(TableEventFilter::default().should_filter(&add).unwrap());
        assert!(!TableEventFilter::for_events(SchemaChangeEvents::ColumnChanges)
            .should_filter(&add)
            .unwrap());

        let mut truncated = desc(&["id"]);
        truncated.primary_index_id = 2;
        let err = TableEventFilter::default()
            .should_filter(&event(desc(&["id"]), truncated))
            .unwrap_err();
        assert_eq!(err.to_string(), "\"foo\" was truncated");

        let partial = TableEventFilter::new([(TableEventKind::Unknown, true)]);
        assert!(matches!(
            partial.should_filter(&add),
            Err(Error::UnhandledTableEvent(TableEventKind::AddColumnNoBackfill))
        ));
    }
}
