//! The database surface the nemesis and the fingerprint validator drive.
//!
//! Tables used by the harness have an integer primary key `id` and a string
//! column `ts` holding the commit's logical timestamp.

use serde_json::Value;

use crate::error::Result;
use crate::hlc::Timestamp;

/// A row read back from a table: its key as rendered by feeds (`[<id>]`) and
/// its columns as a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub key: String,
    pub value: Value,
}

/// The row an upsert wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertedRow {
    pub id: i64,
    pub ts: String,
}

pub trait Cluster: Send + Sync {
    /// `CREATE TABLE <table> (id INT PRIMARY KEY, ts STRING)`.
    fn create_table(&self, table: &str) -> Result<()>;

    /// Turns automatic range merging on or off.
    fn set_range_merges(&self, enabled: bool) -> Result<()>;

    /// `ALTER TABLE <table> SPLIT AT VALUES (<key>)`.
    fn split_at(&self, table: &str, key: i64) -> Result<()>;

    /// Starts a write transaction.
    fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// High-priority read of every row of `table`. Pushes the timestamp of
    /// any conflicting writer above the read.
    fn push(&self, table: &str) -> Result<()>;

    /// High-priority `DELETE ... RETURNING`. Aborts conflicting writers and
    /// returns how many rows were deleted.
    fn delete_all(&self, table: &str) -> Result<usize>;

    fn count_rows(&self, table: &str) -> Result<usize>;

    /// Every row of `table` as of `ts`, in key order.
    fn scan_as_of(&self, table: &str, ts: Timestamp) -> Result<Vec<TableRow>>;
}

pub trait Transaction: Send {
    /// `UPSERT INTO <table> VALUES (<id>, cluster_logical_timestamp())`.
    fn upsert(&mut self, table: &str, id: i64) -> Result<UpsertedRow>;

    /// Fails with `Error::TxnRetry` if a high-priority writer aborted it.
    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}
