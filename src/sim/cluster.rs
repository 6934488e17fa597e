//! In-memory MVCC cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cluster::{Cluster, TableRow, Transaction, UpsertedRow};
use crate::error::{Error, Result};
use crate::feed::JobControl;
use crate::hlc::Timestamp;

/// One committed version of a row. `row` is `None` for a deletion.
#[derive(Debug, Clone)]
pub(crate) struct Version {
    pub ts: Timestamp,
    pub row: Option<Value>,
}

#[derive(Debug, Default)]
pub(crate) struct SimTable {
    /// id -> versions, oldest first.
    pub versions: BTreeMap<i64, Vec<Version>>,
    pub splits: BTreeSet<i64>,
}

impl SimTable {
    /// Latest version of each row at or below `ts`.
    pub fn as_of(&self, ts: Timestamp) -> impl Iterator<Item = (i64, &Version)> + '_ {
        self.versions.iter().filter_map(move |(id, versions)| {
            versions.iter().rev().find(|v| v.ts <= ts).map(|v| (*id, v))
        })
    }
}

#[derive(Debug)]
pub(crate) struct OpenTxn {
    pub id: u64,
    /// Provisional commit timestamp, fixed by the first write.
    pub write_ts: Option<Timestamp>,
    pub writes: Vec<(String, i64, Value)>,
    /// Set when a high-priority reader moved `write_ts`.
    pub pushed: bool,
    /// Set when a high-priority writer aborted the transaction.
    pub aborted: bool,
}

impl OpenTxn {
    /// The intent still blocks resolved timestamps and readers.
    pub fn live_write_ts(&self) -> Option<Timestamp> {
        if self.aborted {
            None
        } else {
            self.write_ts
        }
    }
}

/// Status of a changefeed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Paused,
    Canceled,
    Failed,
}

#[derive(Debug)]
pub(crate) struct SimJob {
    pub status: JobStatus,
    pub error: Option<String>,
    /// Last resolved timestamp the job wrote to its sink.
    pub checkpoint: Option<Timestamp>,
    /// Set by resume; the producer rewinds to `checkpoint` before its next
    /// poll.
    pub restart: bool,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    last: Timestamp,
    pub tables: BTreeMap<String, SimTable>,
    pub txn: Option<OpenTxn>,
    next_txn: u64,
    range_merges: bool,
    pub jobs: BTreeMap<i64, SimJob>,
    next_job: i64,
}

impl State {
    /// Reads the hybrid logical clock. Strictly increasing.
    pub fn now(&mut self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        if wall > self.last.wall_time {
            self.last = Timestamp::from_wall(wall);
        } else {
            self.last = self.last.next();
        }
        self.last
    }

    /// Pushes a conflicting intent above `ts`. Returns true if it moved.
    pub fn push_intent(&mut self, table: &str, ts: Timestamp) -> bool {
        let now = self.now();
        let Some(txn) = &mut self.txn else {
            return false;
        };
        let conflicts = txn.writes.iter().any(|(t, _, _)| t == table);
        match txn.live_write_ts() {
            Some(write_ts) if conflicts && write_ts <= ts => {
                txn.write_ts = Some(now);
                txn.pushed = true;
                true
            }
            _ => false,
        }
    }

    fn table(&mut self, table: &str) -> Result<&mut SimTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| Error::Database(format!("relation {:?} does not exist", table)))
    }

    fn job(&mut self, job_id: i64) -> Result<&mut SimJob> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::Database(format!("job {} not found", job_id)))
    }
}

/// A simulated single-node cluster. Cheap to clone; clones share state.
#[derive(Clone, Debug, Default)]
pub struct SimCluster {
    state: Arc<Mutex<State>>,
}

impl SimCluster {
    pub fn new() -> Self {
        SimCluster::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current clock reading.
    pub fn now(&self) -> Timestamp {
        self.lock().now()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains_key(table)
    }

    pub fn range_merges_enabled(&self) -> bool {
        self.lock().range_merges
    }

    pub fn splits(&self, table: &str) -> Vec<i64> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.splits.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Registers a running changefeed job.
    pub(crate) fn start_job(&self) -> i64 {
        let mut state = self.lock();
        state.next_job += 1;
        let job_id = state.next_job;
        state.jobs.insert(
            job_id,
            SimJob {
                status: JobStatus::Running,
                error: None,
                checkpoint: None,
                restart: false,
            },
        );
        job_id
    }

    pub fn job_status(&self, job_id: i64) -> Option<JobStatus> {
        self.lock().jobs.get(&job_id).map(|j| j.status)
    }

    /// Fails a job as if its sink had returned `message`.
    pub fn fail_job(&self, job_id: i64, message: &str) {
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            info!(job_id, error = message, "failing job");
            job.status = JobStatus::Failed;
            job.error = Some(message.to_string());
        }
    }

    pub(crate) fn checkpoint_job(&self, job_id: i64, resolved: Timestamp) {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.checkpoint = Some(resolved);
        }
    }

    /// Cancels every job still running or paused.
    pub fn shutdown(&self) {
        for job in self.lock().jobs.values_mut() {
            if matches!(job.status, JobStatus::Running | JobStatus::Paused) {
                job.status = JobStatus::Canceled;
            }
        }
    }
}

impl Cluster for SimCluster {
    fn create_table(&self, table: &str) -> Result<()> {
        let mut state = self.lock();
        if state.tables.contains_key(table) {
            return Err(Error::Database(format!("relation {:?} already exists", table)));
        }
        state.tables.insert(table.to_string(), SimTable::default());
        Ok(())
    }

    fn set_range_merges(&self, enabled: bool) -> Result<()> {
        self.lock().range_merges = enabled;
        Ok(())
    }

    fn split_at(&self, table: &str, key: i64) -> Result<()> {
        let mut state = self.lock();
        let added = state.table(table)?.splits.insert(key);
        debug!(table, key, added, "split");
        Ok(())
    }

    fn begin(&self) -> Result<Box<dyn Transaction>> {
        let mut state = self.lock();
        if state.txn.is_some() {
            return Err(Error::Database("another transaction is open".into()));
        }
        state.next_txn += 1;
        let id = state.next_txn;
        state.txn = Some(OpenTxn {
            id,
            write_ts: None,
            writes: Vec::new(),
            pushed: false,
            aborted: false,
        });
        Ok(Box::new(SimTxn {
            cluster: self.clone(),
            id,
            finished: false,
        }))
    }

    fn push(&self, table: &str) -> Result<()> {
        let mut state = self.lock();
        state.table(table)?;
        let read_ts = state.now();
        if state.push_intent(table, read_ts) {
            debug!(table, %read_ts, "pushed open transaction");
        }
        Ok(())
    }

    fn delete_all(&self, table: &str) -> Result<usize> {
        let mut state = self.lock();
        state.table(table)?;
        if let Some(txn) = &mut state.txn {
            if !txn.aborted && txn.writes.iter().any(|(t, _, _)| t == table) {
                txn.aborted = true;
                txn.writes.clear();
                debug!(table, txn = txn.id, "aborted open transaction");
            }
        }
        let ts = state.now();
        let t = state.table(table)?;
        let live: Vec<i64> = t
            .as_of(ts)
            .filter(|(_, v)| v.row.is_some())
            .map(|(id, _)| id)
            .collect();
        for id in &live {
            t.versions.entry(*id).or_default().push(Version { ts, row: None });
        }
        Ok(live.len())
    }

    fn count_rows(&self, table: &str) -> Result<usize> {
        let mut state = self.lock();
        let ts = state.now();
        Ok(state.table(table)?.as_of(ts).filter(|(_, v)| v.row.is_some()).count())
    }

    fn scan_as_of(&self, table: &str, ts: Timestamp) -> Result<Vec<TableRow>> {
        let mut state = self.lock();
        let rows = state
            .table(table)?
            .as_of(ts)
            .filter_map(|(id, v)| {
                v.row.as_ref().map(|row| TableRow {
                    key: format!("[{}]", id),
                    value: row.clone(),
                })
            })
            .collect();
        Ok(rows)
    }
}

impl JobControl for SimCluster {
    fn pause_job(&self, job_id: i64) -> Result<()> {
        let mut state = self.lock();
        let job = state.job(job_id)?;
        match job.status {
            JobStatus::Running | JobStatus::Paused => {
                job.status = JobStatus::Paused;
                Ok(())
            }
            status => Err(Error::Database(format!(
                "job {} with status {:?} cannot be paused",
                job_id, status
            ))),
        }
    }

    fn resume_job(&self, job_id: i64) -> Result<()> {
        let mut state = self.lock();
        let job = state.job(job_id)?;
        match job.status {
            JobStatus::Paused => {
                job.status = JobStatus::Running;
                job.restart = true;
                Ok(())
            }
            JobStatus::Running => Ok(()),
            status => Err(Error::Database(format!(
                "job {} with status {:?} cannot be resumed",
                job_id, status
            ))),
        }
    }

    fn cancel_job(&self, job_id: i64) -> Result<()> {
        let mut state = self.lock();
        let job = state.job(job_id)?;
        match job.status {
            JobStatus::Running | JobStatus::Paused => {
                job.status = JobStatus::Canceled;
                Ok(())
            }
            status => Err(Error::Database(format!(
                "job {} with status {:?} cannot be canceled",
                job_id, status
            ))),
        }
    }

    fn job_error(&self, job_id: i64) -> Result<Option<String>> {
        let mut state = self.lock();
        let job = state.job(job_id)?;
        Ok(match job.status {
            JobStatus::Failed => job.error.clone(),
            _ => None,
        })
    }
}

/// The client side of an open transaction. Dropping it rolls back.
struct SimTxn {
    cluster: SimCluster,
    id: u64,
    finished: bool,
}

impl SimTxn {
    fn finish(&mut self) -> Option<OpenTxn> {
        self.finished = true;
        let mut state = self.cluster.lock();
        match &state.txn {
            Some(txn) if txn.id == self.id => state.txn.take(),
            _ => None,
        }
    }
}

impl Transaction for SimTxn {
    fn upsert(&mut self, table: &str, id: i64) -> Result<UpsertedRow> {
        let mut state = self.cluster.lock();
        state.table(table)?;
        let now = state.now();
        let txn = match &mut state.txn {
            Some(txn) if txn.id == self.id => txn,
            _ => return Err(Error::Database("transaction is no longer open".into())),
        };
        if txn.aborted {
            return Err(Error::TxnRetry("TransactionAbortedError(ABORT_REASON_ABORTED_RECORD_FOUND)".into()));
        }
        let ts = *txn.write_ts.get_or_insert(now);
        let row = UpsertedRow {
            id,
            ts: ts.to_string(),
        };
        txn.writes
            .push((table.to_string(), id, json!({"id": id, "ts": row.ts})));
        Ok(row)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let Some(txn) = self.finish() else {
            return Err(Error::Database("transaction is no longer open".into()));
        };
        if txn.aborted {
            return Err(Error::TxnRetry("TransactionAbortedError(ABORT_REASON_ABORTED_RECORD_FOUND)".into()));
        }
        if txn.pushed {
            // The rows embed the original commit timestamp.
            return Err(Error::TxnRetry("TransactionRetryError: RETRY_SERIALIZABLE".into()));
        }
        let Some(ts) = txn.write_ts else {
            return Ok(());
        };
        let mut state = self.cluster.lock();
        for (table, id, row) in txn.writes {
            state
                .table(&table)?
                .versions
                .entry(id)
                .or_default()
                .push(Version { ts, row: Some(row) });
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish();
        Ok(())
    }
}

impl Drop for SimTxn {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> SimCluster {
        let c = SimCluster::new();
        c.create_table("foo").unwrap();
        c
    }

    fn commit_row(c: &SimCluster, id: i64) -> UpsertedRow {
        let mut txn = c.begin().unwrap();
        let row = txn.upsert("foo", id).unwrap();
        txn.commit().unwrap();
        row
    }

    #[test]
    fn test_commit_and_scan_as_of() {
        let c = cluster();
        let first = commit_row(&c, 1);
        let between = c.now();
        commit_row(&c, 2);

        let rows = c.scan_as_of("foo", between).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "[1]");
        assert_eq!(rows[0].value, json!({"id": 1, "ts": first.ts}));
        assert_eq!(c.count_rows("foo").unwrap(), 2);
    }

    #[test]
    fn test_rollback_and_drop_discard_writes() {
        let c = cluster();
        let mut txn = c.begin().unwrap();
        txn.upsert("foo", 1).unwrap();
        txn.rollback().unwrap();

        let mut txn = c.begin().unwrap();
        txn.upsert("foo", 1).unwrap();
        drop(txn);

        assert_eq!(c.count_rows("foo").unwrap(), 0);
        assert!(c.lock().txn.is_none());
    }

    #[test]
    fn test_one_open_transaction() {
        let c = cluster();
        let _txn = c.begin().unwrap();
        assert!(matches!(c.begin(), Err(Error::Database(_))));
    }

    #[test]
    fn test_push_forces_retry() {
        let c = cluster();
        let mut txn = c.begin().unwrap();
        txn.upsert("foo", 1).unwrap();
        c.push("foo").unwrap();
        let err = txn.commit().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(c.count_rows("foo").unwrap(), 0);
    }

    #[test]
    fn test_delete_all_aborts_writer() {
        let c = cluster();
        commit_row(&c, 1);
        commit_row(&c, 2);
        let mut txn = c.begin().unwrap();
        txn.upsert("foo", 3).unwrap();

        assert_eq!(c.delete_all("foo").unwrap(), 2);
        assert!(txn.commit().unwrap_err().is_retryable());
        assert_eq!(c.count_rows("foo").unwrap(), 0);
        assert_eq!(c.delete_all("foo").unwrap(), 0);
    }

    #[test]
    fn test_splits_and_settings() {
        let c = cluster();
        c.set_range_merges(false).unwrap();
        c.split_at("foo", 2).unwrap();
        c.split_at("foo", 2).unwrap();
        c.split_at("foo", 0).unwrap();
        assert_eq!(c.splits("foo"), vec![0, 2]);
        assert!(!c.range_merges_enabled());
        assert!(c.split_at("bar", 1).is_err());
    }

    #[test]
    fn test_job_lifecycle() {
        let c = cluster();
        let id = c.start_job();
        c.pause_job(id).unwrap();
        assert_eq!(c.job_status(id), Some(JobStatus::Paused));
        c.resume_job(id).unwrap();
        assert_eq!(c.job_status(id), Some(JobStatus::Running));
        assert_eq!(c.job_error(id).unwrap(), None);

        c.fail_job(id, "sink unavailable");
        assert_eq!(c.job_error(id).unwrap().as_deref(), Some("sink unavailable"));
        assert!(c.resume_job(id).is_err());
        assert!(c.cancel_job(id).is_err());
        assert!(c.job_error(42).is_err());
    }
}
