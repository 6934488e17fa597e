//! Changefeed producer over the simulated cluster.
//!
//! A producer first emits every live row as of its scan timestamp, then on
//! each poll every committed version above its high-water mark and at or
//! below the closed timestamp, followed by that closed timestamp as resolved.
//! The closed timestamp never reaches an open intent, so a later commit
//! cannot land at or below a resolved timestamp already emitted.

use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::context::Context;
use crate::error::Result;
use crate::hlc::Timestamp;
use crate::sim::cluster::{JobStatus, SimCluster};

/// One row change ready to be encoded for a sink.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChangeRow {
    pub id: i64,
    pub updated: Timestamp,
    pub after: Option<Value>,
}

impl ChangeRow {
    /// Key as feeds render it.
    pub fn key(&self) -> Vec<u8> {
        format!("[{}]", self.id).into_bytes()
    }

    /// JSON envelope. `with_key` adds the key to the value for sinks that
    /// carry no separate key.
    pub fn value(&self, with_updated: bool, with_key: bool) -> Vec<u8> {
        let mut envelope = json!({ "after": self.after.clone().unwrap_or(Value::Null) });
        if with_key {
            envelope["key"] = json!([self.id]);
        }
        if with_updated {
            envelope["updated"] = Value::String(self.updated.to_string());
        }
        envelope.to_string().into_bytes()
    }

    /// Partition among `n`, by key hash.
    pub fn partition(&self, n: usize) -> usize {
        crc32c::crc32c(&self.key()) as usize % n.max(1)
    }
}

/// Payload of a resolved timestamp message.
pub(crate) fn resolved_payload(ts: Timestamp) -> Vec<u8> {
    json!({ "resolved": ts.to_string() }).to_string().into_bytes()
}

/// Output of one poll.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    pub rows: Vec<ChangeRow>,
    pub resolved: Option<Timestamp>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.resolved.is_none()
    }
}

/// Where a producer is in the table's history.
#[derive(Debug, Clone)]
pub(crate) struct Cursor {
    pub table: String,
    pub scan_ts: Timestamp,
    pub scanned: bool,
    /// Everything at or below this has been emitted.
    pub high_water: Timestamp,
    pub emit_resolved: bool,
}

impl Cursor {
    pub fn new(table: &str, scan_ts: Timestamp, emit_resolved: bool) -> Self {
        Cursor {
            table: table.to_string(),
            scan_ts,
            scanned: false,
            high_water: Timestamp::ZERO,
            emit_resolved,
        }
    }

    /// Restarts after `resolved`, replaying `overlap` worth of history before
    /// it. Never replays below the initial scan, whose rows were emitted at
    /// the scan timestamp rather than their own.
    pub fn rewind(&mut self, resolved: Option<Timestamp>, overlap: Duration) {
        match resolved {
            Some(resolved) => {
                let overlap_ns = i64::try_from(overlap.as_nanos()).unwrap_or(i64::MAX);
                let replay = Timestamp::from_wall(resolved.wall_time.saturating_sub(overlap_ns));
                self.scanned = true;
                self.high_water = replay.max(self.scan_ts);
            }
            None => {
                self.scanned = false;
                self.high_water = Timestamp::ZERO;
            }
        }
    }
}

impl SimCluster {
    /// Advances `cursor` and returns what it should emit.
    pub(crate) fn poll(&self, cursor: &mut Cursor) -> Result<Batch> {
        let mut state = self.lock();
        let mut batch = Batch::default();

        if !cursor.scanned {
            // The scan reads at `scan_ts`; an older intent is pushed out of
            // the way instead of waited on.
            if state.push_intent(&cursor.table, cursor.scan_ts) {
                debug!(table = %cursor.table, scan_ts = %cursor.scan_ts, "initial scan pushed open transaction");
            }
            let table = match state.tables.get(&cursor.table) {
                Some(table) => table,
                None => return Ok(batch),
            };
            batch.rows = table
                .as_of(cursor.scan_ts)
                .filter_map(|(id, v)| {
                    v.row.as_ref().map(|row| ChangeRow {
                        id,
                        updated: cursor.scan_ts,
                        after: Some(row.clone()),
                    })
                })
                .collect();
            cursor.scanned = true;
            cursor.high_water = cursor.scan_ts;
        }

        let mut closed = state.now();
        if let Some(write_ts) = state.txn.as_ref().and_then(|txn| txn.live_write_ts()) {
            closed = closed.min(write_ts.prev());
        }
        if closed <= cursor.high_water {
            return Ok(batch);
        }

        if let Some(table) = state.tables.get(&cursor.table) {
            let high_water = cursor.high_water;
            let mut changes: Vec<ChangeRow> = table
                .versions
                .iter()
                .flat_map(move |(id, versions)| {
                    versions
                        .iter()
                        .filter(move |v| v.ts > high_water && v.ts <= closed)
                        .map(move |v| ChangeRow {
                            id: *id,
                            updated: v.ts,
                            after: v.row.clone(),
                        })
                })
                .collect();
            changes.sort_by(|a, b| (a.updated, a.id).cmp(&(b.updated, b.id)));
            batch.rows.extend(changes);
        }
        cursor.high_water = closed;
        if cursor.emit_resolved {
            batch.resolved = Some(closed);
        }
        trace!(table = %cursor.table, rows = batch.rows.len(), %closed, "poll");
        Ok(batch)
    }

    /// Runs a job's producer on its own thread until the job stops.
    pub(crate) fn spawn_job<S>(
        &self,
        job_id: i64,
        mut cursor: Cursor,
        mut sink: S,
        poll_interval: Duration,
        replay_overlap: Duration,
    ) -> thread::JoinHandle<()>
    where
        S: FnMut(Batch) -> Result<()> + Send + 'static,
    {
        let cluster = self.clone();
        thread::spawn(move || loop {
            let restart = {
                let mut state = cluster.lock();
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    return;
                };
                match job.status {
                    JobStatus::Running => {}
                    JobStatus::Paused => {
                        drop(state);
                        thread::sleep(poll_interval);
                        continue;
                    }
                    JobStatus::Canceled | JobStatus::Failed => {
                        debug!(job_id, status = ?job.status, "producer stopping");
                        return;
                    }
                }
                std::mem::take(&mut job.restart).then_some(job.checkpoint)
            };
            if let Some(checkpoint) = restart {
                debug!(job_id, ?checkpoint, "producer restarting");
                cursor.rewind(checkpoint, replay_overlap);
            }

            match cluster.poll(&mut cursor) {
                Ok(batch) if batch.is_empty() => {}
                Ok(batch) => {
                    let resolved = batch.resolved;
                    if let Err(err) = sink(batch) {
                        warn!(job_id, error = %err, "sink write failed");
                        cluster.fail_job(job_id, &err.to_string());
                        return;
                    }
                    if let Some(resolved) = resolved {
                        cluster.checkpoint_job(job_id, resolved);
                    }
                }
                Err(err) => {
                    cluster.fail_job(job_id, &err.to_string());
                    return;
                }
            }
            thread::sleep(poll_interval);
        })
    }

    /// Runs a producer on its own thread until `ctx` is cancelled or `sink`
    /// reports the consumer gone.
    pub(crate) fn spawn_stream<S>(
        &self,
        ctx: Context,
        mut cursor: Cursor,
        mut sink: S,
        poll_interval: Duration,
    ) -> thread::JoinHandle<()>
    where
        S: FnMut(Batch, &Context) -> Result<()> + Send + 'static,
    {
        let cluster = self.clone();
        thread::spawn(move || {
            while !ctx.is_cancelled() {
                match cluster.poll(&mut cursor) {
                    Ok(batch) if batch.is_empty() => {}
                    Ok(batch) => {
                        if let Err(err) = sink(batch, &ctx) {
                            debug!(error = %err, "stream producer stopping");
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "stream producer failed");
                        return;
                    }
                }
                crossbeam_channel::select! {
                    recv(ctx.done()) -> _ => return,
                    default(poll_interval) => {}
                }
            }
        })
    }
}
