//! Sink writers for the simulated changefeed producers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{bounded, select, Sender};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::feed::{CreateChangefeed, InlineRecord, InlineSource, InlineStream, SinkRow, SinkTable};
use crate::hlc::Timestamp;
use crate::sim::changefeed::{resolved_payload, Batch, Cursor};
use crate::sim::{SimCluster, SimConfig};

/// Streams changes straight back over a channel.
pub struct SimInlineSource {
    cluster: SimCluster,
    config: SimConfig,
    /// Fixed by the first open so that a reopen without a cursor replays the
    /// same initial scan.
    scan_ts: Mutex<Option<Timestamp>>,
}

impl SimInlineSource {
    pub fn new(cluster: SimCluster, config: SimConfig) -> Self {
        SimInlineSource {
            cluster,
            config,
            scan_ts: Mutex::new(None),
        }
    }
}

fn send(tx: &Sender<InlineRecord>, record: InlineRecord, ctx: &Context) -> Result<()> {
    select! {
        send(tx, record) -> res => res.map_err(|_| Error::Closed),
        recv(ctx.done()) -> _ => Err(Error::Cancelled),
    }
}

impl InlineSource for SimInlineSource {
    fn open(&self, create: &str, _args: &[String], cursor: Option<Timestamp>) -> Result<InlineStream> {
        let stmt = CreateChangefeed::parse(create)?;
        if !self.cluster.has_table(&stmt.table) {
            return Err(Error::Database(format!("relation {:?} does not exist", stmt.table)));
        }
        let scan_ts = *self
            .scan_ts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| self.cluster.now());

        let mut start = Cursor::new(&stmt.table, scan_ts, stmt.has_option("resolved"));
        if cursor.is_some() {
            start.rewind(cursor, self.config.replay_overlap);
        }
        let with_updated = stmt.has_option("updated");
        let topic = stmt.topic();

        let (tx, rx) = bounded(self.config.inline_buffer);
        let (ctx, stop) = Context::with_cancel();
        self.cluster.spawn_stream(
            ctx,
            start,
            move |batch: Batch, ctx: &Context| {
                for row in batch.rows {
                    let record = InlineRecord {
                        topic: Some(topic.clone()),
                        key: row.key(),
                        value: row.value(with_updated, false),
                    };
                    send(&tx, record, ctx)?;
                }
                if let Some(resolved) = batch.resolved {
                    let record = InlineRecord {
                        topic: None,
                        key: Vec::new(),
                        value: resolved_payload(resolved),
                    };
                    send(&tx, record, ctx)?;
                }
                Ok(())
            },
            self.config.poll_interval,
        );
        Ok(InlineStream::new(rx, stop))
    }
}

/// An append-only sink table keyed by (topic, partition, message id).
#[derive(Debug, Default)]
pub struct SimSinkTable {
    rows: Mutex<Vec<SinkRow>>,
    next_message_id: AtomicI64,
}

impl SimSinkTable {
    pub fn new() -> Self {
        SimSinkTable::default()
    }

    /// Appends a batch: rows on their key's partition, then the resolved
    /// timestamp on every partition.
    pub(crate) fn write(&self, topic: &str, partitions: usize, batch: Batch, with_updated: bool) {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for row in batch.rows {
            rows.push(SinkRow {
                topic: topic.to_string(),
                partition: row.partition(partitions).to_string(),
                message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
                key: Some(row.key()),
                value: Some(row.value(with_updated, false)),
                resolved: None,
            });
        }
        if let Some(resolved) = batch.resolved {
            let payload = resolved_payload(resolved);
            for partition in 0..partitions {
                rows.push(SinkRow {
                    topic: topic.to_string(),
                    partition: partition.to_string(),
                    message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
                    key: None,
                    value: None,
                    resolved: Some(payload.clone()),
                });
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SinkTable for SimSinkTable {
    fn drain(&self) -> Result<Vec<SinkRow>> {
        let mut rows = std::mem::take(&mut *self.rows.lock().unwrap_or_else(PoisonError::into_inner));
        rows.sort_by(|a, b| {
            (&a.topic, &a.partition, a.message_id).cmp(&(&b.topic, &b.partition, b.message_id))
        });
        Ok(rows)
    }
}

/// `<23 digit wall><10 digit logical>`, so names sort by timestamp.
pub(crate) fn file_prefix(ts: Timestamp) -> String {
    format!("{:023}{:010}", ts.wall_time, ts.logical)
}

/// Writes immutable sink files into a directory.
#[derive(Debug)]
pub struct DirectoryWriter {
    dir: PathBuf,
    topic: String,
    with_updated: bool,
    seq: u64,
}

impl DirectoryWriter {
    pub fn new(dir: impl Into<PathBuf>, topic: impl Into<String>, with_updated: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(DirectoryWriter {
            dir,
            topic: topic.into(),
            with_updated,
            seq: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the batch's rows as one data file, then its resolved file.
    pub(crate) fn write(&mut self, batch: Batch) -> Result<()> {
        let prefix_ts = match batch.resolved {
            Some(resolved) => resolved,
            None => match batch.rows.iter().map(|r| r.updated).max() {
                Some(ts) => ts,
                None => return Ok(()),
            },
        };
        let prefix = file_prefix(prefix_ts);

        if !batch.rows.is_empty() {
            let mut body = Vec::new();
            for row in &batch.rows {
                body.extend_from_slice(&row.value(self.with_updated, true));
                body.push(b'\n');
            }
            let name = format!("{}-{}-1-{}.ndjson", prefix, self.topic, self.seq);
            self.seq += 1;
            write_atomic(&self.dir.join(name), &body)?;
        }
        if let Some(resolved) = batch.resolved {
            write_atomic(
                &self.dir.join(format!("{}.RESOLVED", prefix)),
                &resolved_payload(resolved),
            )?;
        }
        Ok(())
    }
}

/// Writes `<path>.tmp` and renames it into place.
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
