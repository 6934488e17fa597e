//! Feed over an append-only sink table.
//!
//! The producer inserts one row per message keyed by (topic, partition,
//! message id). The reader consumes destructively: each drain deletes every
//! row and returns them ordered by that key, which restores per-partition
//! producer order.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::feed::job::JobFeed;
use crate::feed::{Feed, FeedMessage, SeenSet, SinkKind};

/// One row of the sink table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRow {
    pub topic: String,
    pub partition: String,
    pub message_id: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub resolved: Option<Vec<u8>>,
}

impl SinkRow {
    fn into_message(self) -> FeedMessage {
        let has_row = self.key.as_ref().is_some_and(|k| !k.is_empty())
            || self.value.as_ref().is_some_and(|v| !v.is_empty());
        if has_row {
            FeedMessage {
                topic: self.topic,
                partition: self.partition,
                key: self.key,
                value: self.value,
                resolved: None,
            }
        } else {
            FeedMessage::resolved(self.topic, self.partition, self.resolved.unwrap_or_default())
        }
    }
}

/// The sink table, as seen by its single consumer.
pub trait SinkTable: Send + Sync {
    /// Deletes every row and returns them ordered by
    /// (topic, partition, message_id).
    fn drain(&self) -> Result<Vec<SinkRow>>;
}

pub struct TableFeed {
    job: JobFeed,
    table: Arc<dyn SinkTable>,
    rows: VecDeque<SinkRow>,
    seen: SeenSet,
    drained_while_paused: bool,
}

impl TableFeed {
    pub fn new(job: JobFeed, table: Arc<dyn SinkTable>) -> Self {
        TableFeed {
            job,
            table,
            rows: VecDeque::new(),
            seen: SeenSet::new(),
            drained_while_paused: false,
        }
    }

    pub fn job(&self) -> &JobFeed {
        &self.job
    }
}

impl Feed for TableFeed {
    fn partitions(&self) -> Vec<String> {
        SinkKind::Table.partitions()
    }

    fn next(&mut self, ctx: &Context) -> Result<FeedMessage> {
        loop {
            self.job.check_open()?;
            ctx.check()?;
            while let Some(row) = self.rows.pop_front() {
                let m = row.into_message();
                if self.seen.first_sighting(&m) {
                    return Ok(m);
                }
            }

            if self.job.is_paused() {
                // The job stops flushing once paused; one last drain picks up
                // whatever it wrote before that.
                if self.drained_while_paused {
                    return Err(Error::Paused);
                }
                self.drained_while_paused = true;
            }

            self.job.fetch_job_error(ctx)?;
            self.rows = self.table.drain()?.into();
        }
    }

    fn pause(&mut self, _ctx: &Context) -> Result<()> {
        self.job.pause()?;
        self.drained_while_paused = false;
        Ok(())
    }

    fn resume(&mut self, _ctx: &Context) -> Result<()> {
        self.job.resume()
    }

    fn close(&mut self) -> Result<()> {
        self.job.close();
        Ok(())
    }
}
