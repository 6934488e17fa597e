use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::bounded;
use tracing::info;

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::feed::{
    CreateChangefeed, DirectoryFeed, Feed, FeedFactory, InlineFeed, JobFeed, SinkKind, TableFeed,
};
use crate::sim::changefeed::Cursor;
use crate::sim::sinks::{DirectoryWriter, SimInlineSource, SimSinkTable};
use crate::sim::{SimCluster, SimConfig};

/// Creates feeds against a `SimCluster`.
///
/// Statements without an `INTO` clause use the factory's default sink.
pub struct SimFeedFactory {
    cluster: SimCluster,
    sink: SinkKind,
    config: SimConfig,
    created: usize,
}

impl SimFeedFactory {
    pub fn new(cluster: SimCluster, sink: SinkKind) -> Self {
        SimFeedFactory::with_config(cluster, sink, SimConfig::default())
    }

    pub fn with_config(cluster: SimCluster, sink: SinkKind, config: SimConfig) -> Self {
        SimFeedFactory {
            cluster,
            sink,
            config,
            created: 0,
        }
    }

    pub fn cluster(&self) -> &SimCluster {
        &self.cluster
    }

    pub fn sink(&self) -> SinkKind {
        self.sink
    }

    fn sink_dir(&self, job_id: i64) -> PathBuf {
        let root = self
            .config
            .sink_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("cdcnemesis-{}", std::process::id())));
        root.join(format!("job-{}", job_id))
    }

    fn table_feed(&self, stmt: &CreateChangefeed) -> Result<TableFeed> {
        let scan_ts = self.cluster.now();
        let job_id = self.cluster.start_job();
        let topic = stmt.topic();
        let with_updated = stmt.has_option("updated");
        let partitions = SinkKind::Table.partitions().len();
        let table = Arc::new(SimSinkTable::new());
        let (flush_tx, flush_rx) = bounded(1);

        let writer = Arc::clone(&table);
        let writer_topic = topic.clone();
        self.cluster.spawn_job(
            job_id,
            Cursor::new(&stmt.table, scan_ts, stmt.has_option("resolved")),
            move |batch| {
                writer.write(&writer_topic, partitions, batch, with_updated);
                let _ = flush_tx.try_send(());
                Ok(())
            },
            self.config.poll_interval,
            self.config.replay_overlap,
        );

        let job = JobFeed::new(Arc::new(self.cluster.clone()), job_id, topic, flush_rx);
        Ok(TableFeed::new(job, table))
    }

    fn directory_feed(&self, stmt: &CreateChangefeed) -> Result<DirectoryFeed> {
        let scan_ts = self.cluster.now();
        let job_id = self.cluster.start_job();
        let topic = stmt.topic();
        let dir = self.sink_dir(job_id);
        let mut writer = DirectoryWriter::new(&dir, topic.clone(), stmt.has_option("updated"))?;
        let (flush_tx, flush_rx) = bounded(1);

        self.cluster.spawn_job(
            job_id,
            Cursor::new(&stmt.table, scan_ts, stmt.has_option("resolved")),
            move |batch| {
                writer.write(batch)?;
                let _ = flush_tx.try_send(());
                Ok(())
            },
            self.config.poll_interval,
            self.config.replay_overlap,
        );

        let job = JobFeed::new(Arc::new(self.cluster.clone()), job_id, topic, flush_rx);
        Ok(DirectoryFeed::new(job, dir, "id"))
    }
}

impl FeedFactory for SimFeedFactory {
    fn feed(&mut self, create: &str, args: &[String]) -> Result<Box<dyn Feed>> {
        let stmt = CreateChangefeed::parse(create)?;
        let kind = stmt.sink_kind(self.sink)?;
        if !self.cluster.has_table(&stmt.table) {
            return Err(Error::Database(format!("relation {:?} does not exist", stmt.table)));
        }
        self.created += 1;
        info!(sink = %kind, table = %stmt.table, feeds = self.created, "creating changefeed");

        let feed: Box<dyn Feed> = match kind {
            SinkKind::Inline => {
                let source = Arc::new(SimInlineSource::new(self.cluster.clone(), self.config.clone()));
                Box::new(InlineFeed::open(source, create, args)?)
            }
            SinkKind::Table => Box::new(self.table_feed(&stmt)?),
            SinkKind::Directory => Box::new(self.directory_feed(&stmt)?),
        };
        Ok(feed)
    }

    fn server(&self) -> Arc<dyn Cluster> {
        Arc::new(self.cluster.clone())
    }
}
