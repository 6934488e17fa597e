//! Feed over records streamed straight back to the client.

use std::sync::Arc;

use crossbeam_channel::{select, Receiver};
use tracing::debug;

use crate::context::{CancelHandle, Context};
use crate::error::{Error, Result};
use crate::feed::payload::parse_json_value_timestamps;
use crate::feed::{Feed, FeedMessage, SeenSet};
use crate::hlc::Timestamp;

/// Partition every inline message is reported under.
pub const INLINE_PARTITION: &str = "sinkless";

/// One streamed record. A record without a topic carries a resolved
/// timestamp payload in `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineRecord {
    pub topic: Option<String>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// An open producer stream. Dropping it stops the producer.
pub struct InlineStream {
    records: Receiver<InlineRecord>,
    stop: CancelHandle,
}

impl InlineStream {
    pub fn new(records: Receiver<InlineRecord>, stop: CancelHandle) -> Self {
        InlineStream { records, stop }
    }
}

/// Opens producer streams for a statement.
pub trait InlineSource: Send + Sync {
    /// Starts streaming. With a `cursor`, only changes after it (plus any
    /// replayed overlap) are produced and the initial scan is skipped.
    fn open(&self, create: &str, args: &[String], cursor: Option<Timestamp>) -> Result<InlineStream>;
}

pub struct InlineFeed {
    source: Arc<dyn InlineSource>,
    create: String,
    args: Vec<String>,
    stream: Option<InlineStream>,
    seen: SeenSet,
    latest_resolved: Option<Timestamp>,
    paused: bool,
    closed: bool,
}

impl InlineFeed {
    pub fn open(source: Arc<dyn InlineSource>, create: &str, args: &[String]) -> Result<Self> {
        let stream = source.open(create, args, None)?;
        Ok(InlineFeed {
            source,
            create: create.to_string(),
            args: args.to_vec(),
            stream: Some(stream),
            seen: SeenSet::new(),
            latest_resolved: None,
            paused: false,
            closed: false,
        })
    }

    /// Latest resolved timestamp surfaced so far. Resume restarts here.
    pub fn latest_resolved(&self) -> Option<Timestamp> {
        self.latest_resolved
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl Feed for InlineFeed {
    fn partitions(&self) -> Vec<String> {
        vec![INLINE_PARTITION.to_string()]
    }

    fn next(&mut self, ctx: &Context) -> Result<FeedMessage> {
        self.check_open()?;
        loop {
            let received = {
                let stream = match &self.stream {
                    Some(stream) => stream,
                    None if self.paused => return Err(Error::Paused),
                    None => return Err(Error::FeedEnded),
                };
                select! {
                    recv(stream.records) -> record => record.ok(),
                    recv(ctx.done()) -> _ => return Err(Error::Cancelled),
                }
            };
            let Some(record) = received else {
                // Producer finished and everything buffered is drained.
                self.stream = None;
                continue;
            };

            let m = match record.topic {
                Some(topic) => FeedMessage::row(topic, INLINE_PARTITION, Some(record.key), record.value),
                None => {
                    let (_, resolved) = parse_json_value_timestamps(&record.value)?;
                    self.latest_resolved = Some(resolved);
                    FeedMessage::resolved("", INLINE_PARTITION, record.value)
                }
            };
            if self.seen.first_sighting(&m) {
                return Ok(m);
            }
        }
    }

    fn pause(&mut self, _ctx: &Context) -> Result<()> {
        self.check_open()?;
        if let Some(stream) = &mut self.stream {
            stream.stop.cancel();
        }
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self, _ctx: &Context) -> Result<()> {
        self.check_open()?;
        if !self.paused {
            return Ok(());
        }
        debug!(cursor = ?self.latest_resolved, "reopening inline stream");
        // Buffered records of the old stream are dropped with it; the new
        // stream replays from the last resolved timestamp surfaced.
        self.stream = Some(self.source.open(&self.create, &self.args, self.latest_resolved)?);
        self.paused = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.stream = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crossbeam_channel::{bounded, unbounded, Sender};
    use std::sync::Mutex;

    /// Source that hands out pre-filled streams and remembers cursors.
    #[derive(Default)]
    struct ScriptedSource {
        scripts: Mutex<Vec<Vec<InlineRecord>>>,
        cursors: Mutex<Vec<Option<Timestamp>>>,
        live: Mutex<Vec<(Sender<InlineRecord>, Context)>>,
    }

    impl InlineSource for ScriptedSource {
        fn open(&self, _create: &str, _args: &[String], cursor: Option<Timestamp>) -> Result<InlineStream> {
            self.cursors.lock().unwrap().push(cursor);
            let (tx, rx) = unbounded();
            let (ctx, stop) = Context::with_cancel();
            let mut scripts = self.scripts.lock().unwrap();
            if !scripts.is_empty() {
                for record in scripts.remove(0) {
                    tx.send(record).unwrap();
                }
            }
            self.live.lock().unwrap().push((tx, ctx));
            Ok(InlineStream::new(rx, stop))
        }
    }

    fn row(key: u32, ts: i64) -> InlineRecord {
        InlineRecord {
            topic: Some("foo".into()),
            key: format!("[{}]", key).into_bytes(),
            value: format!(r#"{{"after": {{"id": {}}}, "updated": "{}.0000000000"}}"#, key, ts).into_bytes(),
        }
    }

    fn resolved(ts: i64) -> InlineRecord {
        InlineRecord {
            topic: None,
            key: Vec::new(),
            value: format!(r#"{{"resolved": "{}.0000000000"}}"#, ts).into_bytes(),
        }
    }

    #[test]
    fn test_rows_and_resolved() {
        let source = Arc::new(ScriptedSource::default());
        source.scripts.lock().unwrap().push(vec![row(1, 1), resolved(2)]);
        let mut feed = InlineFeed::open(source.clone(), "CREATE CHANGEFEED FOR foo", &[]).unwrap();
        let ctx = Context::background();

        let m = feed.next(&ctx).unwrap();
        assert_eq!(m.topic, "foo");
        assert_eq!(m.partition, "sinkless");
        assert_eq!(m.key_str(), "[1]");

        let m = feed.next(&ctx).unwrap();
        assert!(m.is_resolved());
        assert_eq!(feed.latest_resolved(), Some(Timestamp::from_wall(2)));
    }

    #[test]
    fn test_resume_replays_from_latest_resolved_without_duplicates() {
        let source = Arc::new(ScriptedSource::default());
        source
            .scripts
            .lock()
            .unwrap()
            .push(vec![row(1, 1), resolved(2), row(2, 3)]);
        // The replayed stream overlaps what was already surfaced.
        source
            .scripts
            .lock()
            .unwrap()
            .push(vec![row(1, 1), row(2, 3), row(3, 4), resolved(5)]);

        let mut feed = InlineFeed::open(source.clone(), "CREATE CHANGEFEED FOR foo", &[]).unwrap();
        let ctx = Context::background();
        assert_eq!(feed.next(&ctx).unwrap().key_str(), "[1]");
        assert!(feed.next(&ctx).unwrap().is_resolved());

        feed.pause(&ctx).unwrap();
        // Still buffered in the old stream.
        assert_eq!(feed.next(&ctx).unwrap().key_str(), "[2]");

        feed.resume(&ctx).unwrap();
        assert_eq!(feed.next(&ctx).unwrap().key_str(), "[3]");
        assert!(feed.next(&ctx).unwrap().is_resolved());
        assert_eq!(
            *source.cursors.lock().unwrap(),
            vec![None, Some(Timestamp::from_wall(2))]
        );
    }

    #[test]
    fn test_paused_feed_reports_paused_once_drained() {
        let source = Arc::new(ScriptedSource::default());
        source.scripts.lock().unwrap().push(vec![row(1, 1)]);
        let mut feed = InlineFeed::open(source.clone(), "CREATE CHANGEFEED FOR foo", &[]).unwrap();
        let ctx = Context::background();
        feed.pause(&ctx).unwrap();
        // Producer notices the stop and hangs up.
        source.live.lock().unwrap().clear();
        assert_eq!(feed.next(&ctx).unwrap().key_str(), "[1]");
        assert!(matches!(feed.next(&ctx), Err(Error::Paused)));
    }

    #[test]
    fn test_cancel_and_close() {
        let (_tx, rx) = bounded(1);
        struct Idle(Mutex<Option<Receiver<InlineRecord>>>);
        impl InlineSource for Idle {
            fn open(&self, _: &str, _: &[String], _: Option<Timestamp>) -> Result<InlineStream> {
                let rx = self.0.lock().unwrap().take().ok_or(Error::FeedEnded)?;
                let (_ctx, stop) = Context::with_cancel();
                Ok(InlineStream::new(rx, stop))
            }
        }
        let mut feed = InlineFeed::open(Arc::new(Idle(Mutex::new(Some(rx)))), "CREATE CHANGEFEED FOR foo", &[]).unwrap();

        let (ctx, mut cancel) = Context::with_cancel();
        cancel.cancel();
        assert!(feed.next(&ctx).unwrap_err().is_cancelled());

        feed.close().unwrap();
        assert!(matches!(feed.next(&Context::background()), Err(Error::Closed)));
    }
}
