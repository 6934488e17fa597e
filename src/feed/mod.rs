//! Feeds: pull-based change-feed readers over the various sink back-ends.
//!
//! Every back-end turns its sink-native storage back into one logical stream
//! of `FeedMessage`s. Within a (topic, partition) messages come out in
//! producer order; across partitions only resolved timestamps say anything
//! about progress.

pub mod assert;
pub mod dedup;
pub mod directory;
pub mod inline;
pub mod job;
pub mod payload;
pub mod sink;
pub mod table;

use std::fmt;
use std::sync::Arc;

use crate::cluster::Cluster;
use crate::context::Context;
use crate::error::Result;

pub use dedup::SeenSet;
pub use directory::DirectoryFeed;
pub use inline::{InlineFeed, InlineRecord, InlineSource, InlineStream};
pub use job::{JobControl, JobFeed};
pub use payload::{key_from_value, parse_json_value_timestamps};
pub use sink::{CreateChangefeed, SinkKind};
pub use table::{SinkRow, SinkTable, TableFeed};

/// One row update or resolved timestamp read from a feed.
///
/// Either `key`/`value` (a row) or `resolved` is populated, never both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub partition: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub resolved: Option<Vec<u8>>,
}

impl FeedMessage {
    /// A row update. `key` may be absent for sinks that only carry values.
    pub fn row(
        topic: impl Into<String>,
        partition: impl Into<String>,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Self {
        FeedMessage {
            topic: topic.into(),
            partition: partition.into(),
            key,
            value: Some(value),
            resolved: None,
        }
    }

    /// A resolved timestamp notification.
    pub fn resolved(
        topic: impl Into<String>,
        partition: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        FeedMessage {
            topic: topic.into(),
            partition: partition.into(),
            key: None,
            value: None,
            resolved: Some(payload),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(self.key.as_deref().unwrap_or_default()).into_owned()
    }

    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(self.value.as_deref().unwrap_or_default()).into_owned()
    }
}

impl fmt::Display for FeedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resolved {
            Some(resolved) => write!(
                f,
                "{} [{}] resolved {}",
                self.topic,
                self.partition,
                String::from_utf8_lossy(resolved)
            ),
            None => write!(
                f,
                "{} [{}] {}->{}",
                self.topic,
                self.partition,
                self.key_str(),
                self.value_str()
            ),
        }
    }
}

/// A change-feed reader.
pub trait Feed: Send {
    /// The partitions `next` may report. Fixed for the life of the feed.
    fn partitions(&self) -> Vec<String>;

    /// Blocks until the next message, the end of the stream, an error, or
    /// cancellation of `ctx`.
    fn next(&mut self, ctx: &Context) -> Result<FeedMessage>;

    /// Stops the producer. `next` keeps returning already buffered messages,
    /// then fails with `Error::Paused` until `resume`.
    fn pause(&mut self, ctx: &Context) -> Result<()>;

    /// Restarts the producer from no later than the last resolved timestamp
    /// seen. Replayed duplicates are filtered before `next` returns them.
    fn resume(&mut self, ctx: &Context) -> Result<()>;

    /// Shuts the feed down. Later calls fail with `Error::Closed`.
    fn close(&mut self) -> Result<()>;
}

/// Creates feeds against one test server.
pub trait FeedFactory {
    /// Create a feed from a `CREATE CHANGEFEED` statement.
    fn feed(&mut self, create: &str, args: &[String]) -> Result<Box<dyn Feed>>;

    /// The server the feeds read from.
    fn server(&self) -> Arc<dyn Cluster>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_shapes() {
        let row = FeedMessage::row("foo", "0", Some(b"[1]".to_vec()), b"{}".to_vec());
        assert!(!row.is_resolved());
        assert_eq!(row.key_str(), "[1]");
        assert_eq!(row.to_string(), "foo [0] [1]->{}");

        let resolved = FeedMessage::resolved("", "0", br#"{"resolved":"1.0000000000"}"#.to_vec());
        assert!(resolved.is_resolved());
        assert!(resolved.key.is_none() && resolved.value.is_none());
    }
}
