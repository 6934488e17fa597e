//! An in-process stand-in for a cluster running changefeeds.
//!
//! `SimCluster` keeps MVCC history for integer-keyed tables with at most one
//! open transaction at a time. Producers poll that history the way a
//! changefeed's rangefeeds would and write into whichever sink the statement
//! asked for. `SimFeedFactory` wires a producer to the matching feed.

mod changefeed;
mod cluster;
mod factory;
mod sinks;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use cluster::{JobStatus, SimCluster};
pub use factory::SimFeedFactory;
pub use sinks::{DirectoryWriter, SimInlineSource, SimSinkTable};

/// Tuning for simulated producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Delay between producer polls.
    pub poll_interval: Duration,
    /// How far before its checkpoint a restarted producer replays.
    pub replay_overlap: Duration,
    /// Records an inline producer may buffer ahead of the reader.
    pub inline_buffer: usize,
    /// Root for directory sinks. A per-process temp directory when unset.
    pub sink_dir: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            poll_interval: Duration::from_millis(5),
            replay_overlap: Duration::from_millis(1),
            inline_buffer: 16,
            sink_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: SimConfig = serde_json::from_str(r#"{"inline_buffer": 4}"#).unwrap();
        assert_eq!(config.inline_buffer, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert!(config.sink_dir.is_none());
    }
}
