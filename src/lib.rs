//! Change-feed correctness harness.
//!
//! Drives a database through a randomized nemesis while a changefeed streams
//! row updates and resolved timestamps into a sink, and checks the stream
//! against the feed's ordering and completeness guarantees.
//!
//! - [`feed`]: readers that turn each sink's storage back into one stream
//! - [`validator`]: the guarantees, checked message by message
//! - [`nemesis`]: the driver
//! - [`sim`]: an in-process cluster and changefeed producers to run against

pub mod cluster;
pub mod context;
pub mod error;
pub mod feed;
pub mod hlc;
pub mod nemesis;
pub mod sim;
pub mod span;
pub mod table_event;
pub mod validator;

pub use cluster::{Cluster, Transaction};
pub use context::{CancelHandle, Context};
pub use error::{Error, Result};
pub use feed::{Feed, FeedFactory, FeedMessage, SinkKind};
pub use hlc::Timestamp;
pub use nemesis::{run_nemesis, EventMix, NemesisConfig, NemesisFailure};
pub use span::{Span, SpanFrontier};
pub use validator::{CountValidator, Validator, Validators, Violation, ViolationKind};
