//! Sink selection and `CREATE CHANGEFEED` statement parsing.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static CREATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*CREATE\s+CHANGEFEED\s+FOR\s+(?:TABLE\s+)?([\w.]+)(?:\s+INTO\s+'([^']*)')?(?:\s+WITH\s+(.*?))?\s*;?\s*$",
    )
    .expect("create changefeed pattern is valid")
});

/// Sink back-end a feed reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    /// Records streamed back over an in-process channel.
    Inline,
    /// Rows appended to a sink table and read destructively.
    Table,
    /// Immutable files in a directory.
    Directory,
}

impl SinkKind {
    /// Picks the back-end from a sink URI scheme. An empty URI means inline.
    pub fn from_uri(uri: &str) -> Result<SinkKind> {
        let scheme = match uri.split_once("://") {
            Some((scheme, _)) => scheme,
            None => uri,
        };
        match scheme.to_ascii_lowercase().as_str() {
            "" | "inline" | "sinkless" => Ok(SinkKind::Inline),
            "experimental-sql" | "sql" => Ok(SinkKind::Table),
            "experimental-nodelocal" | "nodelocal" | "file" => Ok(SinkKind::Directory),
            _ => Err(Error::UnsupportedSink(uri.to_string())),
        }
    }

    /// Partitions a feed over this sink reports.
    pub fn partitions(&self) -> Vec<String> {
        match self {
            SinkKind::Inline => vec!["sinkless".to_string()],
            SinkKind::Table => (0..3).map(|p| p.to_string()).collect(),
            SinkKind::Directory => vec![String::new()],
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Inline => write!(f, "inline"),
            SinkKind::Table => write!(f, "table"),
            SinkKind::Directory => write!(f, "directory"),
        }
    }
}

/// The parts of a `CREATE CHANGEFEED` statement the harness cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChangefeed {
    pub table: String,
    pub sink_uri: Option<String>,
    pub options: Vec<String>,
}

impl CreateChangefeed {
    pub fn parse(stmt: &str) -> Result<CreateChangefeed> {
        let caps = CREATE_RE
            .captures(stmt)
            .ok_or_else(|| Error::Decode(format!("not a CREATE CHANGEFEED statement: {}", stmt)))?;
        let options = caps
            .get(3)
            .map(|m| {
                m.as_str()
                    .split(',')
                    .map(|opt| opt.trim().to_ascii_lowercase())
                    .filter(|opt| !opt.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(CreateChangefeed {
            table: caps[1].to_string(),
            sink_uri: caps.get(2).map(|m| m.as_str().to_string()),
            options,
        })
    }

    /// Sink kind named by the statement, or `default` when it names none.
    pub fn sink_kind(&self, default: SinkKind) -> Result<SinkKind> {
        match &self.sink_uri {
            Some(uri) => SinkKind::from_uri(uri),
            None => Ok(default),
        }
    }

    /// Topic the table's rows are published under: its unqualified name.
    pub fn topic(&self) -> String {
        self.table.rsplit('.').next().unwrap_or(&self.table).to_string()
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options
            .iter()
            .any(|opt| opt == name || opt.starts_with(&format!("{}=", name)))
    }
}
