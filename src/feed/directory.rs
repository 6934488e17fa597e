//! Feed over a directory of immutable sink files.
//!
//! File names start with a 33 digit timestamp prefix so that a lexical walk
//! visits them in flush order. Data files look like
//! `<prefix>-<topic>-<schema id>-<rest>` and hold newline delimited row
//! values; `<prefix>.RESOLVED` files hold one resolved payload. A resolved
//! file sorts after the data files it covers.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::trace;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::feed::job::JobFeed;
use crate::feed::payload::key_from_value;
use crate::feed::{Feed, FeedMessage, SeenSet, SinkKind};

static FILE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{33}-(.+?)-(\d+)-").expect("sink file name pattern is valid"));

const RESOLVED_SUFFIX: &str = "RESOLVED";
const TMP_SUFFIX: &str = ".tmp";

/// Partition of every message read from a directory sink.
pub const DIRECTORY_PARTITION: &str = "";

pub struct DirectoryFeed {
    job: JobFeed,
    dir: PathBuf,
    /// Primary key column used to rebuild keys from values.
    pk: String,
    /// Last consumed resolved file. Everything at or below it is done.
    resolved: Option<OsString>,
    rows: VecDeque<FeedMessage>,
    seen: SeenSet,
    walked_while_paused: bool,
}

impl DirectoryFeed {
    pub fn new(job: JobFeed, dir: impl Into<PathBuf>, pk: impl Into<String>) -> Self {
        DirectoryFeed {
            job,
            dir: dir.into(),
            pk: pk.into(),
            resolved: None,
            rows: VecDeque::new(),
            seen: SeenSet::new(),
            walked_while_paused: false,
        }
    }

    pub fn job(&self) -> &JobFeed {
        &self.job
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queues every message from files past the last resolved file.
    ///
    /// Data files past it are read again on every walk until a resolved file
    /// covers them; the dedup shield drops the repeats.
    fn walk(&mut self) -> Result<()> {
        for path in sorted_files(&self.dir)? {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => return Err(Error::UnexpectedFile(path)),
            };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            if let Some(resolved) = &self.resolved {
                if path.as_os_str() <= resolved.as_os_str() {
                    continue;
                }
            }

            if name.ends_with(RESOLVED_SUFFIX) {
                let payload = fs::read(&path)?;
                trace!(path = %path.display(), "resolved file");
                self.rows
                    .push_back(FeedMessage::resolved("", DIRECTORY_PARTITION, payload));
                self.resolved = Some(path.into_os_string());
                continue;
            }

            let caps = FILE_NAME_RE
                .captures(&name)
                .ok_or_else(|| Error::UnexpectedFile(path.clone()))?;
            let topic = caps[1].to_string();
            let reader = BufReader::new(fs::File::open(&path)?);
            for line in reader.split(b'\n') {
                let value = line?;
                if value.is_empty() {
                    continue;
                }
                let key = key_from_value(&value, &self.pk)?;
                self.rows.push_back(FeedMessage::row(
                    topic.clone(),
                    DIRECTORY_PARTITION,
                    Some(key),
                    value,
                ));
            }
        }
        Ok(())
    }
}

/// Every regular file under `dir`, in lexical path order.
fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            out.extend(sorted_files(&path)?);
        } else {
            out.push(path);
        }
    }
    Ok(out)
}

impl Feed for DirectoryFeed {
    fn partitions(&self) -> Vec<String> {
        SinkKind::Directory.partitions()
    }

    fn next(&mut self, ctx: &Context) -> Result<FeedMessage> {
        loop {
            self.job.check_open()?;
            ctx.check()?;
            while let Some(m) = self.rows.pop_front() {
                if self.seen.first_sighting(&m) {
                    return Ok(m);
                }
            }

            if self.job.is_paused() {
                if self.walked_while_paused {
                    return Err(Error::Paused);
                }
                self.walked_while_paused = true;
            }

            self.job.fetch_job_error(ctx)?;
            self.walk()?;
        }
    }

    fn pause(&mut self, _ctx: &Context) -> Result<()> {
        self.job.pause()?;
        self.walked_while_paused = false;
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
