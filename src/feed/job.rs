//! Shared plumbing for feeds backed by a long-running changefeed job.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Error, Result};

/// How long `fetch_job_error` waits for a flush signal before polling.
pub const FLUSH_WAIT: Duration = Duration::from_millis(30);

/// Job control surface of the server running the changefeed.
pub trait JobControl: Send + Sync {
    fn pause_job(&self, job_id: i64) -> Result<()>;
    fn resume_job(&self, job_id: i64) -> Result<()>;
    fn cancel_job(&self, job_id: i64) -> Result<()>;
    /// The job's failure message, if it has failed.
    fn job_error(&self, job_id: i64) -> Result<Option<String>>;
}

/// State common to the table and directory feeds.
pub struct JobFeed {
    jobs: Arc<dyn JobControl>,
    job_id: i64,
    topic: String,
    /// Ticks whenever the producer has flushed rows to the sink.
    flush_rx: Receiver<()>,
    /// First failure seen on the job. Cleared by resume.
    job_err: Option<String>,
    paused: bool,
    closed: bool,
}

impl JobFeed {
    pub fn new(jobs: Arc<dyn JobControl>, job_id: i64, topic: String, flush_rx: Receiver<()>) -> Self {
        JobFeed {
            jobs,
            job_id,
            topic,
            flush_rx,
            job_err: None,
            paused: false,
            closed: false,
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Topic the job writes rows under.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// `Err(Error::Closed)` once the feed has been closed.
    pub fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Called between sink drains.
    ///
    /// A failure cached by an earlier call is returned immediately. Otherwise
    /// waits up to `FLUSH_WAIT` for a flush, then polls the job. A failure
    /// found now is only cached, so the caller gets one more drain pass to
    /// surface rows flushed before the job died.
    pub fn fetch_job_error(&mut self, ctx: &Context) -> Result<()> {
        if let Some(message) = &self.job_err {
            return Err(Error::Job {
                job_id: self.job_id,
                message: message.clone(),
            });
        }

        select! {
            recv(self.flush_rx) -> flushed => {
                if flushed.is_err() {
                    // Producer gone: no more flushes, so just pace the polling.
                    select! {
                        recv(ctx.done()) -> _ => return Err(Error::Cancelled),
                        default(FLUSH_WAIT) => {}
                    }
                }
            }
            recv(ctx.done()) -> _ => return Err(Error::Cancelled),
            default(FLUSH_WAIT) => {}
        }

        if let Some(message) = self.jobs.job_error(self.job_id)? {
            debug!(job_id = self.job_id, error = %message, "job failed; draining once more");
            self.job_err = Some(message);
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.check_open()?;
        self.jobs.pause_job(self.job_id)?;
        self.paused = true;
        Ok(())
    }

    /// Resumes a paused job. A running job is left alone.
    pub fn resume(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.paused {
            return Ok(());
        }
        self.jobs.resume_job(self.job_id)?;
        self.job_err = None;
        self.paused = false;
        Ok(())
    }

    /// Cancels the job. A failed cancel is logged, not returned.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.jobs.cancel_job(self.job_id) {
            warn!(job_id = self.job_id, error = %err, "failed to cancel job");
        }
    }
}

impl Drop for JobFeed {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Job registry double recording every control call.
    #[derive(Default)]
    pub(crate) struct FakeJobs {
        pub calls: Mutex<Vec<String>>,
        pub errors: Mutex<HashMap<i64, String>>,
        pub fail_cancel: bool,
    }

    impl FakeJobs {
        pub fn fail(&self, job_id: i64, message: &str) {
            self.errors.lock().unwrap().insert(job_id, message.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl JobControl for FakeJobs {
        fn pause_job(&self, job_id: i64) -> Result<()> {
            self.calls.lock().unwrap().push(format!("pause {}", job_id));
            Ok(())
        }

        fn resume_job(&self, job_id: i64) -> Result<()> {
            self.calls.lock().unwrap().push(format!("resume {}", job_id));
            self.errors.lock().unwrap().remove(&job_id);
            Ok(())
        }

        fn cancel_job(&self, job_id: i64) -> Result<()> {
            self.calls.lock().unwrap().push(format!("cancel {}", job_id));
            if self.fail_cancel {
                return Err(Error::Database("job not found".into()));
            }
            Ok(())
        }

        fn job_error(&self, job_id: i64) -> Result<Option<String>> {
            Ok(self.errors.lock().unwrap().get(&job_id).cloned())
        }
    }

    #[test]
    fn test_error_is_cached_after_one_pass() {
        let jobs = Arc::new(FakeJobs::default());
        let (_flush_tx, flush_rx) = bounded(1);
        let mut feed = JobFeed::new(jobs.clone(), 3, "foo".into(), flush_rx);
        let ctx = Context::background();

        assert!(feed.fetch_job_error(&ctx).is_ok());

        jobs.fail(3, "boom");
        // Seen for the first time: cached, caller drains once more.
        assert!(feed.fetch_job_error(&ctx).is_ok());
        match feed.fetch_job_error(&ctx) {
            Err(Error::Job { job_id, message }) => {
                assert_eq!(job_id, 3);
                assert_eq!(message, "boom");
            }
            other => panic!("expected job error, got {:?}", other),
        }
    }

    #[test]
    fn test_flush_signal_cuts_wait_short() {
        let jobs = Arc::new(FakeJobs::default());
        let (flush_tx, flush_rx) = bounded(1);
        let mut feed = JobFeed::new(jobs, 1, "foo".into(), flush_rx);
        flush_tx.send(()).unwrap();

        let start = Instant::now();
        feed.fetch_job_error(&Context::background()).unwrap();
        assert!(start.elapsed() < FLUSH_WAIT);
    }

    #[test]
    fn test_cancelled_context() {
        let jobs = Arc::new(FakeJobs::default());
        let (_flush_tx, flush_rx) = bounded(1);
        let mut feed = JobFeed::new(jobs, 1, "foo".into(), flush_rx);
        let (ctx, mut cancel) = Context::with_cancel();
        cancel.cancel();
        assert!(feed.fetch_job_error(&ctx).unwrap_err().is_cancelled());
    }

    #[test]
    fn test_resume_clears_cached_error() {
        let jobs = Arc::new(FakeJobs::default());
        let (_flush_tx, flush_rx) = bounded(1);
        let mut feed = JobFeed::new(jobs.clone(), 5, "foo".into(), flush_rx);
        let ctx = Context::background();

        jobs.fail(5, "boom");
        feed.fetch_job_error(&ctx).unwrap();
        feed.pause().unwrap();
        assert!(feed.is_paused());
        feed.resume().unwrap();
        assert!(!feed.is_paused());
        // Resuming a running job is a no-op.
        feed.resume().unwrap();
        assert!(feed.fetch_job_error(&ctx).is_ok());
        assert_eq!(jobs.calls(), vec!["pause 5", "resume 5"]);
    }

    #[test]
    fn test_close_swallows_cancel_failure() {
        let jobs = Arc::new(FakeJobs {
            fail_cancel: true,
            ..FakeJobs::default()
        });
        let (_flush_tx, flush_rx) = bounded(1);
        let mut feed = JobFeed::new(jobs.clone(), 9, "foo".into(), flush_rx);
        feed.close();
        feed.close();
        assert_eq!(jobs.calls(), vec!["cancel 9"]);
        assert!(matches!(feed.check_open(), Err(Error::Closed)));
        assert!(matches!(feed.pause(), Err(Error::Closed)));
    }
}
