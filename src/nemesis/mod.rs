//! Nemesis - randomized driver for change-feed validation.
//!
//! A state machine that interleaves transactional writes, feed reads and
//! faults against a server while a changefeed watches one table. Every row
//! and resolved timestamp the feed emits goes through the validators; the
//! run ends once enough rows have been covered by resolved timestamps.
//!
//! Events:
//! - Transact: open a one-row UPSERT transaction, or commit / roll back the
//!   open one
//! - FeedMessage: read one message and hand it to the validators
//! - Pause / Resume: pause the feed, resumed on the next step
//! - Push: high priority read that pushes the open transaction
//! - Abort: high priority delete of every row, aborting the open transaction
//! - Split: split the table at a random key

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, Transaction, UpsertedRow};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::feed::{key_from_value, parse_json_value_timestamps, CreateChangefeed, Feed, FeedFactory, FeedMessage};
use crate::validator::{
    CountValidator, FingerprintValidator, OrderValidator, ResolvedValidator, Validator, Validators,
};


/// Relative weights of the randomly drawn events. They need not add up to
/// any particular total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMix {
    pub transact: u32,
    /// Falls back to a transact when no row is owed by the feed.
    pub feed_message: u32,
    pub pause: u32,
    pub push: u32,
    pub abort: u32,
    pub split: u32,
}

impl Default for EventMix {
    /// Writes and reads only. The fault events are off: against a real
    /// cluster they have been seen to wedge the run.
    fn default() -> Self {
        EventMix {
            transact: 45,
            feed_message: 45,
            pause: 0,
            push: 0,
            abort: 0,
            split: 0,
        }
    }
}

impl EventMix {
    /// Every event enabled.
    pub fn all_faults() -> Self {
        EventMix {
            transact: 45,
            feed_message: 45,
            pause: 10,
            push: 30,
            abort: 30,
            split: 10,
        }
    }

    fn weighted(&self) -> [(Event, u32); 6] {
        [
            (Event::Transact, self.transact),
            (Event::FeedMessage, self.feed_message),
            (Event::Pause, self.pause),
            (Event::Push, self.push),
            (Event::Abort, self.abort),
            (Event::Split, self.split),
        ]
    }

    pub fn total(&self) -> u32 {
        self.weighted().iter().map(|(_, w)| w).sum()
    }

    /// Draws one event. `total()` must be non-zero.
    fn draw(&self, rng: &mut impl Rng) -> Event {
        let mut r = rng.gen_range(0..self.total());
        for (event, weight) in self.weighted() {
            if r < weight {
                return event;
            }
            r -= weight;
        }
        Event::Transact
    }
}

/// Configuration for a nemesis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NemesisConfig {
    /// Keys are drawn from `0..=row_count`.
    pub row_count: i64,
    pub event_mix: EventMix,
    /// RNG seed. Drawn at random (and logged) when unset.
    pub seed: Option<u64>,
    /// Table the run writes and watches. Created by the run.
    pub table: String,
    /// The run ends once more than this many resolved timestamps followed
    /// at least one row...
    pub min_resolved_with_rows: usize,
    /// ...and more than this many rows were followed by a resolved
    /// timestamp.
    pub min_resolved_rows: usize,
}

impl Default for NemesisConfig {
    fn default() -> Self {
        NemesisConfig {
            row_count: 4,
            event_mix: EventMix::default(),
            seed: None,
            table: "foo".to_string(),
            min_resolved_with_rows: 5,
            min_resolved_rows: 20,
        }
    }
}

impl NemesisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.row_count < 0 {
            return Err(Error::InvalidConfig(format!("row_count {} is negative", self.row_count)));
        }
        if self.event_mix.total() == 0 {
            return Err(Error::InvalidConfig("event mix has no weight".into()));
        }
        Ok(())
    }

    fn create_statement(&self) -> String {
        format!("CREATE CHANGEFEED FOR {} WITH updated, resolved", self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running { paused: bool },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Transact,
    FeedMessage,
    Pause,
    Resume,
    Push,
    Abort,
    Split,
    Finished,
}

impl State {
    /// The state `event` moves to, or `None` if it is not allowed here.
    ///
    /// Faults leave the machine "paused" so the next step is always a
    /// resume, which is a no-op for a feed that was not paused.
    pub fn transition(self, event: Event) -> Option<State> {
        match (self, event) {
            (State::Running { .. }, Event::Finished) => Some(State::Done),
            (State::Running { paused: false }, Event::Transact | Event::FeedMessage) => {
                Some(State::Running { paused: false })
            }
            (
                State::Running { paused: false },
                Event::Pause | Event::Push | Event::Abort | Event::Split,
            ) => Some(State::Running { paused: true }),
            (State::Running { paused: true }, Event::Resume) => Some(State::Running { paused: false }),
            _ => None,
        }
    }
}

/// A failed run. Carries the validator when the run got far enough to
/// build one.
#[derive(Error)]
#[error("nemesis run failed: {error}")]
pub struct NemesisFailure {
    #[source]
    pub error: Error,
    pub validator: Option<CountValidator>,
}

impl fmt::Debug for NemesisFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NemesisFailure")
            .field("error", &self.error)
            .field("validator", &self.validator)
            .finish()
    }
}

impl From<Error> for NemesisFailure {
    fn from(error: Error) -> Self {
        NemesisFailure {
            error,
            validator: None,
        }
    }
}

/// Closes the feed however the run ends.
struct FeedGuard(Box<dyn Feed>);

impl Deref for FeedGuard {
    type Target = dyn Feed;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for FeedGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        if let Err(err) = self.0.close() {
            warn!(error = %err, "failed to close feed");
        }
    }
}

/// Driver state outside the feed and validator.
struct Nemeses<'a> {
    config: &'a NemesisConfig,
    cluster: Arc<dyn Cluster>,
    rng: StdRng,
    /// Row messages the feed still owes. Reads are only attempted while
    /// this is positive so the driver never blocks on an idle feed.
    available_rows: usize,
    txn: Option<(Box<dyn Transaction>, UpsertedRow)>,
}

/// Runs the nemesis against the server behind `factory`.
///
/// Validator failures do not stop the run; they are on the returned
/// validator. The first other error does, and comes back with whatever the
/// validator had seen.
pub fn run_nemesis(
    ctx: &Context,
    factory: &mut dyn FeedFactory,
    config: &NemesisConfig,
) -> std::result::Result<CountValidator, NemesisFailure> {
    config.validate()?;
    let seed = config.seed.unwrap_or_else(rand::random);
    info!(seed, table = %config.table, mix = ?config.event_mix, "starting nemesis");

    let mut ns = Nemeses {
        config,
        cluster: factory.server(),
        rng: StdRng::seed_from_u64(seed),
        available_rows: 0,
        txn: None,
    };
    ns.prime()?;

    let create = config.create_statement();
    let topic = CreateChangefeed::parse(&create)?.topic();
    let mut feed = FeedGuard(factory.feed(&create, &[])?);
    let partitions = feed.partitions();
    let checks: Vec<Box<dyn Validator>> = vec![
        Box::new(OrderValidator::new(topic.clone())),
        Box::new(ResolvedValidator::new(topic)),
        Box::new(FingerprintValidator::new(
            Arc::clone(&ns.cluster),
            config.table.clone(),
            &partitions,
        )),
    ];
    let mut validator = CountValidator::new(Box::new(Validators::new(checks)));

    let result = ns.run(ctx, &mut *feed, &mut validator);
    if let Some((txn, _)) = ns.txn.take() {
        if let Err(err) = txn.rollback() {
            warn!(error = %err, "failed to roll back open transaction");
        }
    }
    drop(feed);

    match result {
        Ok(()) => {
            info!(?validator, "nemesis finished");
            Ok(validator)
        }
        Err(error) => Err(NemesisFailure {
            error,
            validator: Some(validator),
        }),
    }
}

impl Nemeses<'_> {
    /// Creates the table, splits it and leaves some committed rows and
    /// possibly an open intent for the feed's initial scan.
    fn prime(&mut self) -> Result<()> {
        let table = &self.config.table;
        self.cluster.create_table(table)?;
        self.cluster.set_range_merges(false)?;
        self.cluster.split_at(table, self.config.row_count / 2)?;
        for _ in 0..self.config.row_count * 5 {
            self.transact()?;
        }
        Ok(())
    }

    fn run(&mut self, ctx: &Context, feed: &mut dyn Feed, v: &mut CountValidator) -> Result<()> {
        // Rows touched by priming may share keys; the scan owes one message
        // per live row.
        self.available_rows = self.cluster.count_rows(&self.config.table)?;

        // Reading the first message guarantees the feed is running before
        // anything else commits; the push lets its initial scan finish.
        let first = feed.next(ctx)?;
        self.apply(ctx, Event::FeedMessage, Some(first), feed, v)?;
        self.apply(ctx, Event::Push, None, feed, v)?;

        let mut state = State::Running { paused: false };
        while state != State::Done {
            ctx.check()?;
            let (event, message) = self.next_event(ctx, state, feed, v)?;
            let Some(next) = state.transition(event) else {
                panic!("event {:?} drawn in state {:?}", event, state);
            };
            self.apply(ctx, event, message, feed, v)?;
            state = next;
        }
        Ok(())
    }

    fn next_event(
        &mut self,
        ctx: &Context,
        state: State,
        feed: &mut dyn Feed,
        v: &CountValidator,
    ) -> Result<(Event, Option<FeedMessage>)> {
        if v.num_resolved_with_rows > self.config.min_resolved_with_rows
            && v.num_resolved_rows > self.config.min_resolved_rows
        {
            return Ok((Event::Finished, None));
        }
        match state {
            State::Running { paused: true } => Ok((Event::Resume, None)),
            State::Running { paused: false } => {
                let event = self.config.event_mix.draw(&mut self.rng);
                if event != Event::FeedMessage {
                    return Ok((event, None));
                }
                if self.available_rows < 1 {
                    return Ok((Event::Transact, None));
                }
                let m = feed.next(ctx)?;
                Ok((Event::FeedMessage, Some(m)))
            }
            State::Done => Ok((Event::Finished, None)),
        }
    }

    fn apply(
        &mut self,
        ctx: &Context,
        event: Event,
        message: Option<FeedMessage>,
        feed: &mut dyn Feed,
        v: &mut CountValidator,
    ) -> Result<()> {
        match &message {
            Some(m) => info!(?event, message = %m, "nemesis event"),
            None => info!(?event, available_rows = self.available_rows, "nemesis event"),
        }
        match event {
            Event::Transact => self.transact(),
            Event::FeedMessage => self.note_feed_message(message.ok_or(Error::FeedEnded)?, v),
            Event::Pause => feed.pause(ctx),
            Event::Resume => feed.resume(ctx),
            Event::Push => self.cluster.push(&self.config.table),
            Event::Abort => {
                let deleted = self.cluster.delete_all(&self.config.table)?;
                self.available_rows += deleted;
                Ok(())
            }
            Event::Split => {
                let key = self.rng.gen_range(0..=self.config.row_count);
                self.cluster.split_at(&self.config.table, key)
            }
            Event::Finished => match self.txn.take() {
                Some((txn, _)) => txn.rollback(),
                None => Ok(()),
            },
        }
    }

    /// Opens a transaction with one UPSERT, or finishes the open one:
    /// rolled back half the time, committed otherwise.
    fn transact(&mut self) -> Result<()> {
        let Some((txn, row)) = self.txn.take() else {
            let mut txn = self.cluster.begin()?;
            let id = self.rng.gen_range(0..=self.config.row_count);
            let row = txn.upsert(&self.config.table, id)?;
            self.txn = Some((txn, row));
            return Ok(());
        };

        if self.rng.gen_bool(0.5) {
            return txn.rollback();
        }
        match txn.commit() {
            Ok(()) => {
                info!(id = row.id, ts = %row.ts, "UPSERT committed");
                self.available_rows += 1;
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                // Nothing was written, so the feed owes nothing for it.
                debug!(id = row.id, error = %err, "UPSERT needs restart");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn note_feed_message(&mut self, m: FeedMessage, v: &mut CountValidator) -> Result<()> {
        if let Some(resolved) = &m.resolved {
            let (_, ts) = parse_json_value_timestamps(resolved)?;
            return v.note_resolved(&m.partition, ts);
        }

        let value = m.value.as_deref().unwrap_or_default();
        let (updated, _) = parse_json_value_timestamps(value)?;
        // Some sinks carry no key; rebuild it from the row.
        let key = match &m.key {
            Some(key) => key.clone(),
            None => key_from_value(value, "id")?,
        };

        match self.available_rows.checked_sub(1) {
            Some(n) => self.available_rows = n,
            None => warn!(message = %m, "feed emitted more rows than expected"),
        }
        v.note_row(
            &m.partition,
            &String::from_utf8_lossy(&key),
            &String::from_utf8_lossy(value),
            updated,
        );
        Ok(())
    }
}
