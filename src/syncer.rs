//! Oplog syncer, drives one run of the replay pipeline:
//!
//! `load checkpoint -> read oplog -> filter -> rename -> apply -> persist checkpoint`
//!
//! Reading happens on a dedicated thread which feeds a bounded channel, so a slow destination
//! throttles the reader instead of buffering the whole oplog in memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bson::Timestamp;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::filter::{decide, source_drop, Decision};
use crate::namespace::NsRules;
use crate::oplog::{LogEntry, OpKind, Parsed};
use crate::rename::rewrite;
use crate::retry::RetryPolicy;
use crate::time_helper;
use crate::{Result, Stage, SyncError};

/// What applying one entry did to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// the destination changed.
    Applied,
    /// the destination already was in the entry's end state.
    NoOp,
}

/// Where a read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// entries strictly after the timestamp, used when resuming from a checkpoint.
    After(Timestamp),
    /// entries at or after the timestamp.
    From(Timestamp),
    /// the earliest retained entry.
    Beginning,
}

/// Stream of parsed oplog entries, in timestamp order.
pub type OplogStream = Box<dyn Iterator<Item = Result<Parsed>> + Send>;

/// Source of oplog entries.
pub trait OplogSource {
    /// Timestamp of the earliest retained entry, None when the oplog is empty.
    fn earliest_ts(&self) -> Result<Option<Timestamp>>;

    /// Open a stream starting at `start`.
    ///
    /// A finite run ends the stream at the entries which exist right now, a follow run keeps
    /// waiting for new entries.
    fn read_from(&self, start: StartAt) -> Result<OplogStream>;
}

/// Destination of oplog entries.
pub trait OplogApplier {
    /// Apply one entry.  Applying an entry whose effect is already present must return
    /// [ApplyOutcome::NoOp] instead of an error.
    fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome>;
}

impl<T: OplogSource + ?Sized> OplogSource for &T {
    fn earliest_ts(&self) -> Result<Option<Timestamp>> {
        (**self).earliest_ts()
    }

    fn read_from(&self, start: StartAt) -> Result<OplogStream> {
        (**self).read_from(start)
    }
}

impl<T: OplogApplier + ?Sized> OplogApplier for &T {
    fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        (**self).apply(entry)
    }
}

/// Knobs of one run which don't depend on the storage.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// without a checkpoint, start this many seconds back instead of the earliest entry.
    pub start_seconds_ago: Option<u32>,
    /// persist the checkpoint after this many processed entries.
    pub checkpoint_interval: usize,
    /// capacity of the channel between the reader and the applier.
    pub buffer_size: usize,
    /// persist the checkpoint when no entry arrived for this long.
    pub idle_flush: Duration,
    /// stop the run at the first malformed entry instead of skipping it.
    pub halt_on_malformed: bool,
    /// retry policy for connectivity errors.
    pub retry: RetryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            start_seconds_ago: None,
            checkpoint_interval: 1000,
            buffer_size: 1024,
            idle_flush: Duration::from_secs(1),
            halt_on_malformed: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// entries which changed the destination.
    pub applied: u64,
    /// entries whose effect was already present.
    pub no_op: u64,
    /// entries dropped by namespace rules.
    pub dropped: u64,
    /// malformed entries skipped.
    pub skipped: u64,
    /// noop heartbeats.
    pub heartbeats: u64,
    /// the persisted checkpoint when the run ended.
    pub checkpoint: Option<Timestamp>,
}

/// Position of the run, the last processed timestamp and the last persisted one.
struct Progress {
    processed: Option<Timestamp>,
    persisted: Option<Timestamp>,
    pending: usize,
    summary: RunSummary,
}

impl Progress {
    fn new(checkpoint: Option<Timestamp>) -> Self {
        Progress {
            processed: checkpoint,
            persisted: checkpoint,
            pending: 0,
            summary: RunSummary {
                checkpoint,
                ..RunSummary::default()
            },
        }
    }

    fn advance(&mut self, ts: Timestamp) {
        self.processed = Some(ts);
        self.pending += 1;
    }
}

/// Why the consumer loop ended.
enum Finish {
    Drained,
    Stopped,
}

/// Oplog syncer, replays `source` onto `applier` and keeps `checkpoint` up to date.
pub struct OplogSyncer<S, A, C> {
    source: S,
    applier: A,
    checkpoint: C,
    rules: NsRules,
    options: RunOptions,
    stop: Arc<AtomicBool>,
}

impl<S, A, C> OplogSyncer<S, A, C>
where
    S: OplogSource,
    A: OplogApplier,
    C: CheckpointStore,
{
    /// Create a syncer.
    pub fn new(source: S, applier: A, checkpoint: C, rules: NsRules, options: RunOptions) -> Self {
        OplogSyncer {
            source,
            applier,
            checkpoint,
            rules,
            options,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use `stop` as the stop flag, a run ends cleanly soon after it becomes true.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// The stop flag of this syncer.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run once.
    ///
    /// Returns after the source is drained (or, when following, after a stop request).  On
    /// failure the error carries the [Stage] it happened in, and the checkpoint has been moved
    /// to the last entry which was fully processed, when possible.
    pub fn run(&self) -> Result<RunSummary> {
        let checkpoint = self
            .options
            .retry
            .run("load checkpoint", || self.checkpoint.load())
            .map_err(|e| e.at(Stage::ReadCheckpoint))?;
        info!(?checkpoint, "Begin to sync oplog.");

        let start = self.start_point(checkpoint).map_err(|e| e.at(Stage::Stream))?;
        let mut progress = Progress::new(checkpoint);

        match self.stream(start, &mut progress) {
            Ok(()) => {
                self.persist(&mut progress)?;
                info!(summary = ?progress.summary, "Sync oplog complete.");
                Ok(progress.summary)
            }
            Err(e) => {
                error!(error = %e, processed = ?progress.processed, "Sync oplog failed.");
                if let Err(persist_err) = self.persist(&mut progress) {
                    error!(error = %persist_err, "Persist checkpoint after failure failed.");
                }
                Err(e.at(Stage::Stream))
            }
        }
    }

    fn start_point(&self, checkpoint: Option<Timestamp>) -> Result<StartAt> {
        match checkpoint {
            Some(checkpoint) => {
                let earliest = self
                    .options
                    .retry
                    .run("read earliest oplog", || self.source.earliest_ts())?;
                match earliest {
                    Some(earliest) if checkpoint < earliest => {
                        Err(SyncError::CheckpointTooOld { checkpoint, earliest })
                    }
                    _ => Ok(StartAt::After(checkpoint)),
                }
            }
            None => match self.options.start_seconds_ago {
                Some(seconds) => Ok(StartAt::From(time_helper::seconds_ago(seconds))),
                None => Ok(StartAt::Beginning),
            },
        }
    }

    fn stream(&self, start: StartAt, progress: &mut Progress) -> Result<()> {
        let entries = self
            .options
            .retry
            .run("open oplog", || self.source.read_from(start))?;
        let (sender, receiver) = channel::bounded(self.options.buffer_size.max(1));

        // the reader thread is never joined on an early exit: it may be blocked waiting for a
        // new entry, and it ends by itself once the receiver is gone.
        let reader = thread::Builder::new()
            .name("oplog reader".to_string())
            .spawn(move || {
                for item in entries {
                    let failed = item.is_err();
                    if sender.send(item).is_err() || failed {
                        break;
                    }
                }
            })?;

        match self.consume(&receiver, progress)? {
            // the sender is gone, so the thread returned or unwound.
            Finish::Drained => reader.join().map_err(|_| SyncError::ReaderPanicked),
            Finish::Stopped => Ok(()),
        }
    }

    fn consume(&self, receiver: &Receiver<Result<Parsed>>, progress: &mut Progress) -> Result<Finish> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested, stop syncing oplog.");
                return Ok(Finish::Stopped);
            }

            let parsed = match receiver.recv_timeout(self.options.idle_flush) {
                Ok(item) => item?,
                Err(RecvTimeoutError::Timeout) => {
                    self.persist(progress)?;
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(Finish::Drained),
            };

            self.handle(parsed, progress)?;
            if progress.pending >= self.options.checkpoint_interval.max(1) {
                self.persist(progress)?;
            }
        }
    }

    fn handle(&self, parsed: Parsed, progress: &mut Progress) -> Result<()> {
        match parsed {
            Parsed::Noop(ts) => {
                progress.summary.heartbeats += 1;
                progress.advance(ts);
            }
            Parsed::Malformed(malformed) => {
                if self.options.halt_on_malformed {
                    error!(ts = ?malformed.ts, reason = %malformed.reason, "Malformed oplog entry.");
                    return Err(SyncError::MalformedEntry(malformed.reason));
                }
                warn!(ts = ?malformed.ts, reason = %malformed.reason, "Skip malformed oplog entry.");
                progress.summary.skipped += 1;
                if let Some(ts) = malformed.ts {
                    progress.advance(ts);
                }
            }
            Parsed::Entry(entry) => {
                let ts = entry.ts;
                self.replay(entry, &mut progress.summary)?;
                progress.advance(ts);
            }
            Parsed::Transaction { ts, entries } => {
                debug!(?ts, ops = entries.len(), "Replay transaction.");
                for entry in entries {
                    self.replay(entry, &mut progress.summary)?;
                }
                progress.advance(ts);
            }
        }
        Ok(())
    }

    /// filter, rename and apply one entry.
    fn replay(&self, entry: LogEntry, summary: &mut RunSummary) -> Result<()> {
        let entry = match decide(&entry, &self.rules) {
            Decision::Keep => entry,
            Decision::Drop => {
                debug!(ts = ?entry.ts, ns = %entry.target_ns(), "Drop oplog entry.");
                summary.dropped += 1;
                return Ok(());
            }
            Decision::DropSource => {
                warn!(ts = ?entry.ts, ns = %entry.target_ns(), "Rename target is skipped, drop the renamed collection instead.");
                source_drop(entry)
            }
        };

        let entry = rewrite(entry, &self.rules.rename);
        if entry.kind() == OpKind::Command {
            info!(?entry, "Begin to apply command oplog.");
        }
        let outcome = self
            .options
            .retry
            .run("apply oplog", || self.applier.apply(&entry))
            .map_err(|e| {
                error!(ts = ?entry.ts, ns = %entry.ns, kind = %entry.kind(), error = %e, "Apply oplog failed.");
                e
            })?;

        match outcome {
            ApplyOutcome::Applied => summary.applied += 1,
            ApplyOutcome::NoOp => {
                debug!(ts = ?entry.ts, ns = %entry.ns, "Oplog entry already applied.");
                summary.no_op += 1;
            }
        }
        Ok(())
    }

    /// Write the checkpoint if it moved since the last write.
    fn persist(&self, progress: &mut Progress) -> Result<()> {
        let ts = match progress.processed {
            Some(ts) if progress.processed != progress.persisted => ts,
            _ => return Ok(()),
        };
        self.options
            .retry
            .run("persist checkpoint", || self.checkpoint.save(ts))
            .map_err(|e| e.at(Stage::PersistCheckpoint))?;

        progress.persisted = Some(ts);
        progress.summary.checkpoint = Some(ts);
        progress.pending = 0;
        info!(?ts, time = %time_helper::to_datetime(&ts), summary = ?progress.summary, "Checkpoint saved.");
        Ok(())
    }
}
