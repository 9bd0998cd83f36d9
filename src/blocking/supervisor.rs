//! River lifecycle.
//!
//! One control thread per running river executes the pipeline: a producer thread which
//! owns the oplog cursor and the translator, consumer tasks on a rayon pool which own the
//! bulk indexer, and the control thread itself which owns the checkpoint store.  They talk
//! through the hand-off queue and an event channel, no lock is held across a network call.
//!
//! ```text
//! Stopped -> Starting -> Running <-> Recovering
//!               |           |            |
//!               +-------> Error <--------+
//! ```
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use rayon::ThreadPoolBuilder;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use super::checkpoint::CheckpointStore;
use super::cursor::{OplogCursor, StartPosition};
use super::indexer::BulkIndexer;
use super::progress::ProgressTracker;
use super::queue::{Drained, HandoffQueue, QueueReceiver, QueueRouter};
use super::signal::{shutdown_pair, ShutdownSignal, ShutdownTrigger};
use super::source::{OplogFilter, OplogSource};
use super::target::IndexTarget;
use crate::intent::MutationIntent;
use crate::oplog::OpKind;
use crate::translate::Translator;
use crate::{Optime, Result, RiverConfig, RiverError, Statistics, StatsSnapshot};

/// how often the control thread wakes up without events.
const TICK: Duration = Duration::from_millis(100);

/// Lifecycle state of one river.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiverState {
    /// not running, either never started or stopped on request.
    Stopped,
    /// loading the checkpoint and opening the cursor.
    Starting,
    /// tailing the source.
    Running,
    /// waiting to reopen the pipeline after a retryable failure.
    Recovering,
    /// gave up, until started again.
    Error,
}

impl RiverState {
    /// lowercase name, as persisted in status documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiverState::Stopped => "stopped",
            RiverState::Starting => "starting",
            RiverState::Running => "running",
            RiverState::Recovering => "recovering",
            RiverState::Error => "error",
        }
    }

    /// true for states the river only leaves on an external request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RiverState::Stopped | RiverState::Error)
    }
}

impl fmt::Display for RiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Status {
    state: RiverState,
    last_error: Option<String>,
    checkpoint: Option<Optime>,
    stats: Statistics,
}

struct Shared {
    conf: RiverConfig,
    source: Arc<dyn OplogSource>,
    target: Arc<dyn IndexTarget>,
    status: Mutex<Status>,
    changed: Condvar,
}

struct Control {
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
}

/// Owns one river: starts, watches, restarts and stops its pipeline.
pub struct Supervisor {
    shared: Arc<Shared>,
    control: Mutex<Option<Control>>,
}

impl Supervisor {
    /// create a stopped river.
    pub fn new(
        conf: RiverConfig,
        source: Arc<dyn OplogSource>,
        target: Arc<dyn IndexTarget>,
    ) -> Supervisor {
        Supervisor {
            shared: Arc::new(Shared {
                conf,
                source,
                target,
                status: Mutex::new(Status {
                    state: RiverState::Stopped,
                    last_error: None,
                    checkpoint: None,
                    stats: Statistics::new(),
                }),
                changed: Condvar::new(),
            }),
            control: Mutex::new(None),
        }
    }

    /// river configuration.
    pub fn conf(&self) -> &RiverConfig {
        &self.shared.conf
    }

    /// Start the river, a running river is left alone.
    ///
    /// The river goes to [RiverState::Starting] right away, and to [RiverState::Running]
    /// once its checkpoint is loaded and the oplog cursor is open.
    pub fn start(&self) -> Result<()> {
        let mut control = lock(&self.control);
        if let Some(running) = control.as_ref() {
            if !running.handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(finished) = control.take() {
            let _ = finished.handle.join();
        }
        self.shared.conf.validate()?;

        self.shared.set_state(RiverState::Starting, None);
        let (trigger, signal) = shutdown_pair();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("river-{}", self.shared.conf.name))
            .spawn(move || shared.run(signal))
            .map_err(|e| RiverError::Config {
                reason: format!("can't spawn river thread: {}", e),
            })?;
        *control = Some(Control { trigger, handle });
        Ok(())
    }

    /// Stop the river: the producer stops reading, queued intents are applied, the final
    /// checkpoint is written.  Blocks until done.
    pub fn stop(&self) {
        let control = lock(&self.control).take();
        if let Some(mut control) = control {
            info!(river = %self.shared.conf.name, "Stop river.");
            control.trigger.trigger();
            if control.handle.join().is_err() {
                error!(river = %self.shared.conf.name, "River thread panicked.");
                self.shared
                    .set_state(RiverState::Error, Some("river thread panicked".to_string()));
            }
        }
    }

    /// current state.
    pub fn state(&self) -> RiverState {
        lock(&self.shared.status).state
    }

    /// current counters.
    pub fn statistics(&self) -> StatsSnapshot {
        lock(&self.shared.status).stats.snapshot()
    }

    /// message of the failure which sent the river to recovering or error.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.status).last_error.clone()
    }

    /// last persisted checkpoint position.
    pub fn checkpoint(&self) -> Option<Optime> {
        lock(&self.shared.status).checkpoint
    }

    /// Block until the river is stopped or failed.
    pub fn wait(&self) {
        let mut status = lock(&self.shared.status);
        while !status.state.is_terminal() {
            status = self
                .shared
                .changed
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until `pred` holds for the river state, at most `timeout`.
    ///
    /// Returns whether `pred` holds.
    pub fn wait_for_state(&self, pred: impl Fn(RiverState) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = lock(&self.shared.status);
        while !pred(status.state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            status = match self.shared.changed.wait_timeout(status, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Remove the persisted checkpoint and statistics of a stopped river.
    pub fn remove_status(&self) -> Result<()> {
        CheckpointStore::new(&self.shared.conf, self.shared.target.clone(), "").remove()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Event {
    BatchApplied { consumer: usize, size: usize },
    ProducerExited(Result<()>),
    ConsumerExited(usize, Result<()>),
}

impl Shared {
    fn set_state(&self, state: RiverState, error: Option<String>) {
        let mut status = lock(&self.status);
        if status.state != state {
            info!(river = %self.conf.name, from = %status.state, to = %state, "River state changed.");
        }
        status.state = state;
        if error.is_some() || state == RiverState::Running {
            status.last_error = error;
        }
        self.changed.notify_all();
    }

    fn stats(&self) -> Statistics {
        lock(&self.status).stats.clone()
    }

    fn run(self: Arc<Self>, signal: ShutdownSignal) {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("river", name = %self.conf.name, %run_id);
        let _enter = span.enter();

        let mut store = CheckpointStore::new(&self.conf, self.target.clone(), run_id);
        let mut restored = false;
        let mut attempt = 0;
        loop {
            let result = self.run_pipeline(&mut store, &signal, &mut restored, &mut attempt);
            lock(&self.status).checkpoint = store.last_saved();
            match result {
                Ok(()) => break,
                Err(e) if signal.is_triggered() => {
                    warn!(%e, "River pipeline failed while stopping.");
                    break;
                }
                Err(e) if e.is_retryable() && attempt < self.conf.recovery.max_retries => {
                    attempt += 1;
                    let backoff = self.conf.recovery.backoff(attempt);
                    warn!(%e, attempt, ?backoff, "River pipeline failed, recovering.");
                    self.set_state(RiverState::Recovering, Some(e.to_string()));
                    if signal.wait(backoff) {
                        break;
                    }
                }
                Err(e) => {
                    error!(%e, attempt, "River failed.");
                    let stats = self.stats().snapshot();
                    if let Err(save_err) =
                        store.save(None, stats, RiverState::Error, Some(e.to_string()))
                    {
                        warn!(%save_err, "Can't persist river error status.");
                    }
                    self.set_state(RiverState::Error, Some(e.to_string()));
                    return;
                }
            }
        }
        self.set_state(RiverState::Stopped, None);
    }

    fn run_pipeline(
        &self,
        store: &mut CheckpointStore,
        signal: &ShutdownSignal,
        restored: &mut bool,
        attempt: &mut u32,
    ) -> Result<()> {
        let conf = &self.conf;
        if !self.target.index_exists(&conf.target.index)? {
            info!(index = %conf.target.index, "Create target index.");
            self.target.create_index(&conf.target.index)?;
        }
        let checkpoint = store.load()?;
        if !*restored {
            lock(&self.status).stats = Statistics::from_snapshot(checkpoint.stats);
            *restored = true;
        }
        let stats = self.stats();

        let start = match (checkpoint.optime, conf.source.initial_timestamp) {
            (Some(optime), _) => StartPosition::Resume(optime),
            (None, Some(time)) => StartPosition::At(Optime::new(time, 0)),
            (None, None) => StartPosition::Tail,
        };
        let (mut run_trigger, run_signal) = shutdown_pair();
        let filter = OplogFilter::new(&conf.source.db, &conf.source.collection);
        let cursor = OplogCursor::open(
            self.source.clone(),
            filter,
            start,
            &conf.pipeline,
            run_signal.clone(),
        )?;
        if checkpoint.optime.is_none() {
            // so a restart resumes here rather than at a later tail.
            store.save(
                Some(cursor.position()),
                stats.snapshot(),
                RiverState::Running,
                None,
            )?;
            *attempt = 0;
        }
        self.set_state(RiverState::Running, None);

        let tracker = Arc::new(ProgressTracker::new());
        let (router, receivers) =
            HandoffQueue::partitioned(conf.pipeline.consumers, conf.pipeline.queue_capacity);
        let (events, event_rx) = channel::unbounded();
        let consumers = receivers.len();

        let pool = ThreadPoolBuilder::new()
            .num_threads(consumers)
            .thread_name({
                let name = conf.name.clone();
                move |n| format!("{}-consumer-{}", name, n)
            })
            .build()
            .map_err(|e| RiverError::Config {
                reason: format!("can't build consumer pool: {}", e),
            })?;
        for (n, receiver) in receivers.into_iter().enumerate() {
            let consumer = Consumer {
                n,
                receiver,
                indexer: BulkIndexer::new(self.target.clone(), stats.clone(), &conf.pipeline)
                    .keeping(vec![conf.checkpoint_id()]),
                tracker: tracker.clone(),
                events: events.clone(),
                bulk_size: conf.pipeline.bulk_size,
                bulk_timeout: conf.pipeline.bulk_timeout(),
            };
            let span = tracing::Span::current();
            pool.spawn(move || span.in_scope(|| consumer.run()));
        }

        let producer = Producer {
            cursor,
            translator: Translator::new(conf),
            source: self.source.clone(),
            router,
            tracker: tracker.clone(),
            stats: stats.clone(),
            signal: run_signal,
            events,
        };
        let span = tracing::Span::current();
        let producer = thread::Builder::new()
            .name(format!("{}-producer", conf.name))
            .spawn(move || span.in_scope(|| producer.run()))
            .map_err(|e| RiverError::Config {
                reason: format!("can't spawn producer thread: {}", e),
            })?;

        let stats_interval = conf.statistics.as_ref().map(|s| s.interval());
        let mut last_stats = Instant::now();
        let mut producer_done = false;
        let mut consumers_left = consumers;
        let mut failure: Option<RiverError> = None;
        while !producer_done || consumers_left > 0 {
            if signal.is_triggered() {
                run_trigger.trigger();
            }
            match event_rx.recv_timeout(TICK) {
                Ok(Event::BatchApplied { consumer, size }) => {
                    debug!(consumer, size, "Batch applied.");
                }
                Ok(Event::ProducerExited(result)) => {
                    producer_done = true;
                    match result {
                        Ok(()) | Err(RiverError::Stopped) => {}
                        Err(e) => {
                            error!(%e, "Producer failed.");
                            failure.get_or_insert(e);
                            run_trigger.trigger();
                        }
                    }
                }
                Ok(Event::ConsumerExited(consumer, result)) => {
                    consumers_left -= 1;
                    if let Err(e) = result {
                        error!(%e, consumer, "Consumer failed.");
                        failure.get_or_insert(e);
                        run_trigger.trigger();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if failure.is_none() {
                match self.save_progress(store, &tracker, &stats) {
                    Ok(true) => *attempt = 0,
                    Ok(false) => {}
                    Err(e) => {
                        error!(%e, "Checkpoint write failed.");
                        failure = Some(e);
                        run_trigger.trigger();
                    }
                }
            }
            if let Some(interval) = stats_interval {
                if last_stats.elapsed() >= interval {
                    self.save_statistics(store, &stats, RiverState::Running);
                    last_stats = Instant::now();
                }
            }
        }
        if producer.join().is_err() {
            failure.get_or_insert(RiverError::Stopped);
            error!("Producer thread panicked.");
        }
        drop(pool);

        let final_state = if failure.is_some() {
            RiverState::Recovering
        } else {
            RiverState::Stopped
        };
        let saved = store.save(
            tracker.safe(),
            stats.snapshot(),
            final_state,
            failure.as_ref().map(|e| e.to_string()),
        );
        self.save_statistics(store, &stats, final_state);
        info!(checkpoint = ?store.last_saved(), stats = ?stats.snapshot(), state = %final_state, "River pipeline finished.");
        match failure {
            Some(e) => Err(e),
            None => saved,
        }
    }

    // Returns whether a checkpoint was written.
    fn save_progress(
        &self,
        store: &mut CheckpointStore,
        tracker: &ProgressTracker,
        stats: &Statistics,
    ) -> Result<bool> {
        match tracker.safe() {
            Some(safe) if store.needs(safe) => {
                store.save(Some(safe), stats.snapshot(), RiverState::Running, None)?;
                lock(&self.status).checkpoint = Some(safe);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn save_statistics(&self, store: &CheckpointStore, stats: &Statistics, state: RiverState) {
        if let Err(e) = store.save_statistics(stats.snapshot(), state) {
            warn!(%e, "Save statistics failed.");
        }
    }
}

struct Producer {
    cursor: OplogCursor,
    translator: Translator,
    source: Arc<dyn OplogSource>,
    router: QueueRouter,
    tracker: Arc<ProgressTracker>,
    stats: Statistics,
    signal: ShutdownSignal,
    events: Sender<Event>,
}

impl Producer {
    fn run(mut self) {
        let result = self.pump();
        if let Err(e) = &result {
            debug!(%e, position = %self.cursor.position(), "Producer exits.");
        }
        let _ = self.events.send(Event::ProducerExited(result));
    }

    fn pump(&mut self) -> Result<()> {
        while let Some(item) = self.cursor.next() {
            let record = match item {
                Ok(record) => record,
                Err(e @ RiverError::MalformedOperation { .. }) => {
                    warn!(%e, position = %self.cursor.position(), "Skip malformed oplog entry.");
                    self.stats.add_failed(1);
                    self.tracker.observe(self.cursor.position());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let intents = match self.translator.translate(&record, self.source.as_ref()) {
                Ok(intents) => intents,
                Err(e @ RiverError::MalformedOperation { .. }) => {
                    warn!(%e, optime = %record.optime, "Skip untranslatable oplog entry.");
                    self.stats.add_failed(1);
                    self.tracker.observe(record.optime);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if intents.is_empty() {
                if !matches!(record.kind, OpKind::Noop) {
                    self.stats.add_skipped(1);
                }
                self.tracker.observe(record.optime);
                continue;
            }
            self.hand_off(record.optime, intents)?;
        }
        Ok(())
    }

    // Intents of one document always share a partition.  A control intent touches every
    // document, so with several partitions it waits until all earlier intents are applied,
    // and later intents wait until it is applied.
    fn hand_off(&self, optime: Optime, intents: Vec<MutationIntent>) -> Result<()> {
        let barrier = self.router.partitions() > 1 && intents.iter().any(|i| i.is_control());
        if barrier && !self.tracker.wait_idle(&self.signal) {
            return Err(RiverError::Stopped);
        }
        self.tracker.register(optime, intents.len());
        for intent in intents {
            self.router.enqueue(intent)?;
        }
        if barrier && !self.tracker.wait_idle(&self.signal) {
            return Err(RiverError::Stopped);
        }
        Ok(())
    }
}

struct Consumer {
    n: usize,
    receiver: QueueReceiver,
    indexer: BulkIndexer,
    tracker: Arc<ProgressTracker>,
    events: Sender<Event>,
    bulk_size: usize,
    bulk_timeout: Duration,
}

impl Consumer {
    fn run(self) {
        let result = self.consume();
        let _ = self.events.send(Event::ConsumerExited(self.n, result));
    }

    // Runs until the producer is gone and the queue is drained.
    fn consume(&self) -> Result<()> {
        loop {
            match self.receiver.drain(self.bulk_size, self.bulk_timeout) {
                Drained::Items(batch) => {
                    self.indexer.apply(&batch)?;
                    for intent in batch.iter() {
                        self.tracker.resolve(intent.optime);
                    }
                    let _ = self.events.send(Event::BatchApplied {
                        consumer: self.n,
                        size: batch.len(),
                    });
                }
                Drained::Idle => {}
                Drained::Closed => return Ok(()),
            }
        }
    }
}
