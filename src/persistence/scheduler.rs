//! Buffered, interval/threshold driven flushing of count records.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use tracing::{debug, error, info, warn};

use super::{CountRecord, CountStore};
use crate::config::{OutputFormat, StorageConfig};

struct Batch {
    id: u64,
    records: Vec<CountRecord>,
}

enum BatchOutcome {
    Saved { id: u64, count: usize },
    Failed { id: u64, records: Vec<CountRecord>, error: String },
}

/// Background writers fed by a bounded channel.
struct AsyncWriters {
    tx: Option<Sender<Batch>>,
    outcomes: Receiver<BatchOutcome>,
    handles: Vec<JoinHandle<()>>,
    in_flight_batches: usize,
    in_flight_records: usize,
}

impl AsyncWriters {
    fn spawn(threads: usize, store: Arc<dyn CountStore>, format: OutputFormat) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = bounded::<Batch>(threads * 2);
        let (outcome_tx, outcomes) = unbounded();
        let handles = (0..threads)
            .filter_map(|index| {
                let rx = rx.clone();
                let outcome_tx = outcome_tx.clone();
                let store = Arc::clone(&store);
                thread::Builder::new()
                    .name(format!("count-writer-{index}"))
                    .spawn(move || {
                        for batch in rx {
                            let outcome = match store.write(&batch.records, format) {
                                Ok(()) => BatchOutcome::Saved {
                                    id: batch.id,
                                    count: batch.records.len(),
                                },
                                Err(err) => BatchOutcome::Failed {
                                    id: batch.id,
                                    records: batch.records,
                                    error: err.to_string(),
                                },
                            };
                            if outcome_tx.send(outcome).is_err() {
                                break;
                            }
                        }
                    })
                    .map_err(|err| error!(index, error = %err, "failed to spawn count writer"))
                    .ok()
            })
            .collect();
        Self {
            tx: Some(tx),
            outcomes,
            handles,
            in_flight_batches: 0,
            in_flight_records: 0,
        }
    }
}

enum Mode {
    Sync,
    Async(AsyncWriters),
}

/// Buffers count records in arrival order and hands them to a
/// [`CountStore`] when `save_interval` elapses or `flush_threshold` records
/// are waiting.
///
/// Failed batches go back to the front of the buffer and are retried at the
/// next interval; nothing is dropped. In async mode writes run on
/// `io_threads` background threads and [`PersistenceScheduler::tick`] never
/// blocks on I/O.
pub struct PersistenceScheduler {
    store: Arc<dyn CountStore>,
    format: OutputFormat,
    save_interval: Duration,
    flush_threshold: usize,
    buffer: VecDeque<CountRecord>,
    last_flush: Instant,
    /// After a failure only the interval may trigger the next attempt.
    retry_pending: bool,
    next_batch: u64,
    failures: u64,
    saved: u64,
    mode: Mode,
}

impl PersistenceScheduler {
    pub fn new(config: &StorageConfig, store: Arc<dyn CountStore>) -> Self {
        Self::starting_at(config, store, Instant::now())
    }

    pub fn starting_at(config: &StorageConfig, store: Arc<dyn CountStore>, now: Instant) -> Self {
        let mode = if config.async_save {
            Mode::Async(AsyncWriters::spawn(config.io_threads, Arc::clone(&store), config.format))
        } else {
            Mode::Sync
        };
        info!(
            format = ?config.format,
            interval = ?config.save_interval,
            async_save = config.async_save,
            "persistence scheduler started"
        );
        Self {
            store,
            format: config.format,
            save_interval: config.save_interval,
            flush_threshold: config.flush_threshold.max(1),
            buffer: VecDeque::new(),
            last_flush: now,
            retry_pending: false,
            next_batch: 0,
            failures: 0,
            saved: 0,
            mode,
        }
    }

    pub fn push(&mut self, records: impl IntoIterator<Item = CountRecord>) {
        self.buffer.extend(records);
    }

    /// Records not yet confirmed written: buffered plus in flight.
    pub fn pending(&self) -> usize {
        let in_flight = match &self.mode {
            Mode::Sync => 0,
            Mode::Async(writers) => writers.in_flight_records,
        };
        self.buffer.len() + in_flight
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn saved(&self) -> u64 {
        self.saved
    }

    /// Collect async outcomes and flush if a trigger fired.
    pub fn tick(&mut self, now: Instant) {
        self.collect_outcomes(None);
        if self.buffer.is_empty() {
            return;
        }
        let interval_due = now.duration_since(self.last_flush) >= self.save_interval;
        let threshold_due = !self.retry_pending && self.buffer.len() >= self.flush_threshold;
        if interval_due || threshold_due {
            self.flush(now);
        }
    }

    /// Hand the whole buffer to the store now.
    pub fn flush(&mut self, now: Instant) {
        self.last_flush = now;
        if self.buffer.is_empty() {
            return;
        }
        let id = self.next_batch;
        self.next_batch += 1;
        let records: Vec<CountRecord> = self.buffer.drain(..).collect();

        match &mut self.mode {
            Mode::Sync => {
                let outcome = match self.store.write(&records, self.format) {
                    Ok(()) => BatchOutcome::Saved {
                        id,
                        count: records.len(),
                    },
                    Err(err) => BatchOutcome::Failed {
                        id,
                        records,
                        error: err.to_string(),
                    },
                };
                self.apply(outcome);
            }
            Mode::Async(writers) => {
                let Some(tx) = &writers.tx else {
                    self.requeue(records);
                    return;
                };
                let count = records.len();
                match tx.try_send(Batch { id, records }) {
                    Ok(()) => {
                        writers.in_flight_batches += 1;
                        writers.in_flight_records += count;
                        debug!(batch = id, records = count, "batch queued for writing");
                    }
                    Err(TrySendError::Full(batch) | TrySendError::Disconnected(batch)) => {
                        debug!(batch = id, "writers busy, keeping records buffered");
                        self.requeue(batch.records);
                    }
                }
            }
        }
    }

    fn collect_outcomes(&mut self, wait: Option<Duration>) {
        let Mode::Async(writers) = &mut self.mode else {
            return;
        };
        let mut outcomes = Vec::new();
        if let Some(wait) = wait {
            let deadline = Instant::now() + wait;
            while writers.in_flight_batches > outcomes.len() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match writers.outcomes.recv_timeout(deadline - now) {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        outcomes.extend(writers.outcomes.try_iter());
        for outcome in &outcomes {
            let count = match outcome {
                BatchOutcome::Saved { count, .. } => *count,
                BatchOutcome::Failed { records, .. } => records.len(),
            };
            writers.in_flight_batches = writers.in_flight_batches.saturating_sub(1);
            writers.in_flight_records = writers.in_flight_records.saturating_sub(count);
        }
        for outcome in outcomes {
            self.apply(outcome);
        }
    }

    fn apply(&mut self, outcome: BatchOutcome) {
        match outcome {
            BatchOutcome::Saved { id, count } => {
                self.saved += count as u64;
                self.retry_pending = false;
                info!(batch = id, records = count, "count records saved");
            }
            BatchOutcome::Failed { id, records, error } => {
                self.failures += 1;
                self.retry_pending = true;
                warn!(
                    batch = id,
                    records = records.len(),
                    error = %error,
                    "saving count records failed, will retry next interval"
                );
                self.requeue(records);
            }
        }
    }

    fn requeue(&mut self, records: Vec<CountRecord>) {
        for record in records.into_iter().rev() {
            self.buffer.push_front(record);
        }
    }

    /// Stop background writers (waiting at most `grace` for in-flight
    /// batches), then make one final synchronous attempt. Returns the number
    /// of records that could not be saved.
    pub fn shutdown(&mut self, grace: Duration) -> usize {
        if let Mode::Async(writers) = &mut self.mode {
            writers.tx = None;
        }
        self.collect_outcomes(Some(grace));

        let mut abandoned = 0;
        if let Mode::Async(writers) = std::mem::replace(&mut self.mode, Mode::Sync) {
            abandoned = writers.in_flight_records;
            for handle in writers.handles {
                if handle.is_finished() {
                    let _ = handle.join();
                }
            }
            if abandoned > 0 {
                warn!(records = abandoned, "writers did not finish within the grace period");
            }
        }

        self.flush(Instant::now());
        let unsaved = self.buffer.len() + abandoned;
        if unsaved > 0 {
            error!(records = unsaved, "count records left unsaved at shutdown");
        } else {
            info!(saved = self.saved, "persistence drained");
        }
        unsaved
    }
}
