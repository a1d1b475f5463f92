//! Inference worker pool with bounded submission and in-order release.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use tracing::{debug, info, warn};

use super::adapter::{Detector, DetectorHealth};
use super::engine::SharedEngineFactory;
use super::Detection;
use crate::config::{DetectionConfig, Precision};
use crate::pipeline::CancelToken;
use crate::source::Frame;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct DetectJob {
    seq: u64,
    frame: Frame,
    precision: Precision,
}

/// Detections for one frame, released in sequence order.
#[derive(Debug, Clone)]
pub struct DetectResult {
    pub seq: u64,
    pub detections: Vec<Detection>,
    pub health: DetectorHealth,
    pub elapsed: Duration,
}

enum WorkerMessage {
    Done(DetectResult),
    Exited(usize),
}

/// Outcome of a submission attempt.
#[derive(Debug)]
pub enum SubmitOutcome {
    Submitted,
    /// Every slot is taken; the frame is handed back.
    Busy(Frame),
}

/// A fixed set of inference threads, each with its own [`Detector`].
///
/// At most `active_workers + queue_depth` jobs are in flight. Results may
/// complete in any order but [`InferencePool::next_ready`] only ever releases
/// the lowest outstanding sequence number.
pub struct InferencePool {
    job_tx: Option<Sender<DetectJob>>,
    result_rx: Receiver<WorkerMessage>,
    workers: Vec<Option<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    queue_depth: usize,
    outstanding: BTreeSet<u64>,
    completed: BTreeMap<u64, DetectResult>,
    cancel: CancelToken,
    exited: usize,
}

impl InferencePool {
    pub fn new(factory: SharedEngineFactory, config: &DetectionConfig) -> Self {
        let size = config.max_worker_threads.max(1);
        let (job_tx, job_rx) = unbounded::<DetectJob>();
        let (result_tx, result_rx) = unbounded();
        let active = Arc::new(AtomicUsize::new(size));
        let cancel = CancelToken::new();

        let workers = (0..size)
            .map(|index| {
                let worker = Worker {
                    index,
                    jobs: job_rx.clone(),
                    results: result_tx.clone(),
                    active: Arc::clone(&active),
                    cancel: cancel.clone(),
                };
                let factory = Arc::clone(&factory);
                let config = config.clone();
                let handle = thread::Builder::new()
                    .name(format!("inference-{index}"))
                    .spawn(move || worker.run(factory, config));
                match handle {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        warn!(index, error = %err, "failed to spawn inference worker");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        let spawned = workers.iter().filter(|w| w.is_some()).count();
        info!(workers = spawned, queue_depth = config.queue_depth, "inference pool started");

        Self {
            job_tx: Some(job_tx),
            result_rx,
            exited: size - spawned,
            workers,
            active,
            queue_depth: config.queue_depth,
            outstanding: BTreeSet::new(),
            completed: BTreeMap::new(),
            cancel,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Change how many workers take jobs. Parked workers keep their engine.
    pub fn set_active_workers(&self, n: usize) -> usize {
        let n = n.clamp(1, self.size().max(1));
        let previous = self.active.swap(n, Ordering::SeqCst);
        if previous != n {
            info!(from = previous, to = n, "active inference workers changed");
        }
        n
    }

    /// Jobs submitted but not yet finished by a worker.
    pub fn in_flight(&self) -> usize {
        self.outstanding.len() - self.completed.len()
    }

    pub fn capacity(&self) -> usize {
        self.active_workers() + self.queue_depth
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.capacity()
    }

    /// Number of results waiting to be released or computed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn try_submit(&mut self, frame: Frame, precision: Precision) -> SubmitOutcome {
        self.poll();
        if !self.has_capacity() || self.exited >= self.workers.len() {
            return SubmitOutcome::Busy(frame);
        }
        let Some(tx) = &self.job_tx else {
            return SubmitOutcome::Busy(frame);
        };
        let seq = frame.seq();
        match tx.send(DetectJob {
            seq,
            frame,
            precision,
        }) {
            Ok(()) => {
                self.outstanding.insert(seq);
                SubmitOutcome::Submitted
            }
            Err(err) => SubmitOutcome::Busy(err.into_inner().frame),
        }
    }

    /// Submit, waiting up to `wait` for a slot to free up.
    pub fn submit_timeout(&mut self, frame: Frame, precision: Precision, wait: Duration) -> SubmitOutcome {
        let deadline = Instant::now() + wait;
        let mut frame = frame;
        loop {
            match self.try_submit(frame, precision) {
                SubmitOutcome::Submitted => return SubmitOutcome::Submitted,
                SubmitOutcome::Busy(back) => {
                    let now = Instant::now();
                    if now >= deadline || self.cancel.is_cancelled() {
                        return SubmitOutcome::Busy(back);
                    }
                    self.receive_timeout(deadline - now);
                    frame = back;
                }
            }
        }
    }

    /// Collect finished results without blocking.
    pub fn poll(&mut self) {
        loop {
            match self.result_rx.try_recv() {
                Ok(message) => self.accept(message),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Release the lowest outstanding result if it has finished.
    pub fn next_ready(&mut self) -> Option<DetectResult> {
        self.poll();
        let lowest = *self.outstanding.first()?;
        let result = self.completed.remove(&lowest)?;
        self.outstanding.remove(&lowest);
        Some(result)
    }

    /// Wait at most `wait` for the lowest outstanding result.
    pub fn next_ready_within(&mut self, wait: Duration) -> Option<DetectResult> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(result) = self.next_ready() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline
                || self.outstanding.is_empty()
                || self.cancel.is_cancelled()
                || self.exited >= self.workers.len()
            {
                return None;
            }
            self.receive_timeout(deadline - now);
        }
    }

    /// Block until the lowest outstanding result is available. Returns `None`
    /// when nothing is outstanding, on cancellation, or when every worker
    /// has gone.
    pub fn wait_next(&mut self, cancel: &CancelToken) -> Option<DetectResult> {
        loop {
            if let Some(result) = self.next_ready() {
                return Some(result);
            }
            if self.outstanding.is_empty()
                || cancel.is_cancelled()
                || self.cancel.is_cancelled()
                || self.exited >= self.workers.len()
            {
                return None;
            }
            self.receive_timeout(POLL_INTERVAL);
        }
    }

    fn receive_timeout(&mut self, timeout: Duration) {
        match self.result_rx.recv_timeout(timeout) {
            Ok(message) => self.accept(message),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        }
    }

    fn accept(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Done(result) => {
                if self.outstanding.contains(&result.seq) {
                    self.completed.insert(result.seq, result);
                }
            }
            WorkerMessage::Exited(index) => {
                self.exited += 1;
                if let Some(slot) = self.workers.get_mut(index) {
                    if let Some(handle) = slot.take() {
                        let _ = handle.join();
                    }
                }
            }
        }
    }

    /// Cancel queued work and wait up to `grace` for workers to exit.
    /// Workers still busy after that are detached.
    pub fn shutdown(&mut self, grace: Duration) {
        if self.job_tx.is_none() {
            return;
        }
        self.cancel.cancel();
        self.job_tx = None;

        let deadline = Instant::now() + grace;
        while self.exited < self.workers.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.receive_timeout(deadline - now);
        }

        let detached = self.workers.iter_mut().filter_map(Option::take).count();
        if detached > 0 {
            warn!(detached, "inference workers still busy after grace period, detaching");
        }
        let abandoned = self.outstanding.len();
        self.outstanding.clear();
        self.completed.clear();
        info!(abandoned, "inference pool stopped");
    }
}

impl Drop for InferencePool {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

struct Worker {
    index: usize,
    jobs: Receiver<DetectJob>,
    results: Sender<WorkerMessage>,
    active: Arc<AtomicUsize>,
    cancel: CancelToken,
}

/// Reports a worker's exit to the pool however its thread ends.
struct ExitNotice {
    index: usize,
    results: Sender<WorkerMessage>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!(worker = self.index, "inference worker panicked");
        }
        let _ = self.results.send(WorkerMessage::Exited(self.index));
    }
}

impl Worker {
    fn run(self, factory: SharedEngineFactory, config: DetectionConfig) {
        let _exit = ExitNotice {
            index: self.index,
            results: self.results.clone(),
        };
        let mut detector = Detector::from_factory(factory.as_ref(), &config);
        debug!(worker = self.index, null = detector.is_null(), "inference worker ready");

        while !self.cancel.is_cancelled() {
            if self.index >= self.active.load(Ordering::SeqCst) {
                // Parked by the performance controller.
                self.cancel.sleep(POLL_INTERVAL);
                continue;
            }
            let job = match self.jobs.recv_timeout(POLL_INTERVAL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if self.cancel.is_cancelled() {
                break;
            }

            let started = Instant::now();
            let detected = panic::catch_unwind(AssertUnwindSafe(|| {
                detector.detect(&job.frame, job.precision)
            }));
            let (detections, health) = match detected {
                Ok(detected) => detected,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    warn!(
                        worker = self.index,
                        seq = job.seq,
                        reason = %reason,
                        "inference engine panicked"
                    );
                    (
                        Vec::new(),
                        DetectorHealth::Unavailable(format!("inference engine panicked: {reason}")),
                    )
                }
            };
            let result = DetectResult {
                seq: job.seq,
                detections,
                health,
                elapsed: started.elapsed(),
            };
            if self.results.send(WorkerMessage::Done(result)).is_err() {
                break;
            }
        }

        debug!(worker = self.index, "inference worker exiting");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
