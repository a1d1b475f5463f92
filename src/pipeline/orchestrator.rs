//! The frame loop tying source, detection, tracking, adaptation and
//! persistence together.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::control::{CancelToken, ControlHandle};
use super::snapshot::{FrameObserver, Notice, PipelineSnapshot, TrackSnapshot};
use crate::config::{PipelineConfig, Precision};
use crate::detector::{
    DetectResult, Detection, DetectorHealth, InferencePool, SharedEngineFactory, SubmitOutcome,
    no_engine,
};
use crate::error::{PipelineError, Result};
use crate::performance::{
    AdaptiveController, Adjustment, FrameTiming, MemoryProbe, PerformanceMonitor, SystemMemory,
};
use crate::persistence::{ApiStore, CountRecord, CountStore, FileStore, PersistenceScheduler};
use crate::skip::{FrameSkipController, SkipDecision};
use crate::source::{Frame, FrameSource, ReconnectingSource, SourceEvent};
use crate::tracker::{CountTally, FrameContext, Tracker};

const MAX_FRAME_BUDGET: Duration = Duration::from_millis(200);

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StopReason {
    EndOfStream,
    /// [`ControlHandle::stop`] was called.
    Stopped,
    /// The source stayed down after every reconnect attempt.
    SourceUnavailable { attempts: u32, reason: String },
}

/// Totals reported when a run ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub frames_processed: u64,
    pub frames_detected: u64,
    pub frames_skipped: u64,
    /// Detection frames downgraded to skipped because every worker was busy.
    pub backpressure_skips: u64,
    pub records_emitted: u64,
    /// Records a storage target never confirmed, summed over targets.
    pub unsaved_records: usize,
    pub tally: CountTally,
    pub stop_reason: StopReason,
}

/// Assembles a [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    source: Option<Box<dyn FrameSource>>,
    engines: SharedEngineFactory,
    store: Option<Arc<dyn CountStore>>,
    observers: Vec<Box<dyn FrameObserver>>,
    memory: Option<Box<dyn MemoryProbe>>,
}

impl PipelineBuilder {
    pub fn source(mut self, source: impl FrameSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn engine_factory(mut self, engines: SharedEngineFactory) -> Self {
        self.engines = engines;
        self
    }

    /// Replace the default [`FileStore`].
    pub fn store(mut self, store: Arc<dyn CountStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn observer(mut self, observer: impl FrameObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn memory_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        self.memory = Some(Box::new(probe));
        self
    }

    /// Validate the configuration and assemble the pipeline. Nothing is
    /// started yet.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let source = self
            .source
            .ok_or_else(|| PipelineError::config("a frame source is required"))?;
        let store = if self.config.storage.enabled {
            Some(
                self.store
                    .unwrap_or_else(|| Arc::new(FileStore::from_config(&self.config.storage))),
            )
        } else {
            None
        };
        let api = &self.config.storage.api;
        let api: Option<Arc<dyn CountStore>> = if api.enabled {
            Some(Arc::new(ApiStore::from_config(api)))
        } else {
            None
        };
        Ok(Pipeline {
            config: Arc::new(self.config),
            source,
            engines: self.engines,
            store,
            api,
            observers: self.observers,
            memory: self.memory.unwrap_or_else(|| Box::new(SystemMemory::new())),
            control: ControlHandle::new(),
        })
    }
}

/// A configured pipeline, ready to run once.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    source: Box<dyn FrameSource>,
    engines: SharedEngineFactory,
    store: Option<Arc<dyn CountStore>>,
    api: Option<Arc<dyn CountStore>>,
    observers: Vec<Box<dyn FrameObserver>>,
    memory: Box<dyn MemoryProbe>,
    control: ControlHandle,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            source: None,
            engines: no_engine(),
            store: None,
            observers: Vec::new(),
            memory: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle for pausing and stopping this pipeline from another thread.
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Run the frame loop on a dedicated thread.
    pub fn start(self) -> Result<(ControlHandle, JoinHandle<Result<RunSummary>>)> {
        let control = self.control();
        let handle = thread::Builder::new()
            .name("frame-loop".into())
            .spawn(move || self.run())?;
        Ok((control, handle))
    }

    /// Run the frame loop on the calling thread until end of stream, a stop
    /// request, or a terminal source failure.
    pub fn run(self) -> Result<RunSummary> {
        let Pipeline {
            config,
            source,
            engines,
            store,
            api,
            observers,
            memory,
            control,
        } = self;

        info!(
            workers = config.detection.max_worker_threads,
            frame_skip = config.frame_skip.frame_skip,
            skip_tracking = config.tracking.skip_tracking,
            persistence = store.is_some(),
            api = api.is_some(),
            "pipeline starting"
        );

        let cancel = control.cancel_token();
        let source = ReconnectingSource::new(source, &config.source);
        let frame_budget = capture_period(source.nominal_fps());
        let mut frame_loop = FrameLoop {
            source,
            frame_budget,
            pool: InferencePool::new(engines, &config.detection),
            skip: FrameSkipController::new(&config.frame_skip),
            tracker: Tracker::new(&config.tracking),
            controller: AdaptiveController::new(&config),
            monitor: PerformanceMonitor::new(config.performance.window_size),
            schedulers: store
                .map(|store| PersistenceScheduler::new(&config.storage, store))
                .into_iter()
                .chain(api.map(|api| {
                    PersistenceScheduler::new(&config.storage.api.schedule(), api)
                }))
                .collect(),
            observers,
            memory,
            precision: config.detection.precision,
            pending: VecDeque::new(),
            last_detections: Vec::new(),
            detector_healthy: true,
            counters: Counters::default(),
            config,
            cancel,
        };

        control.mark_running();
        let outcome = frame_loop.run(&control);
        let summary = frame_loop.shutdown(outcome);
        control.mark_stopped();
        summary
    }
}

/// One capture period at `nominal_fps`, capped at [`MAX_FRAME_BUDGET`].
fn capture_period(nominal_fps: f32) -> Duration {
    let secs = 1.0 / nominal_fps;
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f32(secs.min(MAX_FRAME_BUDGET.as_secs_f32()))
    } else {
        MAX_FRAME_BUDGET
    }
}

/// A frame waiting for its turn at the tracker.
#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    seq: u64,
    captured_at: DateTime<Utc>,
    skip_interval: u32,
    detect: bool,
}

impl PendingFrame {
    fn new(frame: &Frame, skip_interval: u32, detect: bool) -> Self {
        Self {
            seq: frame.seq(),
            captured_at: frame.captured_at(),
            skip_interval,
            detect,
        }
    }

    fn context(&self) -> FrameContext {
        FrameContext::new(self.seq, self.captured_at, self.skip_interval)
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    detected: u64,
    skipped: u64,
    backpressure: u64,
    records: u64,
}

/// How long [`FrameLoop::drain`] may wait for outstanding detections.
#[derive(Debug, Clone, Copy)]
enum Drain {
    /// Up to the given time, then leave the rest queued.
    Within(Duration),
    /// Until every queued frame is tracked or the run is cancelled.
    All,
}

/// Time spent at the tracker and waiting on detection while handling queued
/// frames.
#[derive(Debug, Default)]
struct DrainTiming {
    detect: Option<Duration>,
    track: Duration,
}

struct FrameLoop {
    config: Arc<PipelineConfig>,
    cancel: CancelToken,
    source: ReconnectingSource<Box<dyn FrameSource>>,
    pool: InferencePool,
    skip: FrameSkipController,
    tracker: Tracker,
    controller: AdaptiveController,
    monitor: PerformanceMonitor,
    /// Local files first, then the API target, each on its own schedule.
    schedulers: Vec<PersistenceScheduler>,
    observers: Vec<Box<dyn FrameObserver>>,
    memory: Box<dyn MemoryProbe>,
    precision: Precision,
    /// One capture period: the longest a frame waits on its own detections
    /// before the loop moves on to the next capture.
    frame_budget: Duration,
    /// Frames handed to the loop but not yet tracked, in sequence order.
    pending: VecDeque<PendingFrame>,
    last_detections: Vec<Detection>,
    detector_healthy: bool,
    counters: Counters,
}

impl FrameLoop {
    fn run(&mut self, control: &ControlHandle) -> Result<StopReason> {
        loop {
            if !control.wait_while_paused() {
                return Ok(StopReason::Stopped);
            }

            let observers = &mut self.observers;
            let event = self.source.read(&self.cancel, |attempt, err| {
                let notice = Notice::SourceReconnecting {
                    attempt,
                    reason: err.to_string(),
                };
                for observer in observers.iter_mut() {
                    observer.on_notice(&notice);
                }
            });

            let frame = match event {
                Ok(SourceEvent::Frame(frame)) => frame,
                Ok(SourceEvent::EndOfStream) => {
                    info!(frames = self.counters.processed, "end of stream");
                    self.drain(Drain::All);
                    return Ok(StopReason::EndOfStream);
                }
                Ok(SourceEvent::Cancelled) => return Ok(StopReason::Stopped),
                Err(PipelineError::SourceUnavailable { attempts, reason }) => {
                    error!(attempts, reason = %reason, "frame source lost");
                    self.drain(Drain::All);
                    return Ok(StopReason::SourceUnavailable { attempts, reason });
                }
                Err(err) => return Err(err),
            };

            let started = Instant::now();
            self.ingest(frame);
            let timing = self.drain(Drain::Within(self.frame_budget));
            self.monitor.record(FrameTiming {
                detect: timing.detect,
                track: timing.track,
                total: started.elapsed(),
            });
            self.housekeeping(Instant::now());
        }
    }

    /// Decide, submit and queue one frame.
    fn ingest(&mut self, frame: Frame) {
        let interval = self.skip.interval();
        let pending = match self.skip.decide() {
            SkipDecision::Skip => PendingFrame::new(&frame, interval, false),
            SkipDecision::Detect => {
                let entry = PendingFrame::new(&frame, interval, true);
                let wait = self.config.runtime.backpressure_wait;
                match self.pool.submit_timeout(frame, self.precision, wait) {
                    SubmitOutcome::Submitted => entry,
                    SubmitOutcome::Busy(frame) => {
                        debug!(seq = frame.seq(), "inference workers busy, skipping detection");
                        self.counters.backpressure += 1;
                        PendingFrame::new(&frame, interval, false)
                    }
                }
            }
        };
        self.pending.push_back(pending);
    }

    /// Hand queued frames to the tracker in order, waiting for detections as
    /// `drain` allows.
    fn drain(&mut self, drain: Drain) -> DrainTiming {
        let mut timing = DrainTiming::default();
        let deadline = match drain {
            Drain::Within(wait) => Some(Instant::now() + wait),
            Drain::All => None,
        };
        while let Some(front) = self.pending.front().copied() {
            let result = if front.detect {
                let ready = match deadline {
                    Some(deadline) => self
                        .pool
                        .next_ready_within(deadline.saturating_duration_since(Instant::now())),
                    None => self.pool.wait_next(&self.cancel),
                };
                match ready {
                    Some(result) => Some(result),
                    None if self.cancel.is_cancelled() => break,
                    None if deadline.is_none() || self.pool.outstanding() == 0 => {
                        // Workers are gone; nothing is coming for this frame.
                        Some(DetectResult {
                            seq: front.seq,
                            detections: Vec::new(),
                            health: DetectorHealth::Unavailable("inference workers stopped".into()),
                            elapsed: Duration::ZERO,
                        })
                    }
                    None => break,
                }
            } else {
                None
            };
            self.pending.pop_front();

            if let Some(result) = &result {
                timing.detect = Some(timing.detect.unwrap_or_default().max(result.elapsed));
            }
            let tracked = Instant::now();
            self.process(front, result);
            timing.track += tracked.elapsed();
        }
        timing
    }

    fn process(&mut self, frame: PendingFrame, result: Option<DetectResult>) {
        let ctx = frame.context();
        let records = match result {
            Some(result) => {
                self.counters.detected += 1;
                self.observe_health(&result.health);
                self.last_detections = result.detections;
                if self.config.tracking.skip_tracking {
                    Vec::new()
                } else {
                    self.tracker.update(&ctx, &self.last_detections)
                }
            }
            None => {
                self.counters.skipped += 1;
                if !self.config.tracking.skip_tracking {
                    self.tracker.coast(&ctx);
                }
                Vec::new()
            }
        };
        self.counters.processed += 1;
        self.persist(records);
        self.publish(frame);
    }

    fn observe_health(&mut self, health: &DetectorHealth) {
        match health {
            DetectorHealth::Healthy if !self.detector_healthy => {
                self.detector_healthy = true;
                info!("detector recovered");
                self.notify(&Notice::DetectorRecovered);
            }
            DetectorHealth::Unavailable(reason) if self.detector_healthy => {
                self.detector_healthy = false;
                warn!(reason = %reason, "detector unavailable, showing last known tracks");
                self.notify(&Notice::DetectorUnavailable {
                    reason: reason.clone(),
                });
            }
            _ => {}
        }
    }

    fn persist(&mut self, records: Vec<CountRecord>) {
        if records.is_empty() {
            return;
        }
        self.counters.records += records.len() as u64;
        for scheduler in &mut self.schedulers {
            scheduler.push(records.iter().cloned());
        }
    }

    fn publish(&mut self, frame: PendingFrame) {
        if self.observers.is_empty() {
            return;
        }
        let snapshot = PipelineSnapshot {
            seq: frame.seq,
            captured_at: frame.captured_at,
            detected: frame.detect,
            detections: self.last_detections.clone(),
            tracks: self.tracker.tracks().iter().map(TrackSnapshot::from).collect(),
            tally: self.tracker.tally().clone(),
            skip_interval: frame.skip_interval,
            precision: self.precision,
            detector_healthy: self.detector_healthy,
            performance: self.monitor.sample(),
        };
        for observer in &mut self.observers {
            observer.on_frame(&snapshot);
        }
    }

    fn notify(&mut self, notice: &Notice) {
        for observer in &mut self.observers {
            observer.on_notice(notice);
        }
    }

    /// Periodic work: adaptive control and persistence triggers.
    fn housekeeping(&mut self, now: Instant) {
        if self.controller.is_due(now) {
            if let Some(percent) = self.memory.used_percent() {
                self.monitor.set_memory_percent(percent);
            }
            let adjustments = self.controller.evaluate(now, &self.monitor.sample());
            for adjustment in adjustments {
                self.apply(adjustment);
            }
        }
        for scheduler in &mut self.schedulers {
            scheduler.tick(now);
        }
    }

    fn apply(&mut self, adjustment: Adjustment) {
        match adjustment {
            Adjustment::SkipInterval { to, .. } => {
                self.skip.set_interval(to);
            }
            Adjustment::Precision { to, .. } => {
                self.precision = to;
            }
            Adjustment::ActiveWorkers { to, .. } => {
                self.pool.set_active_workers(to);
            }
            Adjustment::Cleanup => {
                let before = self.tracker.tracks().len();
                let records = self.tracker.cleanup();
                let retired = before - self.tracker.tracks().len();
                self.persist(records);
                self.last_detections = Vec::new();
                self.pending.shrink_to_fit();
                self.notify(&Notice::MemoryCleanup { retired });
            }
        }
        if adjustment != Adjustment::Cleanup {
            // The window measured the old settings.
            self.monitor.clear();
            info!(?adjustment, "adaptive adjustment applied");
        }
        self.notify(&Notice::Adjusted { adjustment });
    }

    /// Release workers, complete remaining tracks and flush persistence.
    fn shutdown(mut self, outcome: Result<StopReason>) -> Result<RunSummary> {
        let grace = self.config.runtime.shutdown_grace;
        self.pool.shutdown(grace);
        if !self.pending.is_empty() {
            debug!(frames = self.pending.len(), "abandoning frames still awaiting detection");
            self.pending.clear();
        }

        if !self.config.tracking.skip_tracking {
            let records = self.tracker.finish();
            self.persist(records);
        }
        let unsaved = self
            .schedulers
            .iter_mut()
            .map(|scheduler| scheduler.shutdown(grace))
            .sum();

        let stop_reason = outcome?;
        let summary = RunSummary {
            frames_processed: self.counters.processed,
            frames_detected: self.counters.detected,
            frames_skipped: self.counters.skipped,
            backpressure_skips: self.counters.backpressure,
            records_emitted: self.counters.records,
            unsaved_records: unsaved,
            tally: self.tracker.tally().clone(),
            stop_reason,
        };
        info!(
            frames = summary.frames_processed,
            records = summary.records_emitted,
            unsaved = summary.unsaved_records,
            reason = ?summary.stop_reason,
            "pipeline stopped"
        );
        Ok(summary)
    }
}
