mod common;

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{MemoryStore, Recorder, Script, config, http_sink, low_memory};
use vehicle_count_rs::config::Precision;
use vehicle_count_rs::performance::Adjustment;
use vehicle_count_rs::persistence::{BatchDocument, read_batch};
use vehicle_count_rs::pipeline::Notice;
use vehicle_count_rs::source::{
    FrameSource, SourceError, SourceEvent, capture_channel,
};
use vehicle_count_rs::{
    Direction, Frame, Pipeline, PipelineError, ReplaySource, RunState, StopReason, TrackState,
};

fn start() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// A car driving down through y = 200, centroid crossing between frames 6 and 7.
fn crossing_script() -> Script {
    (2..10).fold(Script::default(), |script, seq| {
        script.car(seq, 300.0, 125.0 + 10.0 * (seq - 2) as f32)
    })
}

fn batch_files(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    files.sort();
    files
}

#[test]
fn test_single_vehicle_counted_once_with_bounded_trail() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.tracking.trail_length = 5;

    let recorder = Recorder::default();
    let summary = Pipeline::builder(config)
        .source(ReplaySource::synthetic(10, 640, 480, 25.0, start()))
        .engine_factory(crossing_script().factory())
        .observer(recorder.clone())
        .memory_probe(low_memory())
        .build()
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    assert_eq!(summary.frames_processed, 10);
    assert_eq!(summary.frames_detected, 10);
    assert_eq!(summary.records_emitted, 1);
    assert_eq!(summary.unsaved_records, 0);
    assert_eq!(summary.tally.direction(Direction::Down), 1);

    let snapshots = recorder.snapshots();
    let seqs: Vec<u64> = snapshots.iter().map(|s| s.seq).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());

    let at_seven = &snapshots[7];
    assert_eq!(at_seven.tracks.len(), 1);
    assert_eq!(at_seven.tracks[0].trail.len(), 5);
    assert_eq!(at_seven.tracks[0].state, TrackState::Counted);
    assert_eq!(at_seven.tally.total, 1);
    assert_eq!(snapshots[6].tally.total, 0);
    for snapshot in &snapshots {
        for track in &snapshot.tracks {
            assert!(track.trail.len() <= 5);
        }
    }

    // Both formats carry the same single record.
    let files = batch_files(dir.path());
    assert_eq!(files.len(), 2);
    let json = read_batch(&files[1]).unwrap();
    let csv = read_batch(&files[0]).unwrap();
    assert!(files[0].to_str().unwrap().ends_with(".csv"));
    assert_eq!(json, csv);
    assert_eq!(json.len(), 1);
    assert_eq!(json[0].track_id, 1);
    assert_eq!(json[0].trail_length, 5);
    assert_eq!(json[0].direction, Some(Direction::Down));
    assert_eq!(json[0].exited_at, snapshots[7].captured_at);
}

#[test]
fn test_counts_posted_to_api_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (url, bodies) = http_sink();
    let mut config = config(dir.path());
    config.storage.enabled = false;
    config.storage.api.enabled = true;
    config.storage.api.endpoint = url;
    config.storage.api.api_key = "token".into();

    let summary = Pipeline::builder(config)
        .source(ReplaySource::synthetic(10, 640, 480, 25.0, start()))
        .engine_factory(crossing_script().factory())
        .memory_probe(low_memory())
        .build()
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.records_emitted, 1);
    assert_eq!(summary.unsaved_records, 0);
    // Local files are disabled; only the endpoint received the batch.
    assert!(batch_files(dir.path()).is_empty());

    let body = bodies.recv_timeout(Duration::from_secs(5)).unwrap();
    let document: BatchDocument = serde_json::from_str(&body).unwrap();
    assert_eq!(document.records.len(), 1);
    assert_eq!(document.records[0].direction, Some(Direction::Down));
    assert!(bodies.try_recv().is_err());
}

#[test]
fn test_detector_outage_ages_tracks_without_creating_new_ones() {
    let dir = tempfile::tempdir().unwrap();
    let script = (0..10)
        .fold(Script::default(), |script, seq| {
            script.car(seq, 100.0 + seq as f32, 50.0)
        })
        .failing(3..=5);

    let recorder = Recorder::default();
    let summary = Pipeline::builder(config(dir.path()))
        .source(ReplaySource::synthetic(10, 640, 480, 25.0, start()))
        .engine_factory(script.factory())
        .observer(recorder.clone())
        .memory_probe(low_memory())
        .store(MemoryStore::failing(0))
        .build()
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.frames_processed, 10);

    let snapshots = recorder.snapshots();
    let staleness: Vec<u32> = snapshots.iter().map(|s| s.tracks[0].staleness).collect();
    assert_eq!(staleness, vec![0, 0, 0, 1, 2, 3, 0, 0, 0, 0]);
    for snapshot in &snapshots {
        assert_eq!(snapshot.tracks.len(), 1);
        assert_eq!(snapshot.tracks[0].id, 1);
    }
    assert!(!snapshots[4].detector_healthy);
    assert!(snapshots[6].detector_healthy);

    let notices = recorder.notices();
    assert!(matches!(notices[0], Notice::DetectorUnavailable { .. }));
    assert_eq!(notices[1], Notice::DetectorRecovered);
}

#[test]
fn test_engine_crash_is_absorbed() {
    let dir = tempfile::tempdir().unwrap();
    let script = (0..6)
        .fold(Script::default(), |script, seq| {
            script.car(seq, 100.0 + seq as f32, 50.0)
        })
        .panicking([2]);

    let recorder = Recorder::default();
    let pipeline = Pipeline::builder(config(dir.path()))
        .source(ReplaySource::synthetic(6, 640, 480, 25.0, start()))
        .engine_factory(script.factory())
        .observer(recorder.clone())
        .memory_probe(low_memory())
        .store(MemoryStore::failing(0))
        .build()
        .unwrap();
    let (_control, handle) = pipeline.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(handle.is_finished(), "frame loop did not finish");
    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    assert_eq!(summary.frames_processed, 6);

    let snapshots = recorder.snapshots();
    assert!(!snapshots[2].detector_healthy);
    assert!(snapshots[3].detector_healthy);
    assert_eq!(snapshots[2].tracks[0].staleness, 1);
    assert_eq!(snapshots[5].tracks.len(), 1);
    assert!(matches!(
        &recorder.notices()[0],
        Notice::DetectorUnavailable { reason } if reason.contains("engine crashed on frame 2")
    ));
}

#[test]
fn test_skipped_frames_coast_and_reuse_detections() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.frame_skip.frame_skip = 3;
    config.frame_skip.max_frame_skip = 3;
    config.tracking.max_staleness = 1;

    let script = (0..9).fold(Script::default(), |script, seq| {
        script.car(seq, 100.0 + 2.0 * seq as f32, 50.0)
    });
    let recorder = Recorder::default();
    let summary = Pipeline::builder(config)
        .source(ReplaySource::synthetic(9, 640, 480, 25.0, start()))
        .engine_factory(script.factory())
        .observer(recorder.clone())
        .memory_probe(low_memory())
        .store(MemoryStore::failing(0))
        .build()
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(summary.frames_detected, 3);
    assert_eq!(summary.frames_skipped, 6);

    let snapshots = recorder.snapshots();
    let staleness: Vec<u32> = snapshots.iter().map(|s| s.tracks[0].staleness).collect();
    assert_eq!(staleness, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    // A skipped frame shows the last real detection set.
    assert!(!snapshots[1].detected);
    assert_eq!(snapshots[1].detections, snapshots[0].detections);
    assert!(snapshots.iter().all(|s| s.tracks[0].id == 1));
}

#[test]
fn test_replay_is_deterministic() {
    let run = || {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::failing(0);
        let script = crossing_script().car(4, 500.0, 300.0).car(5, 505.0, 300.0);
        let recorder = Recorder::default();
        Pipeline::builder(config(dir.path()))
            .source(ReplaySource::synthetic(10, 640, 480, 25.0, start()))
            .engine_factory(script.factory())
            .observer(recorder.clone())
            .memory_probe(low_memory())
            .store(store.clone())
            .build()
            .unwrap()
            .run()
            .unwrap();
        let tracks: Vec<Vec<(u64, TrackState)>> = recorder
            .snapshots()
            .iter()
            .map(|s| s.tracks.iter().map(|t| (t.id, t.state)).collect())
            .collect();
        (tracks, store.records())
    };

    let (tracks_a, records_a) = run();
    let (tracks_b, records_b) = run();
    assert_eq!(tracks_a, tracks_b);
    assert_eq!(records_a, records_b);
    assert_eq!(records_a.len(), 1);
}

#[test]
fn test_failed_flush_is_retried_at_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.storage.flush_threshold = 1;
    config.storage.save_interval = Duration::from_secs(3600);

    let store = MemoryStore::failing(1);
    let summary = Pipeline::builder(config.clone())
        .source(ReplaySource::synthetic(10, 640, 480, 25.0, start()))
        .engine_factory(crossing_script().factory())
        .memory_probe(low_memory())
        .store(store.clone())
        .build()
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.unsaved_records, 0);
    assert_eq!(store.attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(store.records().len(), 1);

    let broken = MemoryStore::failing(usize::MAX);
    let summary = Pipeline::builder(config)
        .source(ReplaySource::synthetic(10, 640, 480, 25.0, start()))
        .engine_factory(crossing_script().factory())
        .memory_probe(low_memory())
        .store(broken)
        .build()
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.records_emitted, 1);
    assert_eq!(summary.unsaved_records, 1);
}

#[test]
fn test_adaptive_controller_raises_skip_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.performance.adaptive = true;
    // Unreachable target: every window is behind.
    config.performance.target_fps = 1.0e9;
    config.performance.cleanup_interval = Duration::from_millis(1);
    config.frame_skip.max_frame_skip = 3;

    let recorder = Recorder::default();
    let summary = Pipeline::builder(config)
        .source(ReplaySource::synthetic(40, 640, 480, 200.0, start()).paced(true))
        .engine_factory(crossing_script().factory())
        .observer(recorder.clone())
        .memory_probe(low_memory())
        .store(MemoryStore::failing(0))
        .build()
        .unwrap()
        .run()
        .unwrap();

    let adjustments: Vec<Adjustment> = recorder
        .notices()
        .into_iter()
        .filter_map(|notice| match notice {
            Notice::Adjusted { adjustment } => Some(adjustment),
            _ => None,
        })
        .collect();
    assert_eq!(
        adjustments,
        vec![
            Adjustment::SkipInterval { from: 1, to: 2 },
            Adjustment::SkipInterval { from: 2, to: 3 },
            Adjustment::Precision {
                from: Precision::Full,
                to: Precision::Half
            },
            Adjustment::ActiveWorkers { from: 2, to: 1 },
        ]
    );
    assert!(summary.frames_skipped > 0);
    let last = recorder.snapshots().pop().unwrap();
    assert_eq!(last.skip_interval, 3);
    assert_eq!(last.precision, Precision::Half);
}

#[test]
fn test_memory_pressure_triggers_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.performance.cleanup_interval = Duration::from_millis(1);
    config.tracking.max_staleness = 10;

    // Car seen on frames 0..3 only, then stale.
    let script = (0..3).fold(Script::default(), |script, seq| script.car(seq, 100.0, 50.0));
    let recorder = Recorder::default();
    Pipeline::builder(config)
        .source(ReplaySource::synthetic(30, 640, 480, 200.0, start()).paced(true))
        .engine_factory(script.factory())
        .observer(recorder.clone())
        .memory_probe(|| Some(95.0_f32))
        .store(MemoryStore::failing(0))
        .build()
        .unwrap()
        .run()
        .unwrap();

    // Cleanup retires it once staleness reaches max_staleness / 2, long
    // before regular retirement at 10.
    assert!(recorder.snapshots().last().unwrap().tracks.is_empty());
    assert!(
        recorder
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::MemoryCleanup { retired: 1 }))
    );
}

#[test]
fn test_skip_tracking_publishes_raw_detections() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.tracking.skip_tracking = true;

    let recorder = Recorder::default();
    let summary = Pipeline::builder(config)
        .source(ReplaySource::synthetic(10, 640, 480, 25.0, start()))
        .engine_factory(crossing_script().factory())
        .observer(recorder.clone())
        .memory_probe(low_memory())
        .store(MemoryStore::failing(0))
        .build()
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(summary.records_emitted, 0);
    let snapshots = recorder.snapshots();
    assert!(snapshots.iter().all(|s| s.tracks.is_empty()));
    assert_eq!(snapshots[5].detections.len(), 1);
}

#[test]
fn test_pause_keeps_tracks_and_stop_drains() {
    let dir = tempfile::tempdir().unwrap();
    let (feed, source) = capture_channel(16, 25.0);
    let script = (0..10).fold(Script::default(), |script, seq| {
        script.car(seq, 100.0 + seq as f32, 50.0)
    });
    let recorder = Recorder::default();
    let store = MemoryStore::failing(0);
    let mut config = config(dir.path());
    config.tracking.counting_lines.clear();

    let pipeline = Pipeline::builder(config)
        .source(source)
        .engine_factory(script.factory())
        .observer(recorder.clone())
        .memory_probe(low_memory())
        .store(store.clone())
        .build()
        .unwrap();
    let (control, handle) = pipeline.start().unwrap();

    let frame = |seq: u64| Frame::blank(seq, Utc::now(), 640, 480);
    let wait_for = |count: usize| {
        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.frame_count() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        recorder.frame_count()
    };

    for seq in 0..3 {
        assert!(feed.push(frame(seq)));
    }
    assert_eq!(wait_for(3), 3);

    assert!(control.pause());
    assert_eq!(control.state(), RunState::Paused);
    for seq in 3..5 {
        assert!(feed.push(frame(seq)));
    }
    // At most the read already in progress completes.
    thread::sleep(Duration::from_millis(100));
    let paused_count = recorder.frame_count();
    assert!(paused_count <= 4);
    let before = recorder.snapshots().pop().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.frame_count(), paused_count);
    assert_eq!(recorder.snapshots().pop().unwrap(), before);
    assert_eq!(before.tracks[0].staleness, 0);

    assert!(control.resume());
    assert_eq!(wait_for(5), 5);

    control.stop();
    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.stop_reason, StopReason::Stopped);
    assert_eq!(summary.frames_processed, 5);
    assert_eq!(control.state(), RunState::Stopped);
    // The active track completes at stop and its record is flushed.
    assert_eq!(summary.records_emitted, 1);
    assert_eq!(store.records().len(), 1);
    drop(feed);
}

/// Always disconnected.
struct DeadCamera;

impl FrameSource for DeadCamera {
    fn next_frame(
        &mut self,
        _cancel: &vehicle_count_rs::pipeline::CancelToken,
    ) -> Result<SourceEvent, SourceError> {
        Err(SourceError::unavailable("no signal"))
    }

    fn nominal_fps(&self) -> f32 {
        25.0
    }
}

#[test]
fn test_source_unavailable_stops_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.source.reconnect_attempts = 2;
    config.source.reconnect_backoff = Duration::from_millis(1);

    let recorder = Recorder::default();
    let summary = Pipeline::builder(config)
        .source(DeadCamera)
        .observer(recorder.clone())
        .memory_probe(low_memory())
        .store(MemoryStore::failing(0))
        .build()
        .unwrap()
        .run()
        .unwrap();

    assert!(matches!(
        summary.stop_reason,
        StopReason::SourceUnavailable { attempts: 2, .. }
    ));
    let reconnects = recorder
        .notices()
        .iter()
        .filter(|n| matches!(n, Notice::SourceReconnecting { .. }))
        .count();
    assert_eq!(reconnects, 2);
}

#[test]
fn test_build_rejects_invalid_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let mut bad = config(dir.path());
    bad.frame_skip.frame_skip = 0;
    let err = Pipeline::builder(bad)
        .source(ReplaySource::synthetic(1, 8, 8, 25.0, start()))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::ConfigurationInvalid(_)));

    let err = Pipeline::builder(config(dir.path())).build().err().unwrap();
    assert!(err.is_terminal());
}

#[test]
fn test_without_engine_runs_empty() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let summary = Pipeline::builder(config(dir.path()))
        .source(ReplaySource::synthetic(5, 640, 480, 25.0, start()))
        .observer(recorder.clone())
        .memory_probe(low_memory())
        .store(MemoryStore::failing(0))
        .build()
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.frames_processed, 5);
    assert_eq!(summary.records_emitted, 0);
    assert!(recorder.snapshots().iter().all(|s| !s.detector_healthy));
}
