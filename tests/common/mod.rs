#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use vehicle_count_rs::config::{OutputFormat, PipelineConfig};
use vehicle_count_rs::detector::{
    EngineError, InferenceEngine, InferenceSettings, RawDetection, SharedEngineFactory,
};
use vehicle_count_rs::pipeline::{FrameObserver, Notice, PipelineSnapshot};
use vehicle_count_rs::{CountRecord, CountStore, CountingLine, Frame, Point, Rect, Result};

pub const CAR: usize = 2;

/// Detections per frame, plus frames on which inference fails or panics.
#[derive(Debug, Default)]
pub struct Script {
    pub frames: BTreeMap<u64, Vec<RawDetection>>,
    pub failing: BTreeSet<u64>,
    pub panicking: BTreeSet<u64>,
}

impl Script {
    pub fn car(mut self, seq: u64, x: f32, y: f32) -> Self {
        self.frames
            .entry(seq)
            .or_default()
            .push(RawDetection::new(Rect::new(x, y, 80.0, 60.0), 0.9, CAR));
        self
    }

    pub fn failing(mut self, seqs: impl IntoIterator<Item = u64>) -> Self {
        self.failing.extend(seqs);
        self
    }

    pub fn panicking(mut self, seqs: impl IntoIterator<Item = u64>) -> Self {
        self.panicking.extend(seqs);
        self
    }

    pub fn factory(self) -> SharedEngineFactory {
        let script = Arc::new(self);
        Arc::new(move || -> std::result::Result<Box<dyn InferenceEngine>, EngineError> {
            Ok(Box::new(ScriptedEngine {
                script: Arc::clone(&script),
            }))
        })
    }
}

struct ScriptedEngine {
    script: Arc<Script>,
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn infer(
        &mut self,
        frame: &Frame,
        _settings: &InferenceSettings,
    ) -> std::result::Result<Vec<RawDetection>, EngineError> {
        if self.script.panicking.contains(&frame.seq()) {
            panic!("engine crashed on frame {}", frame.seq());
        }
        if self.script.failing.contains(&frame.seq()) {
            return Err(EngineError::Unavailable("device lost".into()));
        }
        Ok(self.script.frames.get(&frame.seq()).cloned().unwrap_or_default())
    }
}

/// Collects everything the pipeline publishes.
#[derive(Clone, Default)]
pub struct Recorder {
    pub frames: Arc<Mutex<Vec<PipelineSnapshot>>>,
    pub notices: Arc<Mutex<Vec<Notice>>>,
}

impl Recorder {
    pub fn snapshots(&self) -> Vec<PipelineSnapshot> {
        self.frames.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl FrameObserver for Recorder {
    fn on_frame(&mut self, snapshot: &PipelineSnapshot) {
        self.frames.lock().unwrap().push(snapshot.clone());
    }

    fn on_notice(&mut self, notice: &Notice) {
        self.notices.lock().unwrap().push(notice.clone());
    }
}

/// In-memory store failing its first `fail_first` writes.
#[derive(Default)]
pub struct MemoryStore {
    pub batches: Mutex<Vec<Vec<CountRecord>>>,
    pub attempts: AtomicUsize,
    pub fail_first: usize,
}

impl MemoryStore {
    pub fn failing(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            ..Self::default()
        })
    }

    pub fn records(&self) -> Vec<CountRecord> {
        self.batches.lock().unwrap().concat()
    }
}

impl CountStore for MemoryStore {
    fn write(&self, records: &[CountRecord], _format: OutputFormat) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(vehicle_count_rs::PipelineError::persistence("disk full"));
        }
        self.batches.lock().unwrap().push(records.to_vec());
        Ok(())
    }
}

pub fn horizontal_line(y: f32) -> CountingLine {
    CountingLine::new(Point::new(0.0, y), Point::new(640.0, y))
}

/// Deterministic settings: detection every frame, no adaptation, and enough
/// backpressure patience that no detection frame is ever downgraded.
pub fn config(output_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.frame_skip.frame_skip = 1;
    config.frame_skip.max_frame_skip = 1;
    config.performance.adaptive = false;
    config.detection.max_worker_threads = 2;
    config.detection.queue_depth = 2;
    config.runtime.backpressure_wait = Duration::from_secs(5);
    config.runtime.shutdown_grace = Duration::from_secs(2);
    config.storage.output_dir = output_dir.to_path_buf();
    config.storage.format = OutputFormat::Both;
    config.tracking.counting_lines = vec![horizontal_line(200.0)];
    config
}

pub fn low_memory() -> impl FnMut() -> Option<f32> + Send + 'static {
    || Some(10.0_f32)
}

/// Accept HTTP requests on a local port, answer 200 and forward each body.
pub fn http_sink() -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/ingest", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = stream.unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    length = value.trim().parse().unwrap();
                }
            }
            let mut body = vec![0; length];
            reader.read_exact(&mut body).unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
            if tx.send(String::from_utf8(body).unwrap()).is_err() {
                break;
            }
        }
    });
    (url, rx)
}
