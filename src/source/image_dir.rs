use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use super::frame::{Frame, FrameSource, SourceError, SourceEvent};
use crate::pipeline::CancelToken;

const EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Reads a directory of still frames in lexicographic file-name order.
pub struct ImageSequenceSource {
    paths: VecDeque<PathBuf>,
    next_seq: u64,
    nominal_fps: f32,
    started_at: DateTime<Utc>,
}

impl ImageSequenceSource {
    pub fn open(dir: impl AsRef<Path>, nominal_fps: f32) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SourceError::unavailable(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();

        info!(dir = %dir.display(), frames = paths.len(), "image sequence opened");
        Ok(Self {
            paths: paths.into(),
            next_seq: 0,
            nominal_fps,
            started_at: Utc::now(),
        })
    }

    fn timestamp(&self, seq: u64) -> DateTime<Utc> {
        let micros = (seq as f64 * 1_000_000.0 / self.nominal_fps.max(f32::EPSILON) as f64) as i64;
        self.started_at + TimeDelta::microseconds(micros)
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<SourceEvent, SourceError> {
        if cancel.is_cancelled() {
            return Ok(SourceEvent::Cancelled);
        }
        let Some(path) = self.paths.pop_front() else {
            return Ok(SourceEvent::EndOfStream);
        };

        // The sequence number advances even when decoding fails so that the
        // next readable file never reuses it.
        let seq = self.next_seq;
        self.next_seq += 1;

        let image = image::open(&path)
            .map_err(|e| SourceError::Decode(format!("{}: {e}", path.display())))?
            .to_rgb8();
        debug!(seq, path = %path.display(), "frame decoded");

        let (width, height) = image.dimensions();
        Ok(SourceEvent::Frame(Frame::new(
            seq,
            self.timestamp(seq),
            width,
            height,
            image.into_raw(),
        )))
    }

    fn nominal_fps(&self) -> f32 {
        self.nominal_fps
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    #[test]
    fn test_reads_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(4, 3).save(dir.path().join("frame_002.png")).unwrap();
        RgbImage::new(4, 3).save(dir.path().join("frame_001.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageSequenceSource::open(dir.path(), 10.0).unwrap();
        let cancel = CancelToken::new();

        let SourceEvent::Frame(first) = source.next_frame(&cancel).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(first.seq(), 0);
        assert_eq!((first.width(), first.height()), (4, 3));
        assert_eq!(first.pixels().len(), 4 * 3 * 3);

        let SourceEvent::Frame(second) = source.next_frame(&cancel).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(second.seq(), 1);
        assert!(second.captured_at() > first.captured_at());
        assert!(matches!(source.next_frame(&cancel).unwrap(), SourceEvent::EndOfStream));
    }

    #[test]
    fn test_corrupt_file_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"not a png").unwrap();
        RgbImage::new(2, 2).save(dir.path().join("b.png")).unwrap();

        let mut source = ImageSequenceSource::open(dir.path(), 10.0).unwrap();
        let cancel = CancelToken::new();
        assert!(matches!(source.next_frame(&cancel), Err(SourceError::Decode(_))));
        let SourceEvent::Frame(frame) = source.next_frame(&cancel).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.seq(), 1);
    }

    #[test]
    fn test_missing_directory() {
        assert!(ImageSequenceSource::open("/definitely/not/here", 10.0).is_err());
    }
}
