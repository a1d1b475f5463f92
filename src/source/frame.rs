//! Frames and the frame source contract.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::pipeline::CancelToken;

/// An immutable RGB8 image sample.
///
/// Cloning is cheap: the pixel buffer is shared.
#[derive(Debug, Clone)]
pub struct Frame {
    seq: u64,
    captured_at: DateTime<Utc>,
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl Frame {
    pub fn new(
        seq: u64,
        captured_at: DateTime<Utc>,
        width: u32,
        height: u32,
        pixels: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            seq,
            captured_at,
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// A frame without pixel data, for synthetic streams.
    pub fn blank(seq: u64, captured_at: DateTime<Utc>, width: u32, height: u32) -> Self {
        Self::new(seq, captured_at, width, height, Vec::new())
    }

    /// Monotonic sequence number assigned by the source.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major RGB8 pixels; empty for blank frames.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// What a source produced on one read.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Frame(Frame),
    /// The stream ended (file finished, capture feed closed). Terminal.
    EndOfStream,
    /// The read was abandoned because the stop signal fired.
    Cancelled,
}

/// Transient source failures. Retried by [`super::ReconnectingSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("frame decode failed: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }
}

/// A live or file-based video input.
///
/// Implementations must hand out frames in strictly increasing `seq` order and
/// may block while waiting for the next capture, as long as they return
/// [`SourceEvent::Cancelled`] promptly once `cancel` fires.
pub trait FrameSource: Send {
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<SourceEvent, SourceError>;

    /// Re-open the underlying device after a transient failure.
    fn reconnect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Nominal capture rate in frames per second.
    fn nominal_fps(&self) -> f32;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<SourceEvent, SourceError> {
        (**self).next_frame(cancel)
    }

    fn reconnect(&mut self) -> Result<(), SourceError> {
        (**self).reconnect()
    }

    fn nominal_fps(&self) -> f32 {
        (**self).nominal_fps()
    }
}
