use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use super::frame::{Frame, FrameSource, SourceError, SourceEvent};
use crate::pipeline::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Create a live capture link: the capture thread owns the [`CaptureFeed`],
/// the pipeline reads from the [`ChannelSource`].
pub fn capture_channel(capacity: usize, nominal_fps: f32) -> (CaptureFeed, ChannelSource) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        CaptureFeed { tx },
        ChannelSource {
            rx,
            nominal_fps,
        },
    )
}

/// Producer side of a capture link. Dropping every feed ends the stream.
#[derive(Clone)]
pub struct CaptureFeed {
    tx: Sender<Frame>,
}

impl CaptureFeed {
    /// Offer a frame without blocking. Returns `false` when the frame was
    /// dropped because the pipeline is behind or gone.
    pub fn offer(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!("capture queue full, dropping frame");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Block until the pipeline accepts the frame.
    pub fn push(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Consumer side of a capture link.
pub struct ChannelSource {
    rx: Receiver<Frame>,
    nominal_fps: f32,
}

impl FrameSource for ChannelSource {
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<SourceEvent, SourceError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(SourceEvent::Cancelled);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(frame) => return Ok(SourceEvent::Frame(frame)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(SourceEvent::EndOfStream),
            }
        }
    }

    fn nominal_fps(&self) -> f32 {
        self.nominal_fps
    }
}
