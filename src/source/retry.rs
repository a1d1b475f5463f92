use std::time::Duration;

use tracing::{info, warn};

use super::frame::{FrameSource, SourceError, SourceEvent};
use crate::config::SourceConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::CancelToken;

/// Wraps a source with reconnect-and-backoff handling and sequence checks.
///
/// Transient failures are retried up to `reconnect_attempts` times with
/// exponential backoff; after that the failure escalates to
/// [`PipelineError::SourceUnavailable`]. Frames whose sequence number does not
/// increase are dropped.
pub struct ReconnectingSource<S> {
    inner: S,
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    last_seq: Option<u64>,
}

impl<S: FrameSource> ReconnectingSource<S> {
    pub fn new(inner: S, config: &SourceConfig) -> Self {
        Self {
            inner,
            max_attempts: config.reconnect_attempts,
            base_backoff: config.reconnect_backoff,
            max_backoff: config.max_backoff.max(config.reconnect_backoff),
            last_seq: None,
        }
    }

    pub fn nominal_fps(&self) -> f32 {
        self.inner.nominal_fps()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Read the next event. `on_retry` is told about every reconnect attempt.
    pub fn read(
        &mut self,
        cancel: &CancelToken,
        mut on_retry: impl FnMut(u32, &SourceError),
    ) -> Result<SourceEvent> {
        let mut attempt = 0;
        loop {
            match self.inner.next_frame(cancel) {
                Ok(SourceEvent::Frame(frame)) => {
                    if let Some(last) = self.last_seq {
                        if frame.seq() <= last {
                            warn!(seq = frame.seq(), last, "out-of-order frame dropped");
                            continue;
                        }
                    }
                    if attempt > 0 {
                        info!(attempts = attempt, "frame source recovered");
                    }
                    self.last_seq = Some(frame.seq());
                    return Ok(SourceEvent::Frame(frame));
                }
                Ok(event) => return Ok(event),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.max_attempts {
                        return Err(PipelineError::SourceUnavailable {
                            attempts: self.max_attempts,
                            reason: err.to_string(),
                        });
                    }
                    let delay = self.backoff(attempt);
                    warn!(attempt, ?delay, error = %err, "frame source unavailable, reconnecting");
                    on_retry(attempt, &err);
                    if !cancel.sleep(delay) {
                        return Ok(SourceEvent::Cancelled);
                    }
                    if let Err(err) = self.inner.reconnect() {
                        warn!(attempt, error = %err, "reconnect failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::source::Frame;

    /// Replays a script of reads.
    struct ScriptedSource {
        script: Vec<std::result::Result<Option<u64>, ()>>,
        reconnects: u32,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(
            &mut self,
            _cancel: &CancelToken,
        ) -> std::result::Result<SourceEvent, SourceError> {
            if self.script.is_empty() {
                return Ok(SourceEvent::EndOfStream);
            }
            match self.script.remove(0) {
                Ok(Some(seq)) => Ok(SourceEvent::Frame(Frame::blank(seq, Utc::now(), 8, 8))),
                Ok(None) => Ok(SourceEvent::EndOfStream),
                Err(()) => Err(SourceError::unavailable("camera unplugged")),
            }
        }

        fn reconnect(&mut self) -> std::result::Result<(), SourceError> {
            self.reconnects += 1;
            Ok(())
        }

        fn nominal_fps(&self) -> f32 {
            30.0
        }
    }

    fn fast_config(attempts: u32) -> SourceConfig {
        SourceConfig {
            reconnect_attempts: attempts,
            reconnect_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_recovers_within_attempt_budget() {
        let inner = ScriptedSource {
            script: vec![Ok(Some(0)), Err(()), Err(()), Ok(Some(1))],
            reconnects: 0,
        };
        let mut source = ReconnectingSource::new(inner, &fast_config(3));
        let cancel = CancelToken::new();
        let mut retries = Vec::new();

        assert!(matches!(source.read(&cancel, |_, _| {}).unwrap(), SourceEvent::Frame(_)));
        let event = source.read(&cancel, |attempt, _| retries.push(attempt)).unwrap();
        let SourceEvent::Frame(frame) = event else {
            panic!("expected a frame");
        };
        assert_eq!(frame.seq(), 1);
        assert_eq!(retries, vec![1, 2]);
        assert_eq!(source.inner.reconnects, 2);
    }

    #[test]
    fn test_escalates_after_attempt_ceiling() {
        let inner = ScriptedSource {
            script: vec![Err(()), Err(()), Err(())],
            reconnects: 0,
        };
        let mut source = ReconnectingSource::new(inner, &fast_config(2));
        let err = source.read(&CancelToken::new(), |_, _| {}).unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { attempts: 2, .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_drops_non_increasing_sequence() {
        let inner = ScriptedSource {
            script: vec![Ok(Some(5)), Ok(Some(5)), Ok(Some(3)), Ok(Some(6))],
            reconnects: 0,
        };
        let mut source = ReconnectingSource::new(inner, &fast_config(0));
        let cancel = CancelToken::new();
        let mut seqs = Vec::new();
        while let SourceEvent::Frame(frame) = source.read(&cancel, |_, _| {}).unwrap() {
            seqs.push(frame.seq());
        }
        assert_eq!(seqs, vec![5, 6]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let inner = ScriptedSource {
            script: vec![],
            reconnects: 0,
        };
        let config = SourceConfig {
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };
        let source = ReconnectingSource::new(inner, &config);
        assert_eq!(source.backoff(1), Duration::from_millis(100));
        assert_eq!(source.backoff(2), Duration::from_millis(200));
        assert_eq!(source.backoff(3), Duration::from_millis(300));
        assert_eq!(source.backoff(9), Duration::from_millis(300));
    }
}
