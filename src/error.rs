//! Error taxonomy for the counting pipeline.

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by the pipeline and its components.
///
/// Only the terminal variants (see [`PipelineError::is_terminal`]) stop the
/// frame loop. The recoverable ones are absorbed by the component that raised
/// them and reported through logs and UI notices.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The frame source reached the end of its stream.
    #[error("frame source exhausted")]
    SourceExhausted,

    /// The frame source stayed unavailable after every reconnect attempt.
    #[error("frame source unavailable after {attempts} attempts: {reason}")]
    SourceUnavailable {
        /// Reconnect attempts made before giving up.
        attempts: u32,
        /// Last failure reported by the source.
        reason: String,
    },

    /// No inference engine could serve detections.
    #[error("detector unavailable: {0}")]
    DetectorUnavailable(String),

    /// Count records could not be written to storage.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The configuration was rejected at start-up.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    /// Creates an invalid configuration error.
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigurationInvalid(reason.into())
    }

    /// Creates a persistence failure.
    #[must_use]
    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::PersistenceFailure(reason.into())
    }

    /// Creates a detector unavailable error.
    #[must_use]
    pub fn detector_unavailable(reason: impl Into<String>) -> Self {
        Self::DetectorUnavailable(reason.into())
    }

    /// Whether this error ends the frame loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SourceExhausted | Self::SourceUnavailable { .. } | Self::ConfigurationInvalid(_)
        )
    }
}
