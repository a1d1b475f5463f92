//! HTTP target: POSTs each batch as a JSON document.

use chrono::Utc;
use tracing::debug;

use super::{BatchDocument, BatchMetadata, CountRecord, CountStore};
use crate::config::{ApiConfig, OutputFormat};
use crate::error::{PipelineError, Result};

/// Sends batches to a remote endpoint with an optional bearer token.
///
/// The body has the same layout as a JSON batch file. Any non-2xx status or
/// transport error fails the batch so the scheduler keeps it for the next
/// interval.
pub struct ApiStore {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
    interval_seconds: f64,
}

impl ApiStore {
    pub fn from_config(config: &ApiConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self {
            agent,
            endpoint: config.endpoint.clone(),
            api_key: Some(config.api_key.clone()).filter(|key| !key.is_empty()),
            interval_seconds: config.send_interval.as_secs_f64(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl CountStore for ApiStore {
    /// The payload is always JSON; `format` only applies to files.
    fn write(&self, records: &[CountRecord], _format: OutputFormat) -> Result<()> {
        let document = BatchDocument {
            metadata: BatchMetadata {
                saved_at: Utc::now(),
                record_count: records.len(),
                interval_seconds: self.interval_seconds,
            },
            records: records.to_vec(),
        };
        let body = serde_json::to_string(&document)?;

        let mut request = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        match request.send_string(&body) {
            Ok(response) => {
                debug!(
                    endpoint = %self.endpoint,
                    status = response.status(),
                    records = records.len(),
                    "batch sent to api"
                );
                Ok(())
            }
            Err(ureq::Error::Status(code, response)) => {
                let text = response.into_string().unwrap_or_default();
                Err(PipelineError::persistence(format!(
                    "api {} returned {code}: {text}",
                    self.endpoint
                )))
            }
            Err(err) => Err(PipelineError::persistence(format!(
                "api {} unreachable: {err}",
                self.endpoint
            ))),
        }
    }
}
