use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::pipeline::record::Record;
use crate::{TelemetryError, TelemetryResult};

/// Hard cap on any single delivery attempt, independent of the deadline the
/// caller passes in; the effective deadline is the minimum of the two.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers finished batches to the ingest sink.
///
/// Implementations must be safe to call from concurrent flushes. A failed
/// delivery is surfaced to the caller and the batch is gone; retry policy
/// lives one layer up, and in this crate is "none".
pub trait Transport: Send + Sync {
    /// Delivers `batch` within `deadline`.
    ///
    /// An empty batch must succeed without touching the network.
    ///
    /// # Errors
    /// Any IO, timeout, or sink-side failure for the batch as a whole.
    fn send(&self, batch: &[Record], deadline: Duration) -> TelemetryResult<()>;
}

#[derive(Serialize)]
struct IngestPayload<'a> {
    metrics: &'a [Record],
}

/// HTTP transport POSTing JSON-encoded batches to the ingest endpoint.
///
/// The underlying client keeps a reusable connection pool and is safe for
/// concurrent calls; each flush posts independently.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    /// Creates a transport targeting `endpoint`.
    ///
    /// When `api_key` is set it is forwarded as a bearer credential on every
    /// request.
    ///
    /// # Errors
    /// Returns an error when the underlying HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> TelemetryResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, batch: &[Record], deadline: Duration) -> TelemetryResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(deadline.min(SEND_TIMEOUT))
            .json(&IngestPayload { metrics: batch });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::Status(status.as_u16()));
        }
        debug!(records = batch.len(), "Delivered batch");
        Ok(())
    }
}
