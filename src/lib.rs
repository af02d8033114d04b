//! # pulse-telemetry
//!
//! A client-side telemetry pipeline for Rust applications: record counters,
//! gauges, and histograms from any thread, and let a small set of background
//! workers batch them and deliver them over HTTP to an ingest endpoint.
//!
//! ## Features
//!
//! - **Non-blocking producers**: instrument updates take a short per-instrument
//!   lock and never wait on the network
//! - **Client-side histogram aggregation**: observations accumulate into fixed
//!   buckets and are shipped once per flush interval, not once per observation
//! - **Bounded delivery concurrency**: at most one flush is in flight at a time,
//!   no matter how fast producers fill the buffer
//! - **Runtime sampling**: process-level gauges and counters (threads, memory,
//!   cumulative I/O) collected on a timer through the same path
//!
//! ## Quick Start
//!
//! ```no_run
//! use pulse_telemetry::{TelemetryClient, TelemetryClientOptions};
//!
//! let client = TelemetryClient::new(TelemetryClientOptions {
//!     service: "checkout".to_string(),
//!     endpoint: "http://localhost:8080/v1/ingest".to_string(),
//!     ..TelemetryClientOptions::default()
//! })
//! .unwrap();
//! client.start().unwrap();
//!
//! let requests = client.counter("http_requests_total");
//! requests.inc(&["method", "GET", "path", "/checkout"]);
//!
//! let latency = client.histogram("http_request_duration_seconds");
//! latency.observe(0.042, &["method", "GET"]);
//!
//! client.stop().unwrap();
//! ```
//!
//! Delivery is fire-and-forget: a failed flush is logged and discarded, and
//! telemetry trouble never surfaces as an application failure.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::float_cmp))]

mod error;
mod pipeline;

pub use error::TelemetryError;
pub use pipeline::batch::DROPPED_RECORDS_METRIC;
pub use pipeline::client::{TelemetryClient, TelemetryClientOptions, TransportKind};
pub use pipeline::instrument::{Counter, Gauge, Histogram, RecordSink, DEFAULT_BUCKETS};
pub use pipeline::record::{MetricKind, Record, BUCKET_BOUND_LABEL, SERVICE_LABEL};
pub use pipeline::transport::{HttpTransport, Transport};

/// Result type for telemetry operations.
///
/// Only construction, lifecycle, and explicit flushes return errors; all
/// runtime delivery failures are absorbed and logged.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
