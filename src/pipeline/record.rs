use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Reserved label carrying the name of the emitting service.
///
/// Stamped onto every outgoing record by the client; a producer-supplied
/// value under this key is overwritten.
pub const SERVICE_LABEL: &str = "service";

/// Reserved label on `_bucket` records holding the bucket's upper bound,
/// encoded as a decimal string or the literal `+Inf` for the terminal bucket.
pub const BUCKET_BOUND_LABEL: &str = "le";

/// The kind of measurement a [`Record`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// A cumulative, monotonically non-decreasing total.
    Counter,
    /// A current level; may go up or down.
    Gauge,
    /// One slice of a bucketed distribution (`_bucket`, `_sum`, or `_count`).
    Histogram,
}

/// One finished measurement, the unit of transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Metric name: letters, digits, underscore, colon. Histogram records
    /// carry a `_bucket`, `_sum`, or `_count` suffix.
    pub name: String,
    /// Measurement kind; serialized as `type` on the wire.
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// For counters the cumulative total at observation time, for gauges the
    /// current level, for histogram records the bucket count, sum, or count.
    pub value: f64,
    /// Label set identifying the series. Omitted from the wire when empty.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Wall-clock instant at which the producing event was observed.
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Creates a record stamped with the current wall-clock time.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: MetricKind,
        value: f64,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            labels,
            timestamp: Utc::now(),
        }
    }
}

/// Builds a label map from a flat `[k1, v1, k2, v2, …]` pair list.
///
/// An odd-length list cannot be paired up; the labels are dropped and the
/// measurement proceeds with an empty map.
pub(crate) fn labels_from_pairs(pairs: &[&str]) -> BTreeMap<String, String> {
    if pairs.len() % 2 != 0 {
        warn!(
            entries = pairs.len(),
            "Dropping odd-length label list, recording without labels"
        );
        return BTreeMap::new();
    }
    pairs
        .chunks_exact(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect()
}

/// Canonical, order-independent key for a label map.
///
/// Two maps with identical key/value pairs produce the same key regardless
/// of the order the producer supplied them in.
pub(crate) fn label_key(labels: &BTreeMap<String, String>) -> String {
    let mut key = String::new();
    for (name, value) in labels {
        if !key.is_empty() {
            key.push(',');
        }
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}
