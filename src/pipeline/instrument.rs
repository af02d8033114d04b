use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::pipeline::record::{label_key, labels_from_pairs, MetricKind, Record, BUCKET_BOUND_LABEL};

/// Destination for finished records.
///
/// Instruments hold their sink as a trait object rather than a reference to
/// the client that created them. That breaks the producer/client ownership
/// cycle at the boundary and lets instruments be exercised against a fake
/// sink in tests.
pub trait RecordSink: Send + Sync {
    /// Accepts one finished record for delivery.
    fn send(&self, record: Record);
}

/// Default histogram bucket upper bounds, covering typical HTTP latency
/// from 1 ms to 10 s. The terminal bound serializes as `+Inf`.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.001,
    0.005,
    0.01,
    0.025,
    0.05,
    0.1,
    0.25,
    0.5,
    1.0,
    2.5,
    5.0,
    10.0,
    f64::INFINITY,
];

/// Per-label-set slot shared by counter and gauge.
struct Series {
    labels: BTreeMap<String, String>,
    value: f64,
}

/// A monotonically non-decreasing cumulative total.
///
/// Every mutation emits one record carrying the new total for the label set.
/// Per-label-set slots are created lazily on the first mutation and live as
/// long as the instrument; unbounded label values (user ids, request ids)
/// therefore grow the internal map without bound. Keep label values bounded.
pub struct Counter {
    name: String,
    sink: Arc<dyn RecordSink>,
    series: Mutex<HashMap<String, Series>>,
}

impl Counter {
    pub(crate) fn new(name: impl Into<String>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            name: name.into(),
            sink,
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Increments the counter by one.
    pub fn inc(&self, labels: &[&str]) {
        self.add(1.0, labels);
    }

    /// Increments the counter by `value`.
    ///
    /// A negative `value` would break monotonicity and is silently ignored.
    pub fn add(&self, value: f64, labels: &[&str]) {
        if value < 0.0 {
            debug!(metric = %self.name, value, "Ignoring negative counter increment");
            return;
        }
        let labels = labels_from_pairs(labels);
        let key = label_key(&labels);

        let mut series = self.series.lock();
        let slot = series
            .entry(key)
            .or_insert_with(|| Series { labels, value: 0.0 });
        slot.value += value;
        // Capture and enqueue while still holding the series lock: both the
        // total and the emission order must match the mutation order.
        self.sink.send(Record::new(
            self.name.clone(),
            MetricKind::Counter,
            slot.value,
            slot.labels.clone(),
        ));
    }
}

/// A current level; may go up or down.
///
/// Every mutation emits one record carrying the new level for the label set.
/// The same label-cardinality caveat as [`Counter`] applies.
pub struct Gauge {
    name: String,
    sink: Arc<dyn RecordSink>,
    series: Mutex<HashMap<String, Series>>,
}

impl Gauge {
    pub(crate) fn new(name: impl Into<String>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            name: name.into(),
            sink,
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the gauge to `value`.
    pub fn set(&self, value: f64, labels: &[&str]) {
        self.update(labels, |_| value);
    }

    /// Adds `value` to the current level.
    pub fn add(&self, value: f64, labels: &[&str]) {
        self.update(labels, |current| current + value);
    }

    /// Subtracts `value` from the current level.
    pub fn sub(&self, value: f64, labels: &[&str]) {
        self.update(labels, |current| current - value);
    }

    /// Increments the gauge by one.
    pub fn inc(&self, labels: &[&str]) {
        self.update(labels, |current| current + 1.0);
    }

    /// Decrements the gauge by one.
    pub fn dec(&self, labels: &[&str]) {
        self.update(labels, |current| current - 1.0);
    }

    fn update(&self, labels: &[&str], apply: impl FnOnce(f64) -> f64) {
        let labels = labels_from_pairs(labels);
        let key = label_key(&labels);

        let mut series = self.series.lock();
        let slot = series
            .entry(key)
            .or_insert_with(|| Series { labels, value: 0.0 });
        slot.value = apply(slot.value);
        self.sink.send(Record::new(
            self.name.clone(),
            MetricKind::Gauge,
            slot.value,
            slot.labels.clone(),
        ));
    }
}

/// Per-label-set histogram state: cumulative bucket counts plus running
/// sum and count. Bucket bounds live on the instrument and never change.
struct BucketSet {
    labels: BTreeMap<String, String>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl BucketSet {
    fn new(labels: BTreeMap<String, String>, buckets: usize) -> Self {
        Self {
            labels,
            counts: vec![0; buckets],
            sum: 0.0,
            count: 0,
        }
    }

    fn record(&mut self, bounds: &[f64], value: f64) {
        for (slot, bound) in self.counts.iter_mut().zip(bounds) {
            if value <= *bound {
                *slot += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }

    fn reset(&mut self) {
        self.counts.fill(0);
        self.sum = 0.0;
        self.count = 0;
    }
}

/// A bucketed distribution of observed values.
///
/// Unlike [`Counter`] and [`Gauge`], observing emits nothing: observations
/// accumulate locally until the aggregation loop drains them, once per flush
/// interval, into a bundle of `_bucket`/`_sum`/`_count` records. The flush
/// period is the distribution's effective resolution.
pub struct Histogram {
    name: String,
    sink: Arc<dyn RecordSink>,
    bounds: Arc<[f64]>,
    sets: Mutex<HashMap<String, BucketSet>>,
}

impl Histogram {
    pub(crate) fn new(name: impl Into<String>, sink: Arc<dyn RecordSink>) -> Self {
        Self::with_bounds(name, sink, DEFAULT_BUCKETS.to_vec())
    }

    /// Creates a histogram with caller-supplied bucket upper bounds.
    ///
    /// Bounds are sorted; a terminal `+Inf` bucket is appended when absent.
    pub(crate) fn with_bounds(
        name: impl Into<String>,
        sink: Arc<dyn RecordSink>,
        mut bounds: Vec<f64>,
    ) -> Self {
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        if bounds.last().map_or(true, |bound| bound.is_finite()) {
            bounds.push(f64::INFINITY);
        }
        Self {
            name: name.into(),
            sink,
            bounds: bounds.into(),
            sets: Mutex::new(HashMap::new()),
        }
    }

    /// Records one observation into the bucket-set for the label set.
    ///
    /// Nothing is emitted here; see [`Histogram`] for the aggregation model.
    pub fn observe(&self, value: f64, labels: &[&str]) {
        let labels = labels_from_pairs(labels);
        let key = label_key(&labels);

        let mut sets = self.sets.lock();
        let set = sets
            .entry(key)
            .or_insert_with(|| BucketSet::new(labels, self.bounds.len()));
        set.record(&self.bounds, value);
    }

    /// Drains every non-empty bucket-set into records and resets it to zero.
    ///
    /// Produces one `<name>_bucket` record per bound (label `le` carrying the
    /// bound, `+Inf` for the terminal bucket), plus `<name>_sum` and
    /// `<name>_count`. Empty bucket-sets are skipped.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn flush(&self) -> Vec<Record> {
        let mut records = Vec::new();
        let mut sets = self.sets.lock();
        for set in sets.values_mut() {
            if set.count == 0 {
                continue;
            }
            for (bound, count) in self.bounds.iter().zip(&set.counts) {
                let mut labels = set.labels.clone();
                labels.insert(BUCKET_BOUND_LABEL.to_string(), format_bound(*bound));
                records.push(Record::new(
                    format!("{}_bucket", self.name),
                    MetricKind::Histogram,
                    *count as f64,
                    labels,
                ));
            }
            records.push(Record::new(
                format!("{}_sum", self.name),
                MetricKind::Histogram,
                set.sum,
                set.labels.clone(),
            ));
            records.push(Record::new(
                format!("{}_count", self.name),
                MetricKind::Histogram,
                set.count as f64,
                set.labels.clone(),
            ));
            set.reset();
        }
        records
    }
}

fn format_bound(bound: f64) -> String {
    if bound.is_infinite() {
        "+Inf".to_string()
    } else {
        bound.to_string()
    }
}
