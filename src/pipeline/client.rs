use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{tick, unbounded, Receiver, Sender};
use crossbeam::select;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::pipeline::batch::Batcher;
use crate::pipeline::instrument::{Counter, Gauge, Histogram, RecordSink};
use crate::pipeline::record::{Record, SERVICE_LABEL};
use crate::pipeline::runtime::sampler_loop;
use crate::pipeline::transport::{HttpTransport, Transport};
use crate::{TelemetryError, TelemetryResult};

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Selects the delivery mechanism for finished batches.
pub enum TransportKind {
    /// POST JSON batches to the configured endpoint.
    Http,
    /// User-provided transport implementation.
    Custom(Arc<dyn Transport>),
}

impl fmt::Debug for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "Http"),
            Self::Custom(_) => write!(f, "Custom(...)"),
        }
    }
}

/// Configuration options for the telemetry client.
#[derive(Debug)]
pub struct TelemetryClientOptions {
    /// Service name attached as the `service` label to every outgoing
    /// record. Required; an empty value is rejected at construction.
    pub service: String,
    /// Ingest endpoint receiving batches.
    pub endpoint: String,
    /// Optional credential forwarded as `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
    /// Periodic flush cadence; also the histogram aggregation period, which
    /// makes it the effective resolution of every histogram.
    pub flush_interval: Duration,
    /// Buffer length that triggers a size-based flush.
    pub max_batch_size: usize,
    /// Runtime sampler cadence.
    pub runtime_interval: Duration,
    /// Upper bound on buffered records. Above it new records are dropped and
    /// accounted in `telemetry_dropped_records_total`; `None` leaves the
    /// buffer unbounded.
    pub max_buffered: Option<usize>,
    /// Delivery mechanism for finished batches.
    pub transport: TransportKind,
}

impl Default for TelemetryClientOptions {
    fn default() -> Self {
        Self {
            service: String::new(),
            endpoint: "http://localhost:8080/v1/ingest".to_string(),
            api_key: None,
            flush_interval: Duration::from_secs(5),
            max_batch_size: 1000,
            runtime_interval: Duration::from_secs(15),
            max_buffered: None,
            transport: TransportKind::Http,
        }
    }
}

/// Stamps the service label and forwards records into the batcher.
///
/// This small struct, not the client itself, is what instruments hold as
/// their [`RecordSink`]; instrument handles therefore never keep the client
/// alive, and the producer/client cycle stays broken at the trait boundary.
struct ServiceSink {
    service: String,
    state: Arc<AtomicU8>,
    batcher: Arc<Batcher>,
}

impl RecordSink for ServiceSink {
    fn send(&self, mut record: Record) {
        if self.state.load(Ordering::Acquire) == STATE_STOPPED {
            debug!(metric = %record.name, "Client stopped, dropping record");
            return;
        }
        record
            .labels
            .insert(SERVICE_LABEL.to_string(), self.service.clone());
        self.batcher.add(record);
    }
}

struct Workers {
    shutdown: Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// The telemetry pipeline facade: instrument registries, batcher, runtime
/// sampler, and lifecycle in one place.
///
/// Instruments are looked up by name and shared: two lookups with the same
/// name return the same `Arc`. The client moves NEW → RUNNING → STOPPED and
/// never back; dropping it performs a best-effort [`TelemetryClient::stop`].
pub struct TelemetryClient {
    state: Arc<AtomicU8>,
    sink: Arc<dyn RecordSink>,
    batcher: Arc<Batcher>,
    flush_interval: Duration,
    runtime_interval: Duration,
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    gauges: RwLock<HashMap<String, Arc<Gauge>>>,
    histograms: Arc<RwLock<HashMap<String, Arc<Histogram>>>>,
    workers: Mutex<Option<Workers>>,
}

impl fmt::Debug for TelemetryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryClient")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("flush_interval", &self.flush_interval)
            .field("runtime_interval", &self.runtime_interval)
            .finish()
    }
}

impl TelemetryClient {
    /// Validates `options` and assembles the pipeline. No background work
    /// starts until [`TelemetryClient::start`], but size-triggered flushes
    /// already fire once records accumulate.
    ///
    /// # Errors
    /// [`TelemetryError::Config`] when `service` is empty, or a transport
    /// construction failure.
    pub fn new(options: TelemetryClientOptions) -> TelemetryResult<Self> {
        if options.service.is_empty() {
            return Err(TelemetryError::Config(
                "service name must not be empty".to_string(),
            ));
        }
        let transport: Arc<dyn Transport> = match options.transport {
            TransportKind::Http => Arc::new(HttpTransport::new(
                options.endpoint.clone(),
                options.api_key.clone(),
            )?),
            TransportKind::Custom(transport) => transport,
        };
        let batcher = Arc::new(Batcher::new(
            options.service.clone(),
            options.max_batch_size,
            options.max_buffered,
            transport,
        ));
        let state = Arc::new(AtomicU8::new(STATE_NEW));
        let sink: Arc<dyn RecordSink> = Arc::new(ServiceSink {
            service: options.service,
            state: Arc::clone(&state),
            batcher: Arc::clone(&batcher),
        });

        Ok(Self {
            state,
            sink,
            batcher,
            flush_interval: options.flush_interval,
            runtime_interval: options.runtime_interval,
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: Arc::new(RwLock::new(HashMap::new())),
            workers: Mutex::new(None),
        })
    }

    /// Returns the counter registered under `name`, creating it on first
    /// call.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        lookup(&self.counters, name, || {
            Counter::new(name, Arc::clone(&self.sink))
        })
    }

    /// Returns the gauge registered under `name`, creating it on first call.
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        lookup(&self.gauges, name, || {
            Gauge::new(name, Arc::clone(&self.sink))
        })
    }

    /// Returns the histogram registered under `name` with the default
    /// latency buckets, creating it on first call.
    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        lookup(&self.histograms, name, || {
            Histogram::new(name, Arc::clone(&self.sink))
        })
    }

    /// As [`TelemetryClient::histogram`], with caller-supplied bucket upper
    /// bounds (a terminal `+Inf` is appended when absent).
    ///
    /// Bounds are fixed at first registration; when the histogram already
    /// exists the existing instrument is returned and `bounds` is ignored.
    pub fn histogram_with_buckets(&self, name: &str, bounds: Vec<f64>) -> Arc<Histogram> {
        lookup(&self.histograms, name, || {
            Histogram::with_bounds(name, Arc::clone(&self.sink), bounds)
        })
    }

    /// Starts the background workers: the batcher's flush loop, the runtime
    /// sampler, and the histogram aggregation loop.
    ///
    /// # Errors
    /// [`TelemetryError::AlreadyStarted`] unless the client is in its
    /// initial state.
    pub fn start(&self) -> TelemetryResult<()> {
        if self
            .state
            .compare_exchange(STATE_NEW, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TelemetryError::AlreadyStarted);
        }

        self.batcher.start(self.flush_interval);

        let (shutdown, receiver) = unbounded::<()>();
        let sampler = {
            let sink = Arc::clone(&self.sink);
            let interval = self.runtime_interval;
            let shutdown = receiver.clone();
            spawn(move || sampler_loop(&sink, interval, &shutdown))
        };
        let aggregation = {
            let sink = Arc::clone(&self.sink);
            let histograms = Arc::clone(&self.histograms);
            let interval = self.flush_interval;
            spawn(move || aggregation_loop(&histograms, &sink, interval, &receiver))
        };
        *self.workers.lock() = Some(Workers {
            shutdown,
            handles: vec![sampler, aggregation],
        });
        Ok(())
    }

    /// Stops the pipeline: signals every worker, waits for them to exit,
    /// then drains the buffer with one final synchronous flush.
    ///
    /// Idempotent; stopping a never-started or already-stopped client is a
    /// no-op. Records sent after stop are silently dropped.
    ///
    /// # Errors
    /// None currently; delivery failures during the drain are logged, not
    /// surfaced.
    pub fn stop(&self) -> TelemetryResult<()> {
        let previous = self.state.swap(STATE_STOPPED, Ordering::AcqRel);
        if previous != STATE_RUNNING {
            return Ok(());
        }

        if let Some(Workers { shutdown, handles }) = self.workers.lock().take() {
            // Closing the channel wakes both loops.
            drop(shutdown);
            for handle in handles {
                if handle.join().is_err() {
                    error!("Telemetry worker terminated abnormally");
                }
            }
        }
        self.batcher.stop();
        Ok(())
    }

    /// Manually drains the buffer, forwarding the transport's error.
    ///
    /// # Errors
    /// Whatever the transport reports for the drained batch.
    pub fn flush(&self) -> TelemetryResult<()> {
        self.batcher.flush()
    }
}

impl Drop for TelemetryClient {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Get-or-create under the registry lock: read fast path, write on first
/// registration.
fn lookup<T>(
    registry: &RwLock<HashMap<String, Arc<T>>>,
    name: &str,
    create: impl FnOnce() -> T,
) -> Arc<T> {
    if let Some(instrument) = registry.read().get(name) {
        return Arc::clone(instrument);
    }
    let mut registry = registry.write();
    Arc::clone(
        registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(create())),
    )
}

/// Drains every histogram once per tick until the shutdown channel closes.
///
/// Exits without draining; the batcher's stop path is the final drain for
/// anything already emitted.
fn aggregation_loop(
    histograms: &RwLock<HashMap<String, Arc<Histogram>>>,
    sink: &Arc<dyn RecordSink>,
    interval: Duration,
    shutdown: &Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                // Snapshot under the read lock; flushing happens outside it
                // so producers are never blocked behind a slow drain.
                let snapshot: Vec<Arc<Histogram>> =
                    histograms.read().values().cloned().collect();
                for histogram in snapshot {
                    for record in histogram.flush() {
                        sink.send(record);
                    }
                }
            }
            recv(shutdown) -> _ => return,
        }
    }
}
