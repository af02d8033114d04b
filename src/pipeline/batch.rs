use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{tick, unbounded, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::pipeline::record::{MetricKind, Record, SERVICE_LABEL};
use crate::pipeline::transport::Transport;
use crate::TelemetryResult;

/// Deadline the batcher imposes around each flush's transport call.
const FLUSH_DEADLINE: Duration = Duration::from_secs(5);

/// Gauge accounting for records dropped at the buffer bound. Emitted with
/// the next delivered batch whenever the cumulative drop count is non-zero.
pub const DROPPED_RECORDS_METRIC: &str = "telemetry_dropped_records_total";

/// Shared state between producers, the size-triggered flushers, and the
/// periodic flush loop.
struct BatcherCore {
    buffer: Mutex<Vec<Record>>,
    // Manipulated by compare-and-swap only; admits at most one in-flight
    // flush at a time.
    flushing: AtomicBool,
    dropped: AtomicU64,
    // Cumulative drop count already shipped in an accounting gauge.
    reported_dropped: AtomicU64,
    max_batch_size: usize,
    max_buffered: Option<usize>,
    service: String,
    transport: Arc<dyn Transport>,
}

impl BatcherCore {
    /// Appends a record unless the buffer bound is reached; returns whether
    /// the append crossed the size threshold.
    fn append(&self, record: Record) -> bool {
        let mut buffer = self.buffer.lock();
        if let Some(bound) = self.max_buffered {
            if buffer.len() >= bound {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(metric = %record.name, "Buffer bound reached, dropping record");
                return false;
            }
        }
        buffer.push(record);
        buffer.len() >= self.max_batch_size
    }

    fn try_begin_flush(&self) -> bool {
        self.flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end_flush(&self) {
        self.flushing.store(false, Ordering::Release);
    }

    /// Swaps the buffer out under the lock and hands the captured batch to
    /// the transport. Forwards the transport's error verbatim; the batch is
    /// gone either way.
    fn flush(&self) -> TelemetryResult<()> {
        let mut batch = {
            let mut buffer = self.buffer.lock();
            std::mem::replace(&mut *buffer, Vec::with_capacity(self.max_batch_size))
        };

        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > self.reported_dropped.swap(dropped, Ordering::Relaxed) {
            batch.push(self.dropped_record(dropped));
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.transport.send(&batch, FLUSH_DEADLINE)
    }

    #[allow(clippy::cast_precision_loss)]
    fn dropped_record(&self, total: u64) -> Record {
        let mut labels = BTreeMap::new();
        labels.insert(SERVICE_LABEL.to_string(), self.service.clone());
        Record::new(DROPPED_RECORDS_METRIC, MetricKind::Gauge, total as f64, labels)
    }
}

struct FlushWorker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Coalesces records into batches and bounds delivery concurrency.
///
/// Flushes happen on three triggers: the buffer reaching `max_batch_size`,
/// each tick of the periodic flush loop, and the final synchronous drain in
/// [`Batcher::stop`]. A slow transport never blocks producers; the buffer
/// simply grows until the next guarded flush attempt.
pub(crate) struct Batcher {
    core: Arc<BatcherCore>,
    worker: Mutex<Option<FlushWorker>>,
}

impl Batcher {
    pub(crate) fn new(
        service: String,
        max_batch_size: usize,
        max_buffered: Option<usize>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            core: Arc::new(BatcherCore {
                buffer: Mutex::new(Vec::with_capacity(max_batch_size)),
                flushing: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                reported_dropped: AtomicU64::new(0),
                max_batch_size,
                max_buffered,
                service,
                transport,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Appends a record, kicking off a background flush when the size
    /// threshold is crossed and no flush is already in flight.
    pub(crate) fn add(&self, record: Record) {
        // Without the guard, a sustained producer burst would spawn one
        // flusher per append past the threshold.
        if self.core.append(record) && self.core.try_begin_flush() {
            let core = Arc::clone(&self.core);
            spawn(move || {
                if let Err(err) = core.flush() {
                    error!("Error delivering batch: {err}");
                }
                core.end_flush();
            });
        }
    }

    /// Synchronous flush of whatever is currently buffered.
    pub(crate) fn flush(&self) -> TelemetryResult<()> {
        self.core.flush()
    }

    /// Spawns the periodic flush loop. Idempotent while running.
    pub(crate) fn start(&self, interval: Duration) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let (shutdown, receiver) = unbounded::<()>();
        let core = Arc::clone(&self.core);
        let handle = spawn(move || flush_loop(&core, interval, &receiver));
        *worker = Some(FlushWorker { shutdown, handle });
    }

    /// Stops the flush loop, waits for it, then drains the buffer with one
    /// final synchronous flush. Delivery errors during the drain are logged,
    /// not surfaced.
    pub(crate) fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(FlushWorker { shutdown, handle }) = worker {
            // Closing the channel is the stop signal.
            drop(shutdown);
            if handle.join().is_err() {
                error!("Flush loop terminated abnormally");
            }
        }
        if let Err(err) = self.core.flush() {
            error!("Error draining batch on stop: {err}");
        }
    }
}

fn flush_loop(core: &BatcherCore, interval: Duration, shutdown: &Receiver<()>) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                if core.try_begin_flush() {
                    if let Err(err) = core.flush() {
                        error!("Error delivering batch: {err}");
                    }
                    core.end_flush();
                }
            }
            recv(shutdown) -> _ => return,
        }
    }
}
