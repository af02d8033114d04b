use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{tick, Receiver};
use crossbeam::select;
use sysinfo::{Pid, System};
use tracing::warn;

use crate::pipeline::instrument::RecordSink;
use crate::pipeline::record::{MetricKind, Record};

/// Samples process-level runtime data and feeds it through the same path as
/// user metrics.
///
/// The gauge set covers live parallelism and memory; the counters are the
/// process's cumulative resource totals (uptime, disk I/O).
struct RuntimeSampler {
    system: System,
    pid: Pid,
}

impl RuntimeSampler {
    fn new() -> Option<Self> {
        match sysinfo::get_current_pid() {
            Ok(pid) => {
                let mut system = System::new();
                // The CPU list is static; one refresh at construction is enough.
                system.refresh_cpu();
                Some(Self { system, pid })
            }
            Err(err) => {
                warn!("Runtime sampling unavailable on this platform: {err}");
                None
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn collect(&mut self) -> Vec<Record> {
        if !self.system.refresh_process(self.pid) {
            warn!(pid = %self.pid, "Could not refresh own process, skipping sample");
            return Vec::new();
        }
        let Some(process) = self.system.process(self.pid) else {
            return Vec::new();
        };

        let mut records = Vec::with_capacity(7);
        let mut sample = |name: &str, kind: MetricKind, value: f64| {
            records.push(Record::new(name, kind, value, BTreeMap::new()));
        };

        if let Some(threads) = num_threads::num_threads() {
            sample("process_threads", MetricKind::Gauge, threads.get() as f64);
        } else {
            warn!("Thread count unavailable on this platform, skipping sample");
        }
        sample(
            "process_cpu_count",
            MetricKind::Gauge,
            self.system.cpus().len() as f64,
        );
        sample(
            "process_memory_bytes",
            MetricKind::Gauge,
            process.memory() as f64,
        );
        sample(
            "process_virtual_memory_bytes",
            MetricKind::Gauge,
            process.virtual_memory() as f64,
        );
        sample(
            "process_uptime_seconds",
            MetricKind::Counter,
            process.run_time() as f64,
        );
        let disk = process.disk_usage();
        sample(
            "process_disk_read_bytes_total",
            MetricKind::Counter,
            disk.total_read_bytes as f64,
        );
        sample(
            "process_disk_written_bytes_total",
            MetricKind::Counter,
            disk.total_written_bytes as f64,
        );
        records
    }
}

/// Sampler worker: one collection immediately on start, then one per tick,
/// until the shutdown channel closes.
pub(crate) fn sampler_loop(
    sink: &Arc<dyn RecordSink>,
    interval: Duration,
    shutdown: &Receiver<()>,
) {
    let Some(mut sampler) = RuntimeSampler::new() else {
        return;
    };
    emit(&mut sampler, sink.as_ref());

    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => emit(&mut sampler, sink.as_ref()),
            recv(shutdown) -> _ => return,
        }
    }
}

fn emit(sampler: &mut RuntimeSampler, sink: &dyn RecordSink) {
    for record in sampler.collect() {
        sink.send(record);
    }
}
