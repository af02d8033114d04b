use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pulse_telemetry::{
    MetricKind, Record, TelemetryClient, TelemetryClientOptions, TelemetryError, TelemetryResult,
    Transport, TransportKind, BUCKET_BOUND_LABEL, SERVICE_LABEL,
};

/// Transport double that keeps every delivered batch, optionally simulating
/// a slow network.
#[derive(Default)]
struct RecordingTransport {
    batches: Mutex<Vec<Vec<Record>>>,
    delay: Option<Duration>,
}

impl RecordingTransport {
    fn slow(delay: Duration) -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    fn batches(&self) -> Vec<Vec<Record>> {
        self.batches.lock().unwrap().clone()
    }

    fn records(&self) -> Vec<Record> {
        self.batches().into_iter().flatten().collect()
    }

    fn records_named(&self, name: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|record| record.name == name)
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, batch: &[Record], _deadline: Duration) -> TelemetryResult<()> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

fn client_with(
    transport: RecordingTransport,
    configure: impl FnOnce(&mut TelemetryClientOptions),
) -> (TelemetryClient, Arc<RecordingTransport>) {
    let transport = Arc::new(transport);
    let mut options = TelemetryClientOptions {
        service: "svc".to_string(),
        transport: TransportKind::Custom(Arc::clone(&transport) as Arc<dyn Transport>),
        // Keep timers out of the way unless a test opts in.
        flush_interval: Duration::from_secs(3600),
        runtime_interval: Duration::from_secs(3600),
        ..TelemetryClientOptions::default()
    };
    configure(&mut options);
    let client = TelemetryClient::new(options).unwrap();
    (client, transport)
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < timeout, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn size_trigger_delivers_one_batch_of_cumulative_counts() {
    let (client, transport) = client_with(RecordingTransport::default(), |options| {
        options.max_batch_size = 5;
    });

    let counter = client.counter("c");
    for _ in 0..5 {
        counter.inc(&[]);
    }

    wait_until(Duration::from_secs(2), || !transport.batches().is_empty());
    let batches = transport.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 5);
    for (i, record) in batches[0].iter().enumerate() {
        assert_eq!(record.name, "c");
        assert_eq!(record.kind, MetricKind::Counter);
        assert_eq!(record.value, (i + 1) as f64);
        assert_eq!(
            record.labels.get(SERVICE_LABEL).map(String::as_str),
            Some("svc")
        );
    }
}

#[test]
fn periodic_flush_delivers_a_gauge_write() {
    let (client, transport) = client_with(RecordingTransport::default(), |options| {
        options.flush_interval = Duration::from_millis(100);
    });
    client.start().unwrap();

    client.gauge("g").set(42.0, &["k", "v"]);

    wait_until(Duration::from_secs(2), || {
        !transport.records_named("g").is_empty()
    });
    let record = transport.records_named("g").remove(0);
    assert_eq!(record.kind, MetricKind::Gauge);
    assert_eq!(record.value, 42.0);
    assert_eq!(record.labels.get("k").map(String::as_str), Some("v"));
    assert_eq!(
        record.labels.get(SERVICE_LABEL).map(String::as_str),
        Some("svc")
    );

    client.stop().unwrap();
}

#[test]
fn aggregation_loop_ships_histogram_bundles() {
    let (client, transport) = client_with(RecordingTransport::default(), |options| {
        options.flush_interval = Duration::from_millis(100);
    });
    client.start().unwrap();

    client.histogram("h").observe(0.003, &[]);

    wait_until(Duration::from_secs(2), || {
        !transport.records_named("h_count").is_empty()
    });
    client.stop().unwrap();

    let bucket_value = |le: &str| {
        transport
            .records_named("h_bucket")
            .into_iter()
            .find(|record| record.labels.get(BUCKET_BOUND_LABEL).map(String::as_str) == Some(le))
            .map(|record| record.value)
    };
    assert_eq!(bucket_value("0.001"), Some(0.0));
    assert_eq!(bucket_value("0.005"), Some(1.0));
    assert_eq!(bucket_value("+Inf"), Some(1.0));

    let sum = transport.records_named("h_sum").remove(0);
    assert!((sum.value - 0.003).abs() < 1e-9);
    assert_eq!(sum.kind, MetricKind::Histogram);
    let count = transport.records_named("h_count").remove(0);
    assert_eq!(count.value, 1.0);

    // Every histogram record carries the service label too.
    assert!(transport
        .records_named("h_bucket")
        .iter()
        .all(|record| record.labels.contains_key(SERVICE_LABEL)));
}

#[test]
fn slow_transport_loses_nothing_and_leaves_the_guard_clear() {
    let (client, transport) = client_with(
        RecordingTransport::slow(Duration::from_millis(50)),
        |options| {
            options.max_batch_size = 10;
            options.flush_interval = Duration::from_millis(50);
        },
    );
    client.start().unwrap();

    let counter = client.counter("c");
    let producers: Vec<_> = (0..10)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..100 {
                    counter.inc(&[]);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    // Every increment is delivered exactly once: the cumulative values are
    // the full set 1..=1000 with no duplicates.
    wait_until(Duration::from_secs(15), || {
        transport.records_named("c").len() == 1000
    });
    let mut values: Vec<u64> = transport
        .records_named("c")
        .iter()
        .map(|record| record.value as u64)
        .collect();
    values.sort_unstable();
    assert_eq!(values, (1..=1000).collect::<Vec<u64>>());

    // The guard is not stuck: one more full batch still flows through.
    for _ in 0..10 {
        counter.inc(&[]);
    }
    wait_until(Duration::from_secs(5), || {
        transport.records_named("c").len() == 1010
    });

    client.stop().unwrap();
}

#[test]
fn stop_drains_buffered_records() {
    let (client, transport) = client_with(RecordingTransport::default(), |options| {
        options.max_batch_size = 1000;
    });
    client.start().unwrap();

    let counter = client.counter("c");
    for _ in 0..4 {
        counter.inc(&[]);
    }
    client.stop().unwrap();

    let delivered = transport.records_named("c");
    assert_eq!(delivered.len(), 4);
    assert_eq!(delivered.last().unwrap().value, 4.0);

    // Second stop is a no-op returning success.
    client.stop().unwrap();
    assert_eq!(transport.records_named("c").len(), 4);
}

#[test]
fn sends_after_stop_are_silently_dropped() {
    let (client, transport) = client_with(RecordingTransport::default(), |_| {});
    client.start().unwrap();
    client.stop().unwrap();

    client.counter("c").inc(&[]);
    client.flush().unwrap();

    assert!(transport.records_named("c").is_empty());
}

#[test]
fn dropping_the_client_shuts_down_and_drains() {
    let transport = Arc::new(RecordingTransport::default());
    let start = Instant::now();
    {
        let client = TelemetryClient::new(TelemetryClientOptions {
            service: "svc".to_string(),
            transport: TransportKind::Custom(Arc::clone(&transport) as Arc<dyn Transport>),
            flush_interval: Duration::from_millis(100),
            runtime_interval: Duration::from_millis(100),
            ..TelemetryClientOptions::default()
        })
        .unwrap();
        client.start().unwrap();

        let counter = client.counter("c");
        for _ in 0..3 {
            counter.inc(&[]);
        }
        // No explicit stop: going out of scope is the shutdown path.
    }

    // Drop only returns once every worker has been joined; an unbounded
    // wait here would mean a leaked background thread.
    assert!(start.elapsed() < Duration::from_secs(3));

    // The final drain ran as part of drop, so the buffered records have
    // already reached the transport.
    wait_until(Duration::from_secs(2), || {
        transport.records_named("c").len() == 3
    });
    assert_eq!(transport.records_named("c").last().unwrap().value, 3.0);
}

#[test]
fn stop_returns_within_bounded_time() {
    let (client, _transport) = client_with(RecordingTransport::default(), |options| {
        options.flush_interval = Duration::from_millis(100);
        options.runtime_interval = Duration::from_millis(100);
    });
    client.start().unwrap();
    thread::sleep(Duration::from_millis(250));

    let start = Instant::now();
    client.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn runtime_sampler_feeds_the_shared_pipeline() {
    let (client, transport) = client_with(RecordingTransport::default(), |options| {
        // Long sampler interval: only the immediate initial collection runs.
        options.flush_interval = Duration::from_millis(100);
    });
    client.start().unwrap();

    wait_until(Duration::from_secs(2), || {
        !transport.records_named("process_memory_bytes").is_empty()
    });
    client.stop().unwrap();

    let memory = transport.records_named("process_memory_bytes").remove(0);
    assert_eq!(memory.kind, MetricKind::Gauge);
    assert!(memory.value > 0.0);
    // Sampler records flow through the facade, so they get stamped too.
    assert_eq!(
        memory.labels.get(SERVICE_LABEL).map(String::as_str),
        Some("svc")
    );
}

#[test]
fn empty_service_name_is_rejected_at_construction() {
    let err = TelemetryClient::new(TelemetryClientOptions {
        transport: TransportKind::Custom(Arc::new(RecordingTransport::default())),
        ..TelemetryClientOptions::default()
    })
    .unwrap_err();
    assert!(matches!(err, TelemetryError::Config(_)));
}

#[test]
fn instruments_are_shared_by_name() {
    let (client, _transport) = client_with(RecordingTransport::default(), |_| {});
    assert!(Arc::ptr_eq(&client.counter("c"), &client.counter("c")));
    assert!(Arc::ptr_eq(&client.histogram("h"), &client.histogram("h")));
}
