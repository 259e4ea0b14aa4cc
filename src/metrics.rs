use crate::snapshot::Snapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Self-instrumentation of the agent, exposed in Prometheus text format.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub agent_snapshots_total: Counter,
    pub agent_collect_errors_total: CounterVec,
    pub agent_snapshot_duration_seconds: Gauge,
    pub agent_last_snapshot_timestamp_seconds: Gauge,
    pub agent_network_interfaces: Gauge,
    pub agent_gpu_available: Gauge,
    pub agent_uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let agent_snapshots_total = Counter::with_opts(opts!(
            "agent_snapshots_total",
            "Number of snapshots served on /metrics"
        ))?;
        let agent_collect_errors_total = CounterVec::new(
            opts!(
                "agent_collect_errors_total",
                "Snapshot sections that could not be collected, by collector"
            ),
            &["collector"],
        )?;
        let agent_snapshot_duration_seconds = Gauge::with_opts(opts!(
            "agent_snapshot_duration_seconds",
            "Wall time of the last snapshot assembly in seconds"
        ))?;
        let agent_last_snapshot_timestamp_seconds = Gauge::with_opts(opts!(
            "agent_last_snapshot_timestamp_seconds",
            "Timestamp of the last assembled snapshot"
        ))?;
        let agent_network_interfaces = Gauge::with_opts(opts!(
            "agent_network_interfaces",
            "Interfaces reported in the last snapshot"
        ))?;
        let agent_gpu_available = Gauge::with_opts(opts!(
            "agent_gpu_available",
            "1 if the last snapshot reported GPUs, 0 otherwise"
        ))?;
        let agent_uptime_seconds = Gauge::with_opts(opts!(
            "agent_uptime_seconds",
            "Agent process uptime in seconds"
        ))?;

        register(&registry, &agent_snapshots_total)?;
        register(&registry, &agent_collect_errors_total)?;
        register(&registry, &agent_snapshot_duration_seconds)?;
        register(&registry, &agent_last_snapshot_timestamp_seconds)?;
        register(&registry, &agent_network_interfaces)?;
        register(&registry, &agent_gpu_available)?;
        register(&registry, &agent_uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            agent_snapshots_total,
            agent_collect_errors_total,
            agent_snapshot_duration_seconds,
            agent_last_snapshot_timestamp_seconds,
            agent_network_interfaces,
            agent_gpu_available,
            agent_uptime_seconds,
        }))
    }

    pub fn observe_snapshot(&self, snapshot: &Snapshot, elapsed: Duration) {
        self.agent_snapshots_total.inc();
        self.agent_snapshot_duration_seconds
            .set(elapsed.as_secs_f64());
        self.agent_last_snapshot_timestamp_seconds
            .set(snapshot.timestamp);

        let failed = [
            ("system", snapshot.system.is_failed()),
            ("cpu", snapshot.cpu.is_failed()),
            ("memory", snapshot.memory.is_failed()),
            ("disk", snapshot.disk.is_failed()),
            ("network", snapshot.network.is_failed()),
        ];
        for (collector, is_failed) in failed {
            if is_failed {
                self.inc_collect_error(collector);
            }
        }

        self.agent_network_interfaces.set(
            snapshot
                .network
                .as_ok()
                .map(|n| n.len() as f64)
                .unwrap_or(0.0),
        );
        self.agent_gpu_available
            .set(if snapshot.gpu.is_available() { 1.0 } else { 0.0 });
    }

    pub fn inc_collect_error(&self, collector: &str) {
        self.agent_collect_errors_total
            .with_label_values(&[collector])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.agent_uptime_seconds.set(uptime);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
