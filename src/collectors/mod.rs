pub mod gpu;
pub mod network;
pub mod system;

use crate::config::Config;
use crate::snapshot::{GpuReport, Reading, Snapshot};
use gpu::{GpuCapability, GpuCollector};
use network::{default_counter_source, CounterSource, RateWindowSampler};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use system::{HostSource, StaticCollector, SysinfoHost};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("mount point {0} not found")]
    MountNotFound(String),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("{0} collector panicked")]
    Panicked(&'static str),
}

/// Wall clock, seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Blocks the current sampling pass for a fixed duration.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Builds one [`Snapshot`] per call from live host state.
///
/// Holds no measurement state between calls: every `assemble` takes its own
/// counter readings, so concurrent callers never share a rate window.
pub struct SnapshotAssembler {
    statics: StaticCollector,
    network: RateWindowSampler,
    gpu: GpuCollector,
    clock: Arc<dyn Clock>,
}

impl SnapshotAssembler {
    pub fn new(
        statics: StaticCollector,
        network: RateWindowSampler,
        gpu: GpuCollector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            statics,
            network,
            gpu,
            clock,
        }
    }

    pub fn from_config(cfg: &Config, gpu: GpuCapability) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);
        let host: Arc<dyn HostSource> = Arc::new(SysinfoHost::new());
        let counters: Arc<dyn CounterSource> = default_counter_source();

        Self::new(
            StaticCollector::new(
                host,
                clock.clone(),
                sleeper.clone(),
                cfg.cpu_window,
                cfg.root_mount.clone(),
            ),
            RateWindowSampler::new(counters, sleeper, cfg.network_window),
            GpuCollector::new(gpu),
            clock,
        )
    }

    pub fn gpu_capability(&self) -> &GpuCapability {
        self.gpu.capability()
    }

    /// Runs every collector concurrently and merges the results.
    ///
    /// Never fails: a collector that errors or panics only degrades its own
    /// section of the snapshot.
    pub fn assemble(&self) -> Snapshot {
        let (statics, network, gpu) = thread::scope(|scope| {
            let statics = scope.spawn(|| self.statics.collect());
            let network = scope.spawn(|| Reading::from(self.network.sample_rates()));
            let gpu = scope.spawn(|| self.gpu.collect());
            (statics.join(), network.join(), gpu.join())
        });

        let statics = statics.unwrap_or_else(|_| {
            warn!(collector = "static", "collector panicked");
            system::StaticFacts::failed(CollectError::Panicked("static"))
        });
        let network = network.unwrap_or_else(|_| {
            warn!(collector = "network", "collector panicked");
            Reading::failed(CollectError::Panicked("network"))
        });
        let gpu = gpu.unwrap_or_else(|_| {
            warn!(collector = "gpu", "collector panicked");
            GpuReport::unavailable(CollectError::Panicked("gpu"))
        });

        if let Reading::Failed { error } = &network {
            warn!(collector = "network", error = %error, "rate sampling failed");
        }

        let snapshot = Snapshot {
            timestamp: self.clock.now(),
            system: statics.system,
            cpu: statics.cpu,
            memory: statics.memory,
            disk: statics.disk,
            network,
            gpu,
        };
        debug!(
            timestamp = snapshot.timestamp,
            interfaces = snapshot.network.as_ok().map(|n| n.len()).unwrap_or(0),
            gpu_available = snapshot.gpu.is_available(),
            "snapshot assembled"
        );
        snapshot
    }
}
