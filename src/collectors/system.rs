use crate::collectors::{Clock, CollectError, Sleeper};
use crate::snapshot::{
    bytes_to_gb, bytes_to_mb, percent_of, round1, CpuInfo, DiskInfo, DiskIo, LoadAverage,
    MemoryInfo, Reading, SystemInfo,
};
use std::fmt::Display;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuExt, CpuRefreshKind, DiskExt, System, SystemExt};
use tracing::warn;

#[cfg(target_os = "linux")]
const DISKSTATS_PATH: &str = "/proc/diskstats";
const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct HostIdentity {
    pub platform: String,
    pub hostname: Option<String>,
    pub boot_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuSample {
    pub percent: f64,
    pub count: usize,
    pub frequency_mhz: Option<f64>,
    pub load_average: Option<[f64; 3]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MemorySample {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub swap_total: u64,
    pub swap_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DiskIoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Raw, non-windowed OS facts in bytes and native units.
///
/// Implementations query the OS on every call and keep nothing between calls.
pub trait HostSource: Send + Sync {
    fn identity(&self) -> Result<HostIdentity, CollectError>;
    fn cpu(&self, window: Duration, sleeper: &dyn Sleeper) -> Result<CpuSample, CollectError>;
    fn memory(&self) -> Result<MemorySample, CollectError>;
    fn disk(&self, mount: &str) -> Result<DiskUsage, CollectError>;
    /// `Ok(None)` when the platform exposes no cumulative disk counters.
    fn disk_io(&self) -> Result<Option<DiskIoCounters>, CollectError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoHost;

impl SysinfoHost {
    pub fn new() -> Self {
        Self
    }
}

impl HostSource for SysinfoHost {
    fn identity(&self) -> Result<HostIdentity, CollectError> {
        let system = System::new();
        let boot_time = Some(system.boot_time()).filter(|t| *t > 0);

        let os_name = system
            .name()
            .unwrap_or_else(|| std::env::consts::OS.to_string());
        let platform = match system.kernel_version() {
            Some(kernel) if !kernel.trim().is_empty() => {
                format!("{os_name}-{}-{}", kernel.trim(), std::env::consts::ARCH)
            }
            _ => format!("{os_name}-{}", std::env::consts::ARCH),
        };

        Ok(HostIdentity {
            platform,
            hostname: system.host_name(),
            boot_time,
        })
    }

    fn cpu(&self, window: Duration, sleeper: &dyn Sleeper) -> Result<CpuSample, CollectError> {
        // plain refresh_cpu() never reads the frequency
        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        sleeper.sleep(window.max(System::MINIMUM_CPU_UPDATE_INTERVAL));
        system.refresh_cpu_specifics(CpuRefreshKind::everything());

        let count = system.cpus().len();
        if count == 0 {
            return Err(CollectError::Unsupported("cpu statistics"));
        }

        let frequency_mhz = system
            .cpus()
            .first()
            .map(|c| c.frequency())
            .filter(|f| *f > 0)
            .map(|f| f as f64);

        Ok(CpuSample {
            percent: system.global_cpu_info().cpu_usage() as f64,
            count,
            frequency_mhz,
            load_average: load_average(&system),
        })
    }

    fn memory(&self) -> Result<MemorySample, CollectError> {
        let mut system = System::new();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(CollectError::Unsupported("memory statistics"));
        }

        Ok(MemorySample {
            total,
            used: system.used_memory(),
            available: system.available_memory(),
            swap_total: system.total_swap(),
            swap_used: system.used_swap(),
        })
    }

    fn disk(&self, mount: &str) -> Result<DiskUsage, CollectError> {
        let mut system = System::new();
        system.refresh_disks_list();
        system.refresh_disks();

        // Exact mount wins; otherwise the deepest mount containing the path.
        let target = Path::new(mount);
        let disk = system
            .disks()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().components().count())
            .ok_or_else(|| CollectError::MountNotFound(mount.to_string()))?;

        let total = disk.total_space();
        let free = disk.available_space();
        Ok(DiskUsage {
            total,
            used: total.saturating_sub(free),
            free,
        })
    }

    #[cfg(target_os = "linux")]
    fn disk_io(&self) -> Result<Option<DiskIoCounters>, CollectError> {
        let text = fs::read_to_string(DISKSTATS_PATH).map_err(|source| CollectError::Io {
            path: DISKSTATS_PATH.to_string(),
            source,
        })?;
        let counters = parse_diskstats(&text, |name| {
            Path::new("/sys/block").join(name.replace('/', "!")).exists()
        })?;
        Ok(Some(counters))
    }

    #[cfg(not(target_os = "linux"))]
    fn disk_io(&self) -> Result<Option<DiskIoCounters>, CollectError> {
        Ok(None)
    }
}

#[cfg(not(target_os = "windows"))]
fn load_average(system: &System) -> Option<[f64; 3]> {
    let load = system.load_average();
    Some([load.one, load.five, load.fifteen])
}

#[cfg(target_os = "windows")]
fn load_average(_system: &System) -> Option<[f64; 3]> {
    None
}

/// Sums read/write traffic of whole disks in `/proc/diskstats` format.
///
/// Partitions are skipped through `is_whole_disk` so their traffic is not
/// counted twice.
pub fn parse_diskstats(
    text: &str,
    is_whole_disk: impl Fn(&str) -> bool,
) -> Result<DiskIoCounters, CollectError> {
    let mut out = DiskIoCounters::default();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || !is_whole_disk(fields[2]) {
            continue;
        }

        let sectors_read = parse_counter(fields[5], "/proc/diskstats")?;
        let sectors_written = parse_counter(fields[9], "/proc/diskstats")?;
        out.read_bytes = out
            .read_bytes
            .saturating_add(sectors_read.saturating_mul(SECTOR_SIZE));
        out.write_bytes = out
            .write_bytes
            .saturating_add(sectors_written.saturating_mul(SECTOR_SIZE));
    }
    Ok(out)
}

pub(crate) fn parse_counter(raw: &str, path: &str) -> Result<u64, CollectError> {
    raw.parse::<u64>().map_err(|err| CollectError::Parse {
        path: path.to_string(),
        reason: format!("{raw:?}: {err}"),
    })
}

/// The instantaneous sections of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticFacts {
    pub system: Reading<SystemInfo>,
    pub cpu: Reading<CpuInfo>,
    pub memory: Reading<MemoryInfo>,
    pub disk: Reading<DiskInfo>,
}

impl StaticFacts {
    pub fn failed(reason: impl Display) -> Self {
        let reason = reason.to_string();
        Self {
            system: Reading::failed(&reason),
            cpu: Reading::failed(&reason),
            memory: Reading::failed(&reason),
            disk: Reading::failed(&reason),
        }
    }
}

pub struct StaticCollector {
    host: Arc<dyn HostSource>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    cpu_window: Duration,
    root_mount: String,
}

impl StaticCollector {
    pub fn new(
        host: Arc<dyn HostSource>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        cpu_window: Duration,
        root_mount: String,
    ) -> Self {
        Self {
            host,
            clock,
            sleeper,
            cpu_window,
            root_mount,
        }
    }

    /// Collects every section independently; one failing query only fails
    /// its own section.
    pub fn collect(&self) -> StaticFacts {
        StaticFacts {
            system: guarded("system", self.system()),
            cpu: guarded("cpu", self.cpu()),
            memory: guarded("memory", self.memory()),
            disk: guarded("disk", self.disk()),
        }
    }

    fn system(&self) -> Result<SystemInfo, CollectError> {
        let identity = self.host.identity()?;
        let now = self.clock.now();
        let uptime = identity
            .boot_time
            .map(|boot| (now - boot as f64).max(0.0) as u64);
        Ok(SystemInfo {
            platform: identity.platform,
            hostname: identity.hostname,
            uptime_seconds: uptime,
            boot_time: identity.boot_time,
        })
    }

    fn cpu(&self) -> Result<CpuInfo, CollectError> {
        let sample = self.host.cpu(self.cpu_window, self.sleeper.as_ref())?;
        Ok(CpuInfo {
            percent: round1(sample.percent),
            count: sample.count,
            frequency_mhz: sample.frequency_mhz,
            load_average: LoadAverage::from_triple(sample.load_average),
        })
    }

    fn memory(&self) -> Result<MemoryInfo, CollectError> {
        let m = self.host.memory()?;
        Ok(MemoryInfo {
            total_gb: bytes_to_gb(m.total),
            used_gb: bytes_to_gb(m.used),
            available_gb: bytes_to_gb(m.available),
            percent: percent_of(m.total.saturating_sub(m.available), m.total),
            swap_total_gb: bytes_to_gb(m.swap_total),
            swap_used_gb: bytes_to_gb(m.swap_used),
            swap_percent: percent_of(m.swap_used, m.swap_total),
        })
    }

    fn disk(&self) -> Result<DiskInfo, CollectError> {
        let usage = self.host.disk(&self.root_mount)?;
        let io = match self.host.disk_io() {
            Ok(io) => io,
            Err(err) => {
                warn!(collector = "disk_io", error = %err, "disk io counters unavailable");
                None
            }
        };

        Ok(DiskInfo {
            total_gb: bytes_to_gb(usage.total),
            used_gb: bytes_to_gb(usage.used),
            free_gb: bytes_to_gb(usage.free),
            percent: percent_of(usage.used, usage.total),
            disk_io: DiskIo {
                read_mb: io.map(|c| bytes_to_mb(c.read_bytes)),
                write_mb: io.map(|c| bytes_to_mb(c.write_bytes)),
            },
        })
    }
}

fn guarded<T>(collector: &'static str, result: Result<T, CollectError>) -> Reading<T> {
    if let Err(err) = &result {
        warn!(collector, error = %err, "measurement failed");
    }
    Reading::from(result)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct FakeHost {
        pub boot_time: Option<u64>,
        pub fail_disk: bool,
        pub fail_disk_io: bool,
        pub load_average: Option<[f64; 3]>,
        pub memory: MemorySample,
        pub disk: DiskUsage,
        pub disk_io: Option<DiskIoCounters>,
    }

    impl FakeHost {
        pub fn healthy() -> Self {
            Self {
                boot_time: Some(1_700_000_000),
                fail_disk: false,
                fail_disk_io: false,
                load_average: Some([0.5, 0.75, 1.0]),
                memory: MemorySample {
                    total: 8 * 1_073_741_824,
                    used: 2 * 1_073_741_824,
                    available: 6 * 1_073_741_824,
                    swap_total: 1_073_741_824,
                    swap_used: 0,
                },
                disk: DiskUsage {
                    total: 100 * 1_073_741_824,
                    used: 25 * 1_073_741_824,
                    free: 75 * 1_073_741_824,
                },
                disk_io: Some(DiskIoCounters {
                    read_bytes: 3 * 1_048_576,
                    write_bytes: 1_048_576 / 2,
                }),
            }
        }
    }

    impl HostSource for FakeHost {
        fn identity(&self) -> Result<HostIdentity, CollectError> {
            Ok(HostIdentity {
                platform: "Linux-6.1.0-x86_64".to_string(),
                hostname: Some("node-1".to_string()),
                boot_time: self.boot_time,
            })
        }

        fn cpu(&self, window: Duration, sleeper: &dyn Sleeper) -> Result<CpuSample, CollectError> {
            sleeper.sleep(window);
            Ok(CpuSample {
                percent: 12.345,
                count: 8,
                frequency_mhz: None,
                load_average: self.load_average,
            })
        }

        fn memory(&self) -> Result<MemorySample, CollectError> {
            Ok(self.memory)
        }

        fn disk(&self, mount: &str) -> Result<DiskUsage, CollectError> {
            if self.fail_disk {
                return Err(CollectError::Io {
                    path: mount.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "permission denied",
                    ),
                });
            }
            Ok(self.disk)
        }

        fn disk_io(&self) -> Result<Option<DiskIoCounters>, CollectError> {
            if self.fail_disk_io {
                return Err(CollectError::Unsupported("disk io"));
            }
            Ok(self.disk_io)
        }
    }
}
