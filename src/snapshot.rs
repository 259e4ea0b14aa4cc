use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::Display;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One complete, timestamped set of host metrics.
///
/// Every field is always serialized. Sections that could not be produced
/// carry `{"error": "..."}` instead of their usual shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub timestamp: f64,
    pub system: Reading<SystemInfo>,
    pub cpu: Reading<CpuInfo>,
    pub memory: Reading<MemoryInfo>,
    pub disk: Reading<DiskInfo>,
    pub network: Reading<NetworkRates>,
    pub gpu: GpuReport,
}

impl Snapshot {
    /// A snapshot in which every section failed for the same reason.
    pub fn unavailable(timestamp: f64, reason: impl Display) -> Self {
        let reason = reason.to_string();
        Self {
            timestamp,
            system: Reading::failed(&reason),
            cpu: Reading::failed(&reason),
            memory: Reading::failed(&reason),
            disk: Reading::failed(&reason),
            network: Reading::failed(&reason),
            gpu: GpuReport::unavailable(&reason),
        }
    }
}

pub type NetworkRates = BTreeMap<String, InterfaceRate>;

/// Either a measured value or the reason it could not be measured.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading<T> {
    Ok(T),
    Failed { error: String },
}

impl<T> Reading<T> {
    pub fn failed(reason: impl Display) -> Self {
        Reading::Failed {
            error: reason.to_string(),
        }
    }

    pub fn as_ok(&self) -> Option<&T> {
        match self {
            Reading::Ok(value) => Some(value),
            Reading::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Reading::Failed { .. })
    }
}

impl<T, E: Display> From<Result<T, E>> for Reading<T> {
    fn from(value: Result<T, E>) -> Self {
        match value {
            Ok(v) => Reading::Ok(v),
            Err(err) => Reading::failed(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub platform: String,
    pub hostname: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub boot_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuInfo {
    pub percent: f64,
    pub count: usize,
    pub frequency_mhz: Option<f64>,
    pub load_average: LoadAverage,
}

/// 1/5/15-minute load averages. Either all three are present or none is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadAverage {
    #[serde(rename = "1min")]
    pub one: Option<f64>,
    #[serde(rename = "5min")]
    pub five: Option<f64>,
    #[serde(rename = "15min")]
    pub fifteen: Option<f64>,
}

impl LoadAverage {
    pub fn unsupported() -> Self {
        Self {
            one: None,
            five: None,
            fifteen: None,
        }
    }

    pub fn from_triple(values: Option<[f64; 3]>) -> Self {
        match values {
            Some([one, five, fifteen]) => Self {
                one: Some(one),
                five: Some(five),
                fifteen: Some(fifteen),
            },
            None => Self::unsupported(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub percent: f64,
    pub swap_total_gb: f64,
    pub swap_used_gb: f64,
    pub swap_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskInfo {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
    pub disk_io: DiskIo,
}

/// Cumulative disk traffic since boot, null where the host exposes no counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiskIo {
    pub read_mb: Option<f64>,
    pub write_mb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceRate {
    pub sent_mbps: f64,
    pub recv_mbps: f64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GpuReport {
    Unavailable { error: String },
    Available { gpus: Vec<GpuDevice> },
}

impl GpuReport {
    pub fn unavailable(reason: impl Display) -> Self {
        GpuReport::Unavailable {
            error: reason.to_string(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, GpuReport::Available { .. })
    }
}

impl Serialize for GpuReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        match self {
            GpuReport::Unavailable { error } => {
                map.serialize_entry("available", &false)?;
                map.serialize_entry("error", error)?;
            }
            GpuReport::Available { gpus } => {
                map.serialize_entry("available", &true)?;
                map.serialize_entry("gpus", gpus)?;
            }
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuDevice {
    pub id: u32,
    pub name: String,
    pub load: Option<f64>,
    pub memory_used: Option<f64>,
    pub memory_total: Option<f64>,
    pub memory_percent: Option<f64>,
    pub temperature: Option<f64>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / BYTES_PER_GB)
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    round2(bytes as f64 / BYTES_PER_MB)
}

/// `part / total` in percent, one decimal. A zero total reads as 0%.
pub fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round1(part as f64 / total as f64 * 100.0)
}
