use crate::config::GpuConfig;
use crate::snapshot::{GpuDevice, GpuReport};
use std::fmt;
use std::io;
use std::process::{Command, Output};
use thiserror::Error;
use tracing::{info, warn};

pub const BACKEND_NOT_INSTALLED: &str = "backend not installed";
pub const NO_GPUS_DETECTED: &str = "no GPUs detected";
pub const GPU_DISABLED: &str = "gpu collection disabled";

const QUERY_ARGS: [&str; 2] = [
    "--query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu",
    "--format=csv,noheader,nounits",
];

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("backend not installed")]
    NotInstalled,
    #[error("failed to run {program}: {source}")]
    Launch { program: String, source: io::Error },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{program} produced non UTF-8 output")]
    Encoding { program: String },
}

pub trait GpuBackend: Send + Sync {
    fn devices(&self) -> Result<Vec<GpuDevice>, GpuError>;
}

/// Result of probing for a GPU backend, fixed for the process lifetime.
pub enum GpuCapability {
    Unavailable(String),
    Available(Box<dyn GpuBackend>),
}

impl fmt::Debug for GpuCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuCapability::Unavailable(reason) => {
                f.debug_tuple("Unavailable").field(reason).finish()
            }
            GpuCapability::Available(_) => f.write_str("Available"),
        }
    }
}

impl GpuCapability {
    pub fn probe(cfg: &GpuConfig) -> Self {
        if !cfg.enabled {
            return GpuCapability::Unavailable(GPU_DISABLED.to_string());
        }

        let backend = NvidiaSmi::new(cfg.nvidia_smi.clone());
        match backend.run(&["-L"]) {
            Ok(_) => {
                info!(program = %backend.program, "nvidia-smi found");
                GpuCapability::Available(Box::new(backend))
            }
            Err(GpuError::NotInstalled) => {
                info!(program = %backend.program, "nvidia-smi not found, gpu metrics disabled");
                GpuCapability::Unavailable(BACKEND_NOT_INSTALLED.to_string())
            }
            Err(err) => {
                warn!(error = %err, "gpu backend probe failed");
                GpuCapability::Unavailable(err.to_string())
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, GpuCapability::Available(_))
    }
}

#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    program: String,
}

impl NvidiaSmi {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output, GpuError> {
        match Command::new(&self.program).args(args).output() {
            Ok(output) => return Ok(output),
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                return Err(GpuError::Launch {
                    program: self.program.clone(),
                    source: err,
                })
            }
            Err(_) => {}
        }

        #[cfg(target_os = "windows")]
        {
            if self.program == "nvidia-smi" {
                if let Ok(output) = Command::new(r"C:\Windows\System32\nvidia-smi.exe")
                    .args(args)
                    .output()
                {
                    return Ok(output);
                }
            }
        }

        Err(GpuError::NotInstalled)
    }
}

impl GpuBackend for NvidiaSmi {
    fn devices(&self) -> Result<Vec<GpuDevice>, GpuError> {
        let output = self.run(&QUERY_ARGS)?;
        devices_from_output(&self.program, output)
    }
}

/// Maps a finished `nvidia-smi --query-gpu` run to its devices.
pub fn devices_from_output(program: &str, output: Output) -> Result<Vec<GpuDevice>, GpuError> {
    let stdout = String::from_utf8(output.stdout).map_err(|_| GpuError::Encoding {
        program: program.to_string(),
    })?;

    if !output.status.success() {
        // nvidia-smi exits non-zero when the driver sees no devices
        if stdout.contains("No devices were found") {
            return Ok(Vec::new());
        }
        return Err(GpuError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(parse_nvidia_smi_csv(&stdout))
}

/// Parses `index, name, utilization.gpu, memory.used, memory.total,
/// temperature.gpu` rows. `[N/A]` cells become null.
pub fn parse_nvidia_smi_csv(text: &str) -> Vec<GpuDevice> {
    text.lines()
        .enumerate()
        .filter_map(|(row, line)| {
            let parts: Vec<&str> = line.split(',').map(|v| v.trim()).collect();
            if parts.len() < 6 {
                return None;
            }

            let memory_used = parse_f64_loose(parts[3]);
            let memory_total = parse_f64_loose(parts[4]);
            let memory_percent = match (memory_used, memory_total) {
                (Some(used), Some(total)) if total > 0.0 => Some(used / total * 100.0),
                _ => None,
            };

            Some(GpuDevice {
                id: parts[0].parse().unwrap_or(row as u32),
                name: parts[1].to_string(),
                load: parse_f64_loose(parts[2]),
                memory_used,
                memory_total,
                memory_percent,
                temperature: parse_f64_loose(parts[5]),
            })
        })
        .collect()
}

fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}

pub struct GpuCollector {
    capability: GpuCapability,
}

impl GpuCollector {
    pub fn new(capability: GpuCapability) -> Self {
        Self { capability }
    }

    pub fn capability(&self) -> &GpuCapability {
        &self.capability
    }

    pub fn collect(&self) -> GpuReport {
        let backend = match &self.capability {
            GpuCapability::Unavailable(reason) => return GpuReport::unavailable(reason),
            GpuCapability::Available(backend) => backend,
        };

        match backend.devices() {
            Ok(gpus) if gpus.is_empty() => GpuReport::unavailable(NO_GPUS_DETECTED),
            Ok(gpus) => GpuReport::Available { gpus },
            Err(err) => {
                warn!(collector = "gpu", error = %err, "gpu query failed");
                GpuReport::unavailable(err)
            }
        }
    }
}
