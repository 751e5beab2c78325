use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::process::Command;

use super::{ResourceProbe, ResourceSample};
use crate::RunError;

/// GPU utilization port. `Ok(None)` means no GPU, which is not an error.
pub trait GpuProbe: Send {
    fn utilization(&mut self) -> Result<Option<f64>>;
}

/// Always reports no GPU.
pub struct NoGpu;

impl GpuProbe for NoGpu {
    fn utilization(&mut self) -> Result<Option<f64>> {
        Ok(None)
    }
}

/// Reads utilization from `nvidia-smi`. Averages across devices.
pub struct NvidiaSmiProbe {
    binary: String,
    available: bool,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self::with_binary("nvidia-smi")
    }

    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            available: true,
        }
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe for NvidiaSmiProbe {
    fn utilization(&mut self) -> Result<Option<f64>> {
        if !self.available {
            return Ok(None);
        }
        let output = match Command::new(&self.binary)
            .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                log::debug!("{} unavailable, GPU sampling disabled: {}", self.binary, e);
                self.available = false;
                return Ok(None);
            }
        };
        if !output.status.success() {
            self.available = false;
            return Ok(None);
        }
        parse_gpu_utilization(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_gpu_utilization(stdout: &str) -> Result<Option<f64>> {
    let mut values = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let value: f64 = line.parse().map_err(|_| {
            anyhow!(RunError::ResourceSample(format!(
                "unparseable GPU utilization {:?}",
                line
            )))
        })?;
        values.push(value);
    }
    if values.is_empty() {
        return Ok(None);
    }
    Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Linux procfs reader. CPU is the busy share since the previous reading.
///
/// A baseline `/proc/stat` reading is taken at construction. Until a later
/// reading shows elapsed ticks, samples fail and are skipped by the monitor.
pub struct ProcfsProbe {
    proc_root: PathBuf,
    previous: Option<CpuTimes>,
    gpu: Box<dyn GpuProbe>,
}

impl ProcfsProbe {
    pub fn new(gpu: Box<dyn GpuProbe>) -> Self {
        Self::with_root("/proc", gpu)
    }

    pub fn with_root(proc_root: impl Into<PathBuf>, gpu: Box<dyn GpuProbe>) -> Self {
        let mut probe = Self {
            proc_root: proc_root.into(),
            previous: None,
            gpu,
        };
        probe.previous = probe
            .read("stat")
            .and_then(|stat| parse_cpu_times(&stat))
            .map_err(|e| log::debug!("no CPU baseline: {:#}", e))
            .ok();
        probe
    }

    fn read(&self, name: &str) -> Result<String> {
        let path = self.proc_root.join(name);
        std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .map_err(|e| anyhow!(RunError::ResourceSample(format!("{:#}", e))))
    }
}

impl ResourceProbe for ProcfsProbe {
    fn sample(&mut self) -> Result<ResourceSample> {
        let times = parse_cpu_times(&self.read("stat")?)?;
        let Some(prev) = self.previous else {
            self.previous = Some(times);
            return Err(anyhow!(RunError::ResourceSample(
                "no CPU baseline yet".into()
            )));
        };
        let cpu_percent = cpu_busy_percent(prev, times).ok_or_else(|| {
            anyhow!(RunError::ResourceSample(
                "no CPU ticks elapsed since previous reading".into()
            ))
        })?;
        self.previous = Some(times);
        let memory_percent = parse_memory_percent(&self.read("meminfo")?)?;
        let gpu_percent = match self.gpu.utilization() {
            Ok(gpu) => gpu,
            Err(e) => {
                log::debug!("GPU reading failed: {:#}", e);
                None
            }
        };
        Ok(ResourceSample {
            timestamp_ms: crate::now_ms()?,
            cpu_percent,
            memory_percent,
            gpu_percent,
        })
    }
}

fn parse_cpu_times(stat: &str) -> Result<CpuTimes> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| anyhow!(RunError::ResourceSample("no aggregate cpu line".into())))?;
    let fields = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!(RunError::ResourceSample(format!("bad cpu line: {}", e))))?;
    if fields.len() < 4 {
        return Err(anyhow!(RunError::ResourceSample(
            "cpu line has too few fields".into()
        )));
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

/// `None` when no ticks elapsed between the two readings.
fn cpu_busy_percent(prev: CpuTimes, now: CpuTimes) -> Option<f64> {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return None;
    }
    let idle = now.idle.saturating_sub(prev.idle);
    Some((total.saturating_sub(idle) as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
}

fn parse_memory_percent(meminfo: &str) -> Result<f64> {
    let field = |key: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };
    let total = field("MemTotal:")
        .filter(|t| *t > 0)
        .ok_or_else(|| anyhow!(RunError::ResourceSample("MemTotal missing".into())))?;
    let available = field("MemAvailable:")
        .ok_or_else(|| anyhow!(RunError::ResourceSample("MemAvailable missing".into())))?;
    Ok(((1.0 - available as f64 / total as f64) * 100.0).clamp(0.0, 100.0))
}
