//! Background resource sampling.
//!
//! One sampler thread per run folds readings into constant-memory aggregates.

mod probe;

pub use probe::{GpuProbe, NoGpu, NvidiaSmiProbe, ProcfsProbe};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// One point-in-time reading. Percentages in [0, 100].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResourceSample {
    pub timestamp_ms: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_percent: Option<f64>,
}

/// Source of resource readings. A failed reading is skipped, not fatal.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Result<ResourceSample>;
}

impl<P: ResourceProbe + ?Sized> ResourceProbe for Box<P> {
    fn sample(&mut self) -> Result<ResourceSample> {
        (**self).sample()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Metric {
    count: u64,
    sum: f64,
    max: f64,
}

impl Metric {
    fn fold(&mut self, value: f64) {
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.count += 1;
        self.sum += value;
    }

    fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceAccumulator {
    cpu: Metric,
    memory: Metric,
    gpu: Metric,
    samples: u64,
    skipped: u64,
}

impl ResourceAccumulator {
    pub fn fold(&mut self, sample: &ResourceSample) {
        self.samples += 1;
        self.cpu.fold(sample.cpu_percent);
        self.memory.fold(sample.memory_percent);
        if let Some(gpu) = sample.gpu_percent {
            self.gpu.fold(gpu);
        }
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            avg_cpu: self.cpu.avg(),
            max_cpu: self.cpu.max(),
            avg_memory: self.memory.avg(),
            max_memory: self.memory.max(),
            avg_gpu: self.gpu.avg(),
            max_gpu: self.gpu.max(),
            samples: self.samples,
            skipped_samples: self.skipped,
        }
    }
}

/// Aggregates over every sample taken so far. Absent when nothing was sampled.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub avg_cpu: Option<f64>,
    pub max_cpu: Option<f64>,
    pub avg_memory: Option<f64>,
    pub max_memory: Option<f64>,
    pub avg_gpu: Option<f64>,
    pub max_gpu: Option<f64>,
    pub samples: u64,
    pub skipped_samples: u64,
}

pub struct SystemMonitor {
    state: Arc<Mutex<ResourceAccumulator>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SystemMonitor {
    /// Spawn the sampler. The first sample is taken immediately.
    pub fn start<P>(probe: P, interval: Duration) -> Result<Self>
    where
        P: ResourceProbe + 'static,
    {
        let state = Arc::new(Mutex::new(ResourceAccumulator::default()));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&state);
        let mut probe = probe;
        let handle = std::thread::Builder::new()
            .name("resource-monitor".to_string())
            .spawn(move || loop {
                match probe.sample() {
                    Ok(sample) => {
                        if let Ok(mut acc) = shared.lock() {
                            acc.fold(&sample);
                        }
                    }
                    Err(e) => {
                        log::debug!("resource sample skipped: {:#}", e);
                        if let Ok(mut acc) = shared.lock() {
                            acc.skip();
                        }
                    }
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        log::info!("resource monitor started (interval {:?})", interval);
        Ok(Self {
            state,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        match self.state.lock() {
            Ok(acc) => acc.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        }
    }

    /// Stop sampling and join the thread. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("resource monitor thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
