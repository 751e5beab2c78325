//! Detection Bench
//!
//! Batch person-detection runs over a corpus of pre-classified images.
//!
//! # Architecture
//!
//! A run moves through a small number of collaborators:
//!
//! 1. **Dataset**: `DataLoader` enumerates `<root>/<label>/<image>` files, filters
//!    them by label, and returns a lexical or uniformly shuffled sample.
//! 2. **Detect**: `Detector` is the uniform capability every backend implements
//!    (region boxes, face landmarks, language-model counting, stub).
//! 3. **Monitor**: `SystemMonitor` samples CPU/memory/GPU on its own thread and
//!    keeps constant-memory running aggregates.
//! 4. **Processor**: `DetectionProcessor` owns the run state machine, the
//!    per-image loop, and finalization.
//! 5. **Storage**: `RunRecorder` is the persistence port (SQLite or in-memory).
//! 6. **Export**: a recorded run leaves as a JSON bundle or as run and
//!    results CSV files.
//!
//! Per-image backend failures are recorded as data and never abort a run. Only
//! persistence failures and pre-run input errors are fatal.

use anyhow::Result;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod dataset;
pub mod detect;
pub mod export;
pub mod monitor;
pub mod processor;
pub mod run;
pub mod storage;

pub use config::{timeout_from_secs, BackendSettings, RunConfig};
pub use dataset::{class_counts, DataLoader, ImageFormat, ImageRecord, SampleOrder, SamplingOptions};
pub use detect::{
    BackendKind, ConfidenceStats, DetectionOutcome, Detector, DetectorRegistry, RawOutput,
    StubDetector,
};
pub use export::RunExport;
pub use monitor::{
    GpuProbe, NvidiaSmiProbe, ProcfsProbe, ResourceProbe, ResourceSample, ResourceSnapshot,
    SystemMonitor,
};
pub use processor::{DetectionProcessor, ProcessorOptions, RunObserver};
pub use run::{
    DetectionResult, RunFinalization, RunRecord, RunStatus, RunSummary, TimingStats,
};
pub use storage::{InMemoryRunRecorder, RunRecorder, SqliteRunRecorder};

// -------------------- Errors --------------------

/// Error taxonomy for a run.
///
/// Carried inside `anyhow::Error`; callers classify with
/// `err.downcast_ref::<RunError>()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunError {
    /// Missing/invalid input or configuration, surfaced before a run starts.
    Input(String),
    /// A backend failed on a single image. Recorded, never fatal.
    Backend(String),
    /// A single resource reading failed. The sample is skipped.
    ResourceSample(String),
    /// Recording a result or finalizing a run failed. Fatal to the run.
    Persistence(String),
    /// Cooperative cancellation was observed.
    Cancelled,
}

impl RunError {
    pub fn code(&self) -> &'static str {
        match self {
            RunError::Input(_) => "INPUT_ERROR",
            RunError::Backend(_) => "BACKEND_ERROR",
            RunError::ResourceSample(_) => "RESOURCE_SAMPLE_ERROR",
            RunError::Persistence(_) => "PERSISTENCE_ERROR",
            RunError::Cancelled => "CANCELLATION_REQUESTED",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RunError::Input(_) | RunError::Persistence(_))
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Input(msg)
            | RunError::Backend(msg)
            | RunError::ResourceSample(msg)
            | RunError::Persistence(msg) => write!(f, "{}: {}", self.code(), msg),
            RunError::Cancelled => write!(f, "{}", self.code()),
        }
    }
}

impl std::error::Error for RunError {}

/// Returns the `RunError` carried by an `anyhow::Error`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&RunError> {
    err.downcast_ref::<RunError>()
}

// -------------------- Run context --------------------

/// Cooperative cancellation flag shared between the caller and the processor.
///
/// The processor only checks it between images.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Caller-owned state for one run. Passed by reference into the processor.
#[derive(Clone, Debug, Default)]
pub struct RunContext {
    pub run_name: Option<String>,
    pub job_id: Option<String>,
    pub cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(run_name: Option<String>, job_id: Option<String>) -> Self {
        Self {
            run_name,
            job_id,
            cancellation: CancellationToken::new(),
        }
    }
}

// -------------------- Helpers --------------------

/// Opaque run identifier: 16 random bytes, lowercase hex.
pub fn new_run_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> Result<u64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(u64::try_from(elapsed.as_millis())?)
}
