use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::detect::{ConfidenceStats, DetectionOutcome, RawOutput};
use crate::monitor::ResourceSnapshot;
use crate::ImageRecord;

/// Run lifecycle. Terminal states never transition again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "CREATED",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "CREATED" => Ok(RunStatus::Created),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            other => Err(anyhow!("unknown run status {:?}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Validated move to `next`. Only forward moves are accepted.
    pub fn transition(self, next: RunStatus) -> Result<RunStatus> {
        let allowed = match (self, next) {
            (RunStatus::Created, RunStatus::Running) => true,
            (RunStatus::Created, RunStatus::Failed) => true,
            (RunStatus::Running, n) => n.is_terminal(),
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(anyhow!(
                "invalid run status transition {} -> {}",
                self.as_str(),
                next.as_str()
            ))
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted outcome per processed image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub run_id: String,
    pub image_path: String,
    pub image_filename: String,
    pub classification: String,
    pub raw_output: Option<RawOutput>,
    pub confidences: Vec<f32>,
    pub persons_detected: u32,
    /// Present iff `persons_detected > 0`.
    pub confidence: Option<ConfidenceStats>,
    pub uncertain: bool,
    pub processing_time_s: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp_ms: u64,
}

impl DetectionResult {
    pub fn success(
        run_id: &str,
        image: &ImageRecord,
        outcome: DetectionOutcome,
        threshold: f32,
        elapsed: Duration,
        timestamp_ms: u64,
    ) -> Self {
        let confidence = outcome.stats();
        let uncertain = confidence
            .map(|stats| stats.is_uncertain(threshold))
            .unwrap_or(false);
        Self {
            run_id: run_id.to_string(),
            image_path: image.path.display().to_string(),
            image_filename: image.filename(),
            classification: image.classification.clone(),
            persons_detected: outcome.persons_detected,
            confidences: outcome.confidences,
            raw_output: Some(outcome.raw_output),
            confidence,
            uncertain,
            processing_time_s: elapsed.as_secs_f64(),
            success: true,
            error_message: None,
            timestamp_ms,
        }
    }

    pub fn failure(
        run_id: &str,
        image: &ImageRecord,
        error: &anyhow::Error,
        elapsed: Duration,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            image_path: image.path.display().to_string(),
            image_filename: image.filename(),
            classification: image.classification.clone(),
            raw_output: None,
            confidences: Vec::new(),
            persons_detected: 0,
            confidence: None,
            uncertain: false,
            processing_time_s: elapsed.as_secs_f64(),
            success: false,
            error_message: Some(format!("{:#}", error)),
            timestamp_ms,
        }
    }
}

/// Per-image processing time aggregates, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub avg_s: Option<f64>,
    pub total_s: f64,
    pub min_s: Option<f64>,
    pub max_s: Option<f64>,
}

#[derive(Debug, Default)]
pub(crate) struct TimingAccumulator {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl TimingAccumulator {
    pub(crate) fn record(&mut self, seconds: f64) {
        self.count += 1;
        self.sum += seconds;
        self.min = Some(self.min.map_or(seconds, |m| m.min(seconds)));
        self.max = Some(self.max.map_or(seconds, |m| m.max(seconds)));
    }

    /// `wall_s` is the run's wall-clock time, which includes pauses and overhead.
    pub(crate) fn finish(&self, wall_s: f64) -> TimingStats {
        TimingStats {
            avg_s: (self.count > 0).then(|| self.sum / self.count as f64),
            total_s: wall_s,
            min_s: self.min,
            max_s: self.max,
        }
    }
}

/// Row written when a run starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub run_name: Option<String>,
    pub job_id: Option<String>,
    pub backend: String,
    pub backend_version: String,
    pub status: RunStatus,
    pub start_time_ms: u64,
    pub end_time_ms: Option<u64>,
    pub planned_images: u64,
    pub total_images: u64,
    pub successful_images: u64,
    pub failed_images: u64,
    pub timing: TimingStats,
    pub resources: Option<ResourceSnapshot>,
    pub config: serde_json::Value,
    pub model_info: serde_json::Value,
    pub error_message: Option<String>,
}

/// Terminal state written once, atomically, at the end of a run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunFinalization {
    pub run_id: String,
    pub status: RunStatus,
    pub end_time_ms: u64,
    pub total_images: u64,
    pub successful_images: u64,
    pub failed_images: u64,
    pub timing: TimingStats,
    pub resources: ResourceSnapshot,
    pub error_message: Option<String>,
}

impl RunRecord {
    pub fn apply(&mut self, fin: &RunFinalization) {
        self.status = fin.status;
        self.end_time_ms = Some(fin.end_time_ms);
        self.total_images = fin.total_images;
        self.successful_images = fin.successful_images;
        self.failed_images = fin.failed_images;
        self.timing = fin.timing;
        self.resources = Some(fin.resources.clone());
        self.error_message = fin.error_message.clone();
    }
}

/// What the caller gets back from a run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub run_name: Option<String>,
    pub backend: String,
    pub status: RunStatus,
    pub planned_images: u64,
    pub total_images: u64,
    pub successful_images: u64,
    pub failed_images: u64,
    pub uncertain_images: u64,
    pub persons_detected: u64,
    pub timing: TimingStats,
    pub resources: ResourceSnapshot,
    pub error_message: Option<String>,
}
