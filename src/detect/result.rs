use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::RunError;

/// Outcome of running one backend on one image.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionOutcome {
    pub persons_detected: u32,
    /// One entry per detection, each in `0.0..=1.0`.
    pub confidences: Vec<f32>,
    pub raw_output: RawOutput,
    /// Backend-side latency. The processor measures wall time separately.
    pub latency: Duration,
}

impl DetectionOutcome {
    /// Builds an outcome, rejecting non-finite scores and clamping the rest to `[0, 1]`.
    pub fn new(confidences: Vec<f32>, raw_output: RawOutput, latency: Duration) -> Result<Self> {
        let confidences = normalize_confidences(confidences)?;
        Ok(Self {
            persons_detected: u32::try_from(confidences.len())?,
            confidences,
            raw_output,
            latency,
        })
    }

    pub fn stats(&self) -> Option<ConfidenceStats> {
        ConfidenceStats::from_confidences(&self.confidences)
    }
}

fn normalize_confidences(confidences: Vec<f32>) -> Result<Vec<f32>> {
    confidences
        .into_iter()
        .map(|c| {
            if c.is_finite() {
                Ok(c.clamp(0.0, 1.0))
            } else {
                Err(anyhow!(RunError::Backend(format!(
                    "backend returned non-finite confidence {}",
                    c
                ))))
            }
        })
        .collect()
}

/// Average/maximum/minimum over a non-empty confidence sequence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceStats {
    pub avg: f32,
    pub max: f32,
    pub min: f32,
}

impl ConfidenceStats {
    /// Returns `None` for an empty sequence. There is no zero default.
    pub fn from_confidences(confidences: &[f32]) -> Option<Self> {
        if confidences.is_empty() {
            return None;
        }
        let sum: f64 = confidences.iter().map(|c| f64::from(*c)).sum();
        let max = confidences.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let min = confidences.iter().cloned().fold(f32::INFINITY, f32::min);
        Some(Self {
            avg: (sum / confidences.len() as f64) as f32,
            max,
            min,
        })
    }

    /// Strictly below the threshold is uncertain; equality is confident.
    pub fn is_uncertain(&self, threshold: f32) -> bool {
        self.avg < threshold
    }
}

/// Backend-specific payload, one variant per backend family.
///
/// Serialized as internally tagged JSON: `{"variant": "region", ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum RawOutput {
    Region {
        boxes: Vec<BoxDetection>,
    },
    Landmark {
        faces: Vec<FaceRegion>,
        /// Faces the locator reported before score filtering.
        faces_located: u32,
    },
    LanguageModel {
        answer: String,
        model: String,
        synthesized_confidence: f32,
    },
    Stub {
        digest: String,
    },
}

/// Axis-aligned person box in source-image pixels (`x1,y1` top-left).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl BoxDetection {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoxDetection) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Face region in source-image pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub confidence: f32,
}
