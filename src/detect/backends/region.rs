use anyhow::{anyhow, Result};
use std::path::Path;
use std::time::Instant;

use crate::detect::backend::{BackendKind, Detector};
use crate::detect::result::{BoxDetection, DetectionOutcome, RawOutput};
use crate::RunError;

/// COCO class id for `person`.
pub const PERSON_CLASS_ID: u32 = 0;

/// Default minimum box score kept by the region adapter.
pub const DEFAULT_REGION_MIN_SCORE: f32 = 0.25;

/// Port to a bounding-box model.
///
/// Implementations return every box they found, any class; the adapter does the
/// person filtering.
pub trait BoxModel: Send {
    /// Model identifier (file name or variant).
    fn describe(&self) -> String;

    fn predict(&mut self, image_path: &Path) -> Result<Vec<BoxDetection>>;
}

/// Region-based detector: one confidence per person box.
pub struct RegionDetector<M: BoxModel> {
    model: M,
    version: String,
    min_score: f32,
}

impl<M: BoxModel> RegionDetector<M> {
    pub fn new(model: M) -> Self {
        let version = model.describe();
        Self {
            model,
            version,
            min_score: DEFAULT_REGION_MIN_SCORE,
        }
    }

    /// Override the minimum box score.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }
}

impl<M: BoxModel> Detector for RegionDetector<M> {
    fn name(&self) -> &str {
        "region"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Region
    }

    fn model_info(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "version": self.version,
            "kind": self.kind().as_str(),
            "task": "object_detection",
            "classes": ["person"],
            "min_score": self.min_score,
        })
    }

    fn detect(&mut self, image_path: &Path) -> Result<DetectionOutcome> {
        let start = Instant::now();
        let boxes: Vec<BoxDetection> = self
            .model
            .predict(image_path)
            .map_err(|e| anyhow!(RunError::Backend(format!("{:#}", e))))?
            .into_iter()
            .filter(|b| b.class_id == PERSON_CLASS_ID && b.confidence >= self.min_score)
            .collect();
        let confidences = boxes.iter().map(|b| b.confidence).collect();
        DetectionOutcome::new(confidences, RawOutput::Region { boxes }, start.elapsed())
    }
}

/// Greedy per-class non-maximum suppression. Output is sorted by descending score.
pub fn non_max_suppression(mut boxes: Vec<BoxDetection>, iou_threshold: f32) -> Vec<BoxDetection> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoxDetection> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
