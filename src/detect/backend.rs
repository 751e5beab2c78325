use anyhow::Result;
use std::path::Path;

use crate::detect::result::DetectionOutcome;

/// Backend families behind the uniform `Detector` capability.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// One confidence per localized bounding box.
    Region,
    /// One confidence per detected face region.
    Landmark,
    /// Person count parsed from a free-form model answer.
    LanguageModel,
    /// Deterministic, model-free backend.
    Stub,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Region => "region",
            BackendKind::Landmark => "landmark",
            BackendKind::LanguageModel => "llm",
            BackendKind::Stub => "stub",
        }
    }
}

/// Detection capability.
///
/// Implementations own their model/connection setup, which happens once in the
/// constructor (or `warm_up`) and is reused for every image of a run. A run
/// never calls `detect` concurrently on one instance.
///
/// `detect` errors are per-image backend failures: the processor records them
/// and moves on.
pub trait Detector: Send {
    /// Backend identifier, e.g. `"region"`.
    fn name(&self) -> &str;

    /// Model version or variant, e.g. `"yolov8n.onnx"` or `"gemma3:4b"`.
    fn version(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Descriptive model metadata stored in the run's configuration snapshot.
    fn model_info(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "version": self.version(),
            "kind": self.kind().as_str(),
        })
    }

    /// Optional warm-up hook, called once before the first image.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run detection on one image file.
    fn detect(&mut self, image_path: &Path) -> Result<DetectionOutcome>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn version(&self) -> &str {
        (**self).version()
    }

    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    fn model_info(&self) -> serde_json::Value {
        (**self).model_info()
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }

    fn detect(&mut self, image_path: &Path) -> Result<DetectionOutcome> {
        (**self).detect(image_path)
    }
}
