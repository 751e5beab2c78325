use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};
use url::Url;

use crate::detect::backend::{BackendKind, Detector};
use crate::detect::result::{DetectionOutcome, FaceRegion, RawOutput};
use crate::RunError;

/// Default minimum face confidence kept by the landmark adapter.
pub const DEFAULT_LANDMARK_MIN_SCORE: f32 = 0.5;

const BASE_FACE_CONFIDENCE: f32 = 0.8;
const MAX_FACE_CONFIDENCE: f32 = 0.95;
const TINY_FACE_AREA: u64 = 1000;
const SMALL_FACE_AREA: u64 = 5000;

/// A face as reported by a locator. `score` is absent when the locator has no
/// calibrated confidence.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LocatedFace {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    #[serde(default, alias = "confidence")]
    pub score: Option<f32>,
}

/// Port to a face locator (landmark/face-detection model or service).
///
/// Returning no faces is a valid answer for images without a frontal view.
pub trait FaceLocator: Send {
    fn describe(&self) -> String;

    fn locate(&mut self, image_path: &Path) -> Result<Vec<LocatedFace>>;
}

/// Size-based confidence for faces without a native score.
///
/// Base 0.8, scaled by 0.6 below 1000 px² and by 0.8 below 5000 px², capped at 0.95.
pub fn estimate_face_confidence(w: u32, h: u32) -> f32 {
    let area = u64::from(w) * u64::from(h);
    let mut confidence = BASE_FACE_CONFIDENCE;
    if area < TINY_FACE_AREA {
        confidence *= 0.6;
    } else if area < SMALL_FACE_AREA {
        confidence *= 0.8;
    }
    confidence.min(MAX_FACE_CONFIDENCE)
}

/// Landmark-based detector: one confidence per face region.
pub struct LandmarkDetector<F: FaceLocator> {
    locator: F,
    version: String,
    min_score: f32,
}

impl<F: FaceLocator> LandmarkDetector<F> {
    pub fn new(locator: F) -> Self {
        let version = locator.describe();
        Self {
            locator,
            version,
            min_score: DEFAULT_LANDMARK_MIN_SCORE,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }
}

impl<F: FaceLocator> Detector for LandmarkDetector<F> {
    fn name(&self) -> &str {
        "landmark"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Landmark
    }

    fn model_info(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "version": self.version,
            "kind": self.kind().as_str(),
            "task": "person_detection_via_faces",
            "min_score": self.min_score,
        })
    }

    fn detect(&mut self, image_path: &Path) -> Result<DetectionOutcome> {
        let start = Instant::now();
        let located = self
            .locator
            .locate(image_path)
            .map_err(|e| anyhow!(RunError::Backend(format!("{:#}", e))))?;
        let faces_located = u32::try_from(located.len())?;
        let faces: Vec<FaceRegion> = located
            .into_iter()
            .map(|f| FaceRegion {
                confidence: f.score.unwrap_or_else(|| estimate_face_confidence(f.w, f.h)),
                x: f.x,
                y: f.y,
                w: f.w,
                h: f.h,
            })
            .filter(|f| f.confidence >= self.min_score)
            .collect();
        let confidences = faces.iter().map(|f| f.confidence).collect();
        DetectionOutcome::new(
            confidences,
            RawOutput::Landmark {
                faces,
                faces_located,
            },
            start.elapsed(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct FaceServiceResponse {
    #[serde(default)]
    faces: Vec<LocatedFace>,
}

/// HTTP client for a face-detection sidecar.
///
/// Posts the raw image bytes to `endpoint?detector=<name>` and expects
/// `{"faces": [{"x":..,"y":..,"w":..,"h":..,"confidence":..}]}`.
/// A failed request is retried once with the fallback detector, if set.
pub struct HttpFaceLocator {
    agent: ureq::Agent,
    endpoint: Url,
    detector: String,
    fallback: Option<String>,
}

impl HttpFaceLocator {
    pub fn new(endpoint: &str, detector: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("parse face service endpoint")?;
        match endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported face service scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            endpoint,
            detector: detector.to_string(),
            fallback: None,
        })
    }

    pub fn with_fallback(mut self, fallback: Option<&str>) -> Self {
        self.fallback = fallback.map(str::to_string);
        self
    }

    fn request(&self, detector: &str, bytes: &[u8]) -> Result<Vec<LocatedFace>> {
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .query("detector", detector)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(bytes)
            .map_err(|e| anyhow!("face service request failed: {}", e))?;
        let parsed: FaceServiceResponse = response
            .into_json()
            .context("face service returned malformed JSON")?;
        Ok(parsed.faces)
    }
}

/// Try `primary`; on failure retry once with `fallback` unless it names the
/// same detector. The primary error is kept as context when both fail.
fn locate_with_fallback<T>(
    primary: &str,
    fallback: Option<&str>,
    mut attempt: impl FnMut(&str) -> Result<T>,
) -> Result<T> {
    match attempt(primary) {
        Ok(found) => Ok(found),
        Err(e) => match fallback.filter(|f| *f != primary) {
            Some(fallback) => {
                log::warn!(
                    "face detector {} failed ({:#}); retrying with {}",
                    primary,
                    e,
                    fallback
                );
                attempt(fallback).with_context(|| {
                    format!("{} failed: {:#}; fallback {} also failed", primary, e, fallback)
                })
            }
            None => Err(e),
        },
    }
}

impl FaceLocator for HttpFaceLocator {
    fn describe(&self) -> String {
        self.detector.clone()
    }

    fn locate(&mut self, image_path: &Path) -> Result<Vec<LocatedFace>> {
        let bytes = std::fs::read(image_path)
            .with_context(|| format!("failed to read image {}", image_path.display()))?;
        locate_with_fallback(&self.detector, self.fallback.as_deref(), |detector| {
            self.request(detector, &bytes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLocator(Vec<LocatedFace>);

    impl FaceLocator for FixedLocator {
        fn describe(&self) -> String {
            "fixed".to_string()
        }

        fn locate(&mut self, _image_path: &Path) -> Result<Vec<LocatedFace>> {
            Ok(self.0.clone())
        }
    }

    fn face(w: u32, h: u32, score: Option<f32>) -> LocatedFace {
        LocatedFace {
            x: 0,
            y: 0,
            w,
            h,
            score,
        }
    }

    #[test]
    fn size_heuristic_scales_small_faces_down() {
        assert!((estimate_face_confidence(100, 100) - 0.8).abs() < 1e-6);
        assert!((estimate_face_confidence(50, 50) - 0.64).abs() < 1e-6);
        assert!((estimate_face_confidence(20, 20) - 0.48).abs() < 1e-6);
    }

    #[test]
    fn no_frontal_face_is_zero_detections() {
        let mut detector = LandmarkDetector::new(FixedLocator(vec![]));
        let outcome = detector.detect(Path::new("side.jpg")).unwrap();
        assert_eq!(outcome.persons_detected, 0);
        assert!(outcome.stats().is_none());
    }

    #[test]
    fn faces_below_minimum_are_dropped() {
        let faces = vec![face(100, 100, None), face(20, 20, None), face(10, 10, Some(0.9))];
        let mut detector = LandmarkDetector::new(FixedLocator(faces));
        let outcome = detector.detect(Path::new("group.jpg")).unwrap();
        assert_eq!(outcome.persons_detected, 2);
        match outcome.raw_output {
            RawOutput::Landmark { faces_located, .. } => assert_eq!(faces_located, 3),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn service_response_accepts_confidence_alias() {
        let parsed: FaceServiceResponse =
            serde_json::from_str(r#"{"faces":[{"x":1,"y":2,"w":30,"h":40,"confidence":0.7}]}"#)
                .unwrap();
        assert_eq!(parsed.faces[0].score, Some(0.7));
    }

    #[test]
    fn failing_detector_is_retried_with_fallback() {
        let mut tried = Vec::new();
        let faces = locate_with_fallback("retinaface", Some("opencv"), |detector| {
            tried.push(detector.to_string());
            if detector == "opencv" {
                Ok(vec![face(100, 100, None)])
            } else {
                Err(anyhow!("model not installed"))
            }
        })
        .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(tried, vec!["retinaface", "opencv"]);
    }

    #[test]
    fn fallback_equal_to_primary_is_not_retried() {
        let mut calls = 0;
        let err = locate_with_fallback("opencv", Some("opencv"), |_| -> Result<Vec<LocatedFace>> {
            calls += 1;
            Err(anyhow!("service down"))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(format!("{:#}", err).contains("service down"));
    }

    #[test]
    fn both_failures_are_reported() {
        let err = locate_with_fallback("mtcnn", Some("opencv"), |detector| -> Result<Vec<LocatedFace>> {
            Err(anyhow!("{} unavailable", detector))
        })
        .unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("mtcnn unavailable"));
        assert!(message.contains("opencv unavailable"));
    }

    #[test]
    fn no_fallback_returns_first_error() {
        let mut calls = 0;
        let result = locate_with_fallback("mtcnn", None, |_| -> Result<Vec<LocatedFace>> {
            calls += 1;
            Err(anyhow!("boom"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn rejects_non_http_endpoint() {
        assert!(HttpFaceLocator::new("ftp://faces", "opencv", Duration::from_secs(1)).is_err());
    }
}
