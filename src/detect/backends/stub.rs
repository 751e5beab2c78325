use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Instant;

use crate::detect::backend::{BackendKind, Detector};
use crate::detect::result::{DetectionOutcome, RawOutput};
use crate::RunError;

const MAX_STUB_PERSONS: u8 = 4;

/// Stub backend for dry runs and tests. Derives a stable outcome from the
/// SHA-256 of the image bytes, so the same file always yields the same result.
///
/// Empty files are rejected as a backend error.
#[derive(Default)]
pub struct StubDetector {
    calls: u64,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &str {
        "stub"
    }

    fn version(&self) -> &str {
        "sha256"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Stub
    }

    fn detect(&mut self, image_path: &Path) -> Result<DetectionOutcome> {
        let start = Instant::now();
        self.calls += 1;
        let bytes = std::fs::read(image_path)
            .with_context(|| format!("failed to read image {}", image_path.display()))
            .map_err(|e| anyhow!(RunError::Backend(format!("{:#}", e))))?;
        if bytes.is_empty() {
            return Err(anyhow!(RunError::Backend(format!(
                "empty image file {}",
                image_path.display()
            ))));
        }

        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        let persons = digest[0] % (MAX_STUB_PERSONS + 1);
        let confidences = (0..persons as usize)
            .map(|i| 0.30 + (digest[1 + i] as f32 / 255.0) * 0.69)
            .collect();

        DetectionOutcome::new(
            confidences,
            RawOutput::Stub {
                digest: hex::encode(digest),
            },
            start.elapsed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stub_is_deterministic_per_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"frame-bytes").unwrap();

        let mut backend = StubDetector::new();
        let first = backend.detect(file.path()).unwrap();
        let second = backend.detect(file.path()).unwrap();

        assert_eq!(first.confidences, second.confidences);
        assert_eq!(first.persons_detected, second.persons_detected);
        assert!(first.persons_detected <= MAX_STUB_PERSONS as u32);
        assert!(first.confidences.iter().all(|c| (0.3..=1.0).contains(c)));
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn stub_rejects_empty_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = StubDetector::new().detect(file.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::Backend(_))
        ));
    }
}
