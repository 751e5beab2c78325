mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::{BackendKind, Detector};
pub use backends::StubDetector;
pub use registry::DetectorRegistry;
pub use result::{BoxDetection, ConfidenceStats, DetectionOutcome, FaceRegion, RawOutput};
