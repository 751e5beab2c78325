pub mod landmark;
pub mod llm;
pub mod region;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use landmark::{FaceLocator, HttpFaceLocator, LandmarkDetector, LocatedFace};
pub use llm::{LlmCountDetector, OllamaClient, VisionLanguageClient, VisionPrompt};
pub use region::{BoxModel, RegionDetector};
pub use stub::StubDetector;

#[cfg(feature = "backend-tract")]
pub use tract::TractYoloModel;
