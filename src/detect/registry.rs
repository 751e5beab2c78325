use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::backend::Detector;
use super::backends::{HttpFaceLocator, LandmarkDetector, LlmCountDetector, OllamaClient, StubDetector};
use crate::config::BackendSettings;
use crate::RunError;

type DetectorFactory = Box<dyn Fn(&BackendSettings) -> Result<Box<dyn Detector>> + Send + Sync>;

/// Dispatch table from backend identifier to detector factory.
///
/// Resolution happens once at run start; the resulting detector is owned by the
/// caller for the whole run.
pub struct DetectorRegistry {
    factories: HashMap<String, DetectorFactory>,
    aliases: HashMap<String, String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Registry with the built-in backends: `region`, `landmark`, `llm`, `stub`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("region", &["ultralytics", "yolo"], build_region);
        registry.register("landmark", &["deepface", "face"], |settings| {
            let locator = HttpFaceLocator::new(
                &settings.face_endpoint,
                &settings.face_detector,
                settings.request_timeout,
            )?
            .with_fallback(settings.face_fallback_detector.as_deref());
            let mut detector = LandmarkDetector::new(locator);
            if let Some(min_score) = settings.min_score {
                detector = detector.with_min_score(min_score);
            }
            Ok(Box::new(detector))
        });
        registry.register("llm", &["ollama", "ollama-gemma3"], |settings| {
            let client = OllamaClient::connect(
                &settings.ollama_host,
                &settings.ollama_model,
                settings.request_timeout,
            )?;
            Ok(Box::new(LlmCountDetector::new(client)))
        });
        registry.register("stub", &[], |_| Ok(Box::new(StubDetector::new())));
        registry
    }

    /// Register a factory under a canonical name plus aliases. Re-registering a
    /// name replaces the previous factory.
    pub fn register<F>(&mut self, name: &str, aliases: &[&str], factory: F)
    where
        F: Fn(&BackendSettings) -> Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        let name = name.to_lowercase();
        for alias in aliases {
            self.aliases.insert(alias.to_lowercase(), name.clone());
        }
        self.factories.insert(name, Box::new(factory));
    }

    /// Canonical name for an identifier or alias.
    pub fn resolve_name(&self, identifier: &str) -> Result<String> {
        let key = identifier.trim().to_lowercase();
        if self.factories.contains_key(&key) {
            return Ok(key);
        }
        if let Some(name) = self.aliases.get(&key) {
            return Ok(name.clone());
        }
        Err(anyhow!(RunError::Input(format!(
            "unknown backend '{}'; available: {}",
            identifier,
            self.list().join(", ")
        ))))
    }

    /// Build the detector for `settings.name`.
    pub fn create(&self, settings: &BackendSettings) -> Result<Box<dyn Detector>> {
        let name = self.resolve_name(&settings.name)?;
        let factory = self
            .factories
            .get(&name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        log::info!("initializing {} backend", name);
        factory(settings)
    }

    /// Registered canonical names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(feature = "backend-tract")]
fn build_region(settings: &BackendSettings) -> Result<Box<dyn Detector>> {
    use super::backends::{RegionDetector, TractYoloModel};

    let model = TractYoloModel::load(&settings.model_path, settings.input_size)?;
    let detector = match settings.min_score {
        // the raw cut must not hide boxes the adapter would keep
        Some(min_score) => {
            RegionDetector::new(model.with_score_threshold(min_score)).with_min_score(min_score)
        }
        None => RegionDetector::new(model),
    };
    Ok(Box::new(detector))
}

#[cfg(not(feature = "backend-tract"))]
fn build_region(_settings: &BackendSettings) -> Result<Box<dyn Detector>> {
    Err(anyhow!(RunError::Input(
        "region backend requires the backend-tract feature".to_string()
    )))
}
