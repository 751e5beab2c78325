use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dataset::{SampleOrder, SamplingOptions};
use crate::RunError;

const DEFAULT_DB_PATH: &str = "detection_runs.db";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_THRESHOLD: f32 = 0.5;
const DEFAULT_MODEL_PATH: &str = "yolov8n.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_FACE_ENDPOINT: &str = "http://127.0.0.1:5005/faces";
const DEFAULT_FACE_DETECTOR: &str = "opencv";
const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "gemma3:4b";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MONITOR_INTERVAL_MS: u64 = 500;

#[derive(Debug, Deserialize, Default)]
struct RunConfigFile {
    data_dir: Option<PathBuf>,
    db_path: Option<String>,
    threshold: Option<f32>,
    max_images: Option<usize>,
    classifications: Option<Vec<String>>,
    randomize: Option<bool>,
    seed: Option<u64>,
    run_name: Option<String>,
    job_id: Option<String>,
    image_timeout_secs: Option<f64>,
    pause_between_images_ms: Option<u64>,
    backend: Option<BackendConfigFile>,
    monitor: Option<MonitorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    name: Option<String>,
    model_path: Option<String>,
    input_size: Option<u32>,
    min_score: Option<f32>,
    face_endpoint: Option<String>,
    face_detector: Option<String>,
    /// Empty string disables the fallback.
    face_fallback_detector: Option<String>,
    ollama_host: Option<String>,
    ollama_model: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    interval_ms: Option<u64>,
    gpu: Option<bool>,
}

/// Backend selector plus backend-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSettings {
    /// Backend identifier or alias (`region`, `landmark`, `llm`, `stub`, ...).
    pub name: String,
    pub model_path: String,
    pub input_size: u32,
    /// Minimum per-detection score kept by the adapter. Backend default when absent.
    pub min_score: Option<f32>,
    pub face_endpoint: String,
    pub face_detector: String,
    /// Retried once when `face_detector` fails and differs from it.
    pub face_fallback_detector: Option<String>,
    pub ollama_host: String,
    pub ollama_model: String,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_BACKEND.to_string(),
            model_path: DEFAULT_MODEL_PATH.to_string(),
            input_size: DEFAULT_INPUT_SIZE,
            min_score: None,
            face_endpoint: DEFAULT_FACE_ENDPOINT.to_string(),
            face_detector: DEFAULT_FACE_DETECTOR.to_string(),
            face_fallback_detector: Some(DEFAULT_FACE_DETECTOR.to_string()),
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSettings {
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    pub gpu: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS),
            gpu: true,
        }
    }
}

/// Everything a run needs. Serialized into the run's configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub data_dir: PathBuf,
    pub db_path: String,
    pub backend: BackendSettings,
    /// Average confidence strictly below this marks a result uncertain.
    pub threshold: f32,
    pub max_images: Option<usize>,
    pub classifications: Option<Vec<String>>,
    pub randomize: bool,
    pub seed: Option<u64>,
    pub run_name: Option<String>,
    pub job_id: Option<String>,
    #[serde(with = "option_duration_secs")]
    pub image_timeout: Option<Duration>,
    #[serde(with = "duration_millis")]
    pub pause_between_images: Duration,
    pub monitor: MonitorSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            db_path: DEFAULT_DB_PATH.to_string(),
            backend: BackendSettings::default(),
            threshold: DEFAULT_THRESHOLD,
            max_images: None,
            classifications: None,
            randomize: true,
            seed: None,
            run_name: None,
            job_id: None,
            image_timeout: None,
            pause_between_images: Duration::ZERO,
            monitor: MonitorSettings::default(),
        }
    }
}

impl RunConfig {
    /// Load from the JSON file named by `DETECT_CONFIG` (optional), then apply
    /// `DETECT_*` environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DETECT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RunConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let backend_defaults = BackendSettings::default();
        let backend = file.backend.unwrap_or_default();
        let monitor = file.monitor.unwrap_or_default();
        let image_timeout = file
            .image_timeout_secs
            .map(timeout_from_secs)
            .transpose()?;
        Ok(Self {
            data_dir: file.data_dir.unwrap_or(defaults.data_dir),
            db_path: file.db_path.unwrap_or(defaults.db_path),
            backend: BackendSettings {
                name: backend.name.unwrap_or(backend_defaults.name),
                model_path: backend.model_path.unwrap_or(backend_defaults.model_path),
                input_size: backend.input_size.unwrap_or(backend_defaults.input_size),
                min_score: backend.min_score,
                face_endpoint: backend
                    .face_endpoint
                    .unwrap_or(backend_defaults.face_endpoint),
                face_detector: backend
                    .face_detector
                    .unwrap_or(backend_defaults.face_detector),
                face_fallback_detector: match backend.face_fallback_detector {
                    Some(name) if name.trim().is_empty() => None,
                    Some(name) => Some(name),
                    None => backend_defaults.face_fallback_detector,
                },
                ollama_host: backend.ollama_host.unwrap_or(backend_defaults.ollama_host),
                ollama_model: backend
                    .ollama_model
                    .unwrap_or(backend_defaults.ollama_model),
                request_timeout: backend
                    .request_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(backend_defaults.request_timeout),
            },
            threshold: file.threshold.unwrap_or(defaults.threshold),
            max_images: file.max_images,
            classifications: file.classifications,
            randomize: file.randomize.unwrap_or(defaults.randomize),
            seed: file.seed,
            run_name: file.run_name,
            job_id: file.job_id,
            image_timeout,
            pause_between_images: file
                .pause_between_images_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.pause_between_images),
            monitor: MonitorSettings {
                interval: monitor
                    .interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.monitor.interval),
                gpu: monitor.gpu.unwrap_or(defaults.monitor.gpu),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_nonempty("DETECT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_nonempty("DETECT_DB_PATH") {
            self.db_path = path;
        }
        if let Some(name) = env_nonempty("DETECT_BACKEND") {
            self.backend.name = name;
        }
        if let Some(threshold) = env_nonempty("DETECT_THRESHOLD") {
            self.threshold = threshold
                .parse()
                .map_err(|_| anyhow!("DETECT_THRESHOLD must be a number between 0 and 1"))?;
        }
        if let Some(max) = env_nonempty("DETECT_MAX_IMAGES") {
            self.max_images = Some(
                max.parse()
                    .map_err(|_| anyhow!("DETECT_MAX_IMAGES must be a positive integer"))?,
            );
        }
        if let Some(labels) = env_nonempty("DETECT_CLASSIFICATIONS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.classifications = Some(parsed);
            }
        }
        if let Some(randomize) = env_nonempty("DETECT_RANDOMIZE") {
            self.randomize = parse_bool(&randomize)
                .ok_or_else(|| anyhow!("DETECT_RANDOMIZE must be true or false"))?;
        }
        if let Some(seed) = env_nonempty("DETECT_SEED") {
            self.seed = Some(
                seed.parse()
                    .map_err(|_| anyhow!("DETECT_SEED must be an unsigned integer"))?,
            );
        }
        if let Some(name) = env_nonempty("DETECT_RUN_NAME") {
            self.run_name = Some(name);
        }
        if let Some(job_id) = env_nonempty("DETECT_JOB_ID") {
            self.job_id = Some(job_id);
        }
        if let Some(host) = env_nonempty("DETECT_OLLAMA_HOST") {
            self.backend.ollama_host = host;
        }
        if let Some(model) = env_nonempty("DETECT_OLLAMA_MODEL") {
            self.backend.ollama_model = model;
        }
        if let Some(endpoint) = env_nonempty("DETECT_FACE_ENDPOINT") {
            self.backend.face_endpoint = endpoint;
        }
        if let Some(path) = env_nonempty("DETECT_MODEL_PATH") {
            self.backend.model_path = path;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(anyhow!(RunError::Input(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            ))));
        }
        if let Some(min_score) = self.backend.min_score {
            if !(0.0..=1.0).contains(&min_score) {
                return Err(anyhow!(RunError::Input(format!(
                    "backend min_score must be within [0, 1], got {}",
                    min_score
                ))));
            }
        }
        if self.max_images == Some(0) {
            return Err(anyhow!(RunError::Input(
                "max_images must be greater than zero".to_string()
            )));
        }
        if self.monitor.interval.is_zero() {
            return Err(anyhow!(RunError::Input(
                "monitor interval must be greater than zero".to_string()
            )));
        }
        if self.backend.name.trim().is_empty() {
            return Err(anyhow!(RunError::Input("backend must be set".to_string())));
        }
        Ok(())
    }

    /// DataLoader options derived from this config.
    pub fn sampling(&self) -> SamplingOptions {
        SamplingOptions {
            classifications: self.classifications.clone(),
            max_images: self.max_images,
            order: if self.randomize {
                SampleOrder::Randomized { seed: self.seed }
            } else {
                SampleOrder::Lexical
            },
        }
    }

    /// JSON snapshot stored with the run.
    pub fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Per-image timeout from seconds. Must be finite and positive.
pub fn timeout_from_secs(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(anyhow!(RunError::Input(format!(
            "image timeout must be a positive number of seconds, got {}",
            secs
        ))));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| {
        anyhow!(RunError::Input(format!(
            "image timeout {} is out of range: {}",
            secs, e
        )))
    })
}

fn read_config_file(path: &Path) -> Result<RunConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

mod option_duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }
}
