use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use url::Url;

use crate::detect::backend::{BackendKind, Detector};
use crate::detect::result::{DetectionOutcome, RawOutput};
use crate::RunError;

/// Upper bound on a parsed person count.
pub const MAX_PARSED_PERSONS: u32 = 50;

const MAX_IMAGE_EDGE: u32 = 1024;
const JPEG_QUALITY: u8 = 85;
const PULL_TIMEOUT: Duration = Duration::from_secs(300);

pub const COUNT_PROMPT: &str = "Look at this image carefully and count the number of people you can see. \
Give me ONLY a number as your answer - nothing else. If you see no people, answer 0.";

const HEDGES: &[&str] = &[
    "unsure",
    "uncertain",
    "difficult",
    "hard to tell",
    "maybe",
    "possibly",
];
const ASSERTIONS: &[&str] = &["clearly", "obviously", "definitely", "certain"];

/// Request sent to a vision-language model.
#[derive(Clone, Debug, PartialEq)]
pub struct VisionPrompt {
    pub prompt: String,
    /// Base64-encoded JPEG.
    pub image_base64: String,
}

/// Port to a vision-language model that answers in free text.
pub trait VisionLanguageClient: Send {
    fn model(&self) -> &str;

    fn generate(&mut self, request: &VisionPrompt) -> Result<String>;
}

fn integer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b(\d+)\b").expect("static regex"))
}

fn bare_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*\d+\s*$").expect("static regex"))
}

/// First standalone integer in the answer, clamped to `0..=50`. No integer means 0.
pub fn parse_person_count(answer: &str) -> u32 {
    integer_pattern()
        .captures(answer)
        .and_then(|caps| caps.get(1))
        .map(|m| {
            m.as_str()
                .parse::<u64>()
                .map(|n| n.min(u64::from(MAX_PARSED_PERSONS)) as u32)
                .unwrap_or(MAX_PARSED_PERSONS)
        })
        .unwrap_or(0)
}

/// Deterministic confidence for an uncalibrated answer.
///
/// Rules, first match wins: empty 0.3, bare number 0.85, hedge 0.4,
/// assertion 0.9, longer than 50 chars 0.6, otherwise 0.7.
pub fn synthesize_confidence(answer: &str) -> f32 {
    let trimmed = answer.trim();
    if trimmed.is_empty() {
        return 0.3;
    }
    if bare_number_pattern().is_match(trimmed) {
        return 0.85;
    }
    let lower = trimmed.to_lowercase();
    if HEDGES.iter().any(|w| lower.contains(w)) {
        return 0.4;
    }
    if ASSERTIONS.iter().any(|w| lower.contains(w)) {
        return 0.9;
    }
    if trimmed.chars().count() > 50 {
        return 0.6;
    }
    0.7
}

/// Decode, downscale to at most 1024 px on the long edge, re-encode as JPEG, base64.
pub fn encode_image_base64(image_path: &Path) -> Result<String> {
    let image = image::open(image_path)
        .with_context(|| format!("failed to decode image {}", image_path.display()))?;
    let image = if image.width() > MAX_IMAGE_EDGE || image.height() > MAX_IMAGE_EDGE {
        image.thumbnail(MAX_IMAGE_EDGE, MAX_IMAGE_EDGE)
    } else {
        image
    };
    let rgb = image.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .context("failed to encode JPEG")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
}

fn backend_error(err: anyhow::Error) -> anyhow::Error {
    anyhow!(RunError::Backend(format!("{:#}", err)))
}

/// Language-model-based detector.
///
/// The model gives a count, not scores, so every counted person carries the
/// same synthesized confidence from `synthesize_confidence`.
pub struct LlmCountDetector<C: VisionLanguageClient> {
    client: C,
    prompt: String,
}

impl<C: VisionLanguageClient> LlmCountDetector<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            prompt: COUNT_PROMPT.to_string(),
        }
    }

    /// Interpret an answer without calling the model.
    pub fn interpret(&self, answer: &str, latency: Duration) -> Result<DetectionOutcome> {
        let count = parse_person_count(answer);
        let confidence = synthesize_confidence(answer);
        DetectionOutcome::new(
            vec![confidence; count as usize],
            RawOutput::LanguageModel {
                answer: answer.to_string(),
                model: self.client.model().to_string(),
                synthesized_confidence: confidence,
            },
            latency,
        )
    }
}

impl<C: VisionLanguageClient> Detector for LlmCountDetector<C> {
    fn name(&self) -> &str {
        "llm"
    }

    fn version(&self) -> &str {
        self.client.model()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::LanguageModel
    }

    fn model_info(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "version": self.version(),
            "kind": self.kind().as_str(),
            "task": "person_count_via_vision_language_model",
            "confidence": "synthesized",
        })
    }

    fn detect(&mut self, image_path: &Path) -> Result<DetectionOutcome> {
        let start = Instant::now();
        let request = VisionPrompt {
            prompt: self.prompt.clone(),
            image_base64: encode_image_base64(image_path).map_err(backend_error)?,
        };
        let answer = self.client.generate(&request).map_err(backend_error)?;
        self.interpret(answer.trim(), start.elapsed())
    }
}

// ----------------------------------------------------------------------------
// Ollama client
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: [&'a str; 1],
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Client for an Ollama server.
///
/// Construction checks connectivity and model availability (pulling the model
/// when missing), so a run fails fast before the first image.
pub struct OllamaClient {
    agent: ureq::Agent,
    host: Url,
    model: String,
}

impl OllamaClient {
    pub fn connect(host: &str, model: &str, timeout: Duration) -> Result<Self> {
        let host = Url::parse(host).context("parse ollama host")?;
        match host.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported ollama scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let client = Self {
            agent,
            host,
            model: model.to_string(),
        };
        let available = client.list_models()?;
        log::info!("ollama reachable at {}", client.host);
        if !available.iter().any(|m| m == model) {
            log::warn!("ollama model {} not present, pulling", model);
            if let Err(e) = client.pull_model() {
                log::warn!("ollama pull for {} failed: {:#}", model, e);
            }
        }
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.host
            .join(path)
            .with_context(|| format!("build ollama url for {}", path))
    }

    fn list_models(&self) -> Result<Vec<String>> {
        let url = self.endpoint("/api/tags")?;
        let tags: TagsResponse = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| anyhow!("ollama not reachable at {}: {}", self.host, e))?
            .into_json()
            .context("ollama /api/tags returned malformed JSON")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn pull_model(&self) -> Result<()> {
        let url = self.endpoint("/api/pull")?;
        ureq::AgentBuilder::new()
            .timeout(PULL_TIMEOUT)
            .build()
            .post(url.as_str())
            .send_json(serde_json::json!({ "name": self.model, "stream": false }))
            .map_err(|e| anyhow!("ollama pull failed: {}", e))?;
        log::info!("ollama model {} pulled", self.model);
        Ok(())
    }
}

impl VisionLanguageClient for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn generate(&mut self, request: &VisionPrompt) -> Result<String> {
        let url = self.endpoint("/api/generate")?;
        let body = GenerateRequest {
            model: &self.model,
            prompt: &request.prompt,
            images: [request.image_base64.as_str()],
            stream: false,
            options: GenerateOptions {
                temperature: 0.1,
                top_p: 0.9,
                num_predict: 10,
            },
        };
        let response: GenerateResponse = self
            .agent
            .post(url.as_str())
            .send_json(&body)
            .map_err(|e| anyhow!("ollama generate failed: {}", e))?
            .into_json()
            .context("ollama /api/generate returned malformed JSON")?;
        Ok(response.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedClient(String);

    impl VisionLanguageClient for CannedClient {
        fn model(&self) -> &str {
            "canned"
        }

        fn generate(&mut self, _request: &VisionPrompt) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn parses_first_integer_and_clamps() {
        assert_eq!(parse_person_count("3"), 3);
        assert_eq!(parse_person_count("I see 2 people and 1 dog"), 2);
        assert_eq!(parse_person_count("nobody here"), 0);
        assert_eq!(parse_person_count("120"), 50);
        assert_eq!(parse_person_count("99999999999999999999999"), 50);
    }

    #[test]
    fn confidence_rules_are_deterministic() {
        assert_eq!(synthesize_confidence(""), 0.3);
        assert_eq!(synthesize_confidence(" 4 "), 0.85);
        assert_eq!(synthesize_confidence("maybe 3"), 0.4);
        assert_eq!(synthesize_confidence("I am uncertain, 2"), 0.4);
        assert_eq!(synthesize_confidence("clearly 2"), 0.9);
        assert_eq!(
            synthesize_confidence("There are two adults standing near the left window frame"),
            0.6
        );
        assert_eq!(synthesize_confidence("2 people"), 0.7);
    }

    #[test]
    fn every_counted_person_gets_the_synthesized_score() {
        let detector = LlmCountDetector::new(CannedClient("3".into()));
        let outcome = detector.interpret("3", Duration::ZERO).unwrap();
        assert_eq!(outcome.persons_detected, 3);
        assert_eq!(outcome.confidences, vec![0.85; 3]);
        let stats = outcome.stats().unwrap();
        assert_eq!(stats.avg, 0.85);
    }

    #[test]
    fn zero_count_has_no_confidences() {
        let detector = LlmCountDetector::new(CannedClient("0".into()));
        let outcome = detector.interpret("0", Duration::ZERO).unwrap();
        assert_eq!(outcome.persons_detected, 0);
        assert!(outcome.stats().is_none());
    }

    #[test]
    fn detect_encodes_image_and_interprets_answer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        image::RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();

        let mut detector = LlmCountDetector::new(CannedClient(" 1\n".into()));
        let outcome = detector.detect(&path).unwrap();
        assert_eq!(outcome.persons_detected, 1);
        assert_eq!(detector.version(), "canned");
    }

    #[test]
    fn rejects_non_http_host() {
        assert!(OllamaClient::connect("unix:///tmp/ollama", "gemma3:4b", Duration::from_secs(1)).is_err());
    }
}
