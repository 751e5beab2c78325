use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::RunError;

pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Bmp,
    Tiff,
    Webp,
}

impl ImageFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "bmp" => Some(Self::Bmp),
            "tif" | "tiff" => Some(Self::Tiff),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

/// One image of the corpus, tagged with its classification folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub classification: String,
    pub format: ImageFormat,
}

impl ImageRecord {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOrder {
    /// Sorted by (classification, file name).
    Lexical,
    /// Uniform shuffle of the lexical enumeration. Reproducible when seeded.
    Randomized { seed: Option<u64> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SamplingOptions {
    pub classifications: Option<Vec<String>>,
    pub max_images: Option<usize>,
    pub order: SampleOrder,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            classifications: None,
            max_images: None,
            order: SampleOrder::Lexical,
        }
    }
}

/// Enumerates `<root>/<classification>/<image>` files.
pub struct DataLoader {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DataLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Replace the extension allowlist. Matching stays case-insensitive.
    /// Extensions without a known decoder are ignored.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn enumerate(&self, options: &SamplingOptions) -> Result<Vec<ImageRecord>> {
        if !self.root.is_dir() {
            return Err(anyhow!(RunError::Input(format!(
                "data directory {} does not exist or is not a directory",
                self.root.display()
            ))));
        }

        let mut records = Vec::new();
        for folder in self.classification_dirs()? {
            let label = match folder.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if let Some(filter) = &options.classifications {
                if !filter.iter().any(|wanted| wanted == &label) {
                    continue;
                }
            }
            self.collect_images(&folder, &label, &mut records);
        }

        if records.is_empty() {
            return Err(anyhow!(RunError::Input(format!(
                "no images matching {:?} found under {}",
                self.extensions,
                self.root.display()
            ))));
        }

        records.sort_by(|a, b| {
            a.classification
                .cmp(&b.classification)
                .then_with(|| a.filename().cmp(&b.filename()))
        });

        if let SampleOrder::Randomized { seed } = options.order {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            records.shuffle(&mut rng);
        }

        if let Some(max) = options.max_images {
            records.truncate(max);
        }

        Ok(records)
    }

    fn classification_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("read data directory {}", self.root.display()))?;
        let mut dirs = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    if path.is_dir() {
                        dirs.push(path);
                    }
                }
                Err(e) => log::warn!("skipping unreadable entry in {}: {}", self.root.display(), e),
            }
        }
        Ok(dirs)
    }

    fn collect_images(&self, folder: &Path, label: &str, out: &mut Vec<ImageRecord>) {
        let entries = match std::fs::read_dir(folder) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("skipping unreadable folder {}: {}", folder.display(), e);
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("skipping unreadable entry in {}: {}", folder.display(), e);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let ext = match path.extension() {
                Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
                None => continue,
            };
            if !self.extensions.iter().any(|allowed| allowed == &ext) {
                continue;
            }
            match ImageFormat::from_extension(&ext) {
                Some(format) => out.push(ImageRecord {
                    path,
                    classification: label.to_string(),
                    format,
                }),
                None => log::debug!("no decoder for {}, skipping", path.display()),
            }
        }
    }
}

/// Per-label image counts, ordered by label.
pub fn class_counts(records: &[ImageRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.classification.clone()).or_insert(0) += 1;
    }
    counts
}
