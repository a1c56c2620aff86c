//! Core type definitions shared across the workspace.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Learning paradigm of a run.
///
/// Decided once from the model before any dataset or loss is built and
/// threaded through every later decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Closed-set classification over class logits
    Classification,
    /// Open-set metric learning over normalized embeddings
    Metric,
}

impl TaskKind {
    /// Metric when the model exposes a positive embedding dimension,
    /// classification otherwise.
    pub fn from_embedding_size(embedding_size: Option<usize>) -> Self {
        match embedding_size {
            Some(size) if size > 0 => TaskKind::Metric,
            _ => TaskKind::Classification,
        }
    }

    /// Name of the per-epoch score for this task.
    pub fn score_name(&self) -> &'static str {
        match self {
            TaskKind::Classification => "acc",
            TaskKind::Metric => "precision",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Classification => write!(f, "classification"),
            TaskKind::Metric => write!(f, "metric"),
        }
    }
}

/// Represents an image sample with its label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Index into the label vocabulary
    pub label: usize,
}

impl ImageSample {
    /// Creates a new image sample
    pub fn new(path: impl Into<PathBuf>, label: usize) -> Self {
        Self {
            path: path.into(),
            label,
        }
    }
}

/// Which part of a manifest a dataset is built from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SplitMode {
    /// Leading `ratio` share of every class, with augmentation
    Train,
    /// Remaining share of every class
    Val,
    /// The whole manifest
    Test,
}

impl SplitMode {
    /// Whether samples from this split get random augmentation.
    pub fn is_training(&self) -> bool {
        matches!(self, SplitMode::Train)
    }
}

impl std::fmt::Display for SplitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitMode::Train => write!(f, "train"),
            SplitMode::Val => write!(f, "val"),
            SplitMode::Test => write!(f, "test"),
        }
    }
}

/// Order in which training samples are drawn each epoch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    /// Seeded permutation of all samples
    #[default]
    Normal,
    /// Class-balanced draws with replacement
    Balance,
}

/// Input image dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDimensions {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageDimensions {
    /// RGB image of the given size
    pub fn rgb(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            channels: 3,
        }
    }

    /// Number of floats in one CHW image
    pub fn num_values(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// ImageNet channel means used for input normalization
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations used for input normalization
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_from_embedding_size() {
        assert_eq!(TaskKind::from_embedding_size(Some(128)), TaskKind::Metric);
        assert_eq!(TaskKind::from_embedding_size(Some(0)), TaskKind::Classification);
        assert_eq!(TaskKind::from_embedding_size(None), TaskKind::Classification);
    }

    #[test]
    fn test_task_kind_display() {
        assert_eq!(TaskKind::Classification.to_string(), "classification");
        assert_eq!(TaskKind::Metric.score_name(), "precision");
    }

    #[test]
    fn test_sampler_kind_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            sampler: SamplerKind,
        }
        let w: Wrapper = toml::from_str("sampler = \"balance\"").unwrap();
        assert_eq!(w.sampler, SamplerKind::Balance);
    }

    #[test]
    fn test_image_dimensions() {
        let dims = ImageDimensions::rgb(224, 200);
        assert_eq!(dims.num_values(), 3 * 224 * 200);
    }
}
