//! Checkpoint files and best-model selection.
//!
//! A checkpoint is a pair of files sharing one stem: `<stem>.mpk` holds the
//! full-precision module record and `<stem>.json` holds the
//! [`CheckpointMeta`] needed to rebuild the module before loading it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::info;
use vision_core::{Error, Result};

use crate::model::{VisionNet, VisionNetConfig};

/// Which of the two per-epoch candidates a checkpoint holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Live,
    Shadow,
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Live => write!(f, "live"),
            ModelSource::Shadow => write!(f, "shadow"),
        }
    }
}

/// Scores of the live and shadow model after one epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochResult {
    pub live: f64,
    pub shadow: f64,
}

impl EpochResult {
    pub fn new(live: f64, shadow: f64) -> Self {
        Self { live, shadow }
    }

    /// The better of the two; the shadow wins ties
    pub fn candidate(&self) -> (ModelSource, f64) {
        if self.shadow >= self.live {
            (ModelSource::Shadow, self.shadow)
        } else {
            (ModelSource::Live, self.live)
        }
    }
}

/// Tracks the best score of the run
#[derive(Debug, Clone, Default)]
pub struct BestModelPolicy {
    best_score: f64,
    best: Option<(usize, ModelSource)>,
}

impl BestModelPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    /// Epoch and source of the current best checkpoint
    pub fn best(&self) -> Option<(usize, ModelSource)> {
        self.best
    }

    /// Returns the model to persist as the new best, if this epoch's
    /// candidate is strictly better than every earlier one
    pub fn observe(&mut self, epoch: usize, result: EpochResult) -> Option<ModelSource> {
        let (source, score) = result.candidate();
        if score > self.best_score {
            self.best_score = score;
            self.best = Some((epoch, source));
            Some(source)
        } else {
            None
        }
    }
}

/// The `_best`, `_last` and `_ema_last` stems of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    base: PathBuf,
}

impl CheckpointPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn best(&self) -> PathBuf {
        self.with_suffix("_best")
    }

    pub fn last(&self) -> PathBuf {
        self.with_suffix("_last")
    }

    pub fn ema_last(&self) -> PathBuf {
        self.with_suffix("_ema_last")
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.base.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }
}

/// Sidecar describing a saved module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: VisionNetConfig,
    pub backbone: String,
    pub labels: Vec<String>,
    pub epoch: usize,
    pub score: f64,
    pub source: ModelSource,
    pub saved_at: String,
}

impl CheckpointMeta {
    pub fn new(
        config: VisionNetConfig,
        backbone: impl Into<String>,
        labels: Vec<String>,
        epoch: usize,
        score: f64,
        source: ModelSource,
    ) -> Self {
        Self {
            config,
            backbone: backbone.into(),
            labels,
            epoch,
            score,
            source,
            saved_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Strips a `.mpk` or `.json` extension so either file names the checkpoint
pub fn checkpoint_stem(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mpk") | Some("json") => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

/// Writes `<stem>.mpk` and `<stem>.json`
pub fn save_checkpoint<B: Backend, M: Module<B>>(
    model: &M,
    path: &Path,
    meta: &CheckpointMeta,
) -> Result<()> {
    let stem = checkpoint_stem(path);
    if let Some(parent) = stem.parent() {
        fs::create_dir_all(parent)?;
    }

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model.clone().save_file(&stem, &recorder)?;
    fs::write(stem.with_extension("json"), serde_json::to_string_pretty(meta)?)?;

    info!(
        "Saved {} model of epoch {} ({:.4}) to {}",
        meta.source,
        meta.epoch,
        meta.score,
        stem.display()
    );
    Ok(())
}

/// Rebuilds a [`VisionNet`] from its sidecar and loads its record
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(VisionNet<B>, CheckpointMeta)> {
    let stem = checkpoint_stem(path);
    let meta_path = stem.with_extension("json");
    let record_path = stem.with_extension("mpk");
    for required in [&meta_path, &record_path] {
        if !required.exists() {
            return Err(Error::NotFound(format!(
                "Checkpoint file not found: {}",
                required.display()
            )));
        }
    }

    let meta: CheckpointMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model = meta
        .config
        .init::<B>(device)
        .load_file(&stem, &recorder, device)?;

    info!(
        "Loaded {} checkpoint '{}' (epoch {}, score {:.4})",
        meta.backbone,
        stem.display(),
        meta.epoch,
        meta.score
    );
    Ok((model, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Backbone;
    use burn::tensor::{Distribution, Tensor};
    use burn_ndarray::{NdArray, NdArrayDevice};
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn test_best_policy_sequence() {
        let mut policy = BestModelPolicy::new();

        assert_eq!(policy.observe(0, EpochResult::new(0.5, 0.4)), Some(ModelSource::Live));
        assert_eq!(policy.best_score(), 0.5);

        assert_eq!(policy.observe(1, EpochResult::new(0.3, 0.6)), Some(ModelSource::Shadow));
        assert_eq!(policy.best_score(), 0.6);
        assert_eq!(policy.best(), Some((1, ModelSource::Shadow)));

        assert_eq!(policy.observe(2, EpochResult::new(0.6, 0.6)), None);
        assert_eq!(policy.best_score(), 0.6);
        assert_eq!(policy.best(), Some((1, ModelSource::Shadow)));
    }

    #[test]
    fn test_ties_prefer_shadow_and_zero_never_saves() {
        assert_eq!(EpochResult::new(0.7, 0.7).candidate(), (ModelSource::Shadow, 0.7));

        let mut policy = BestModelPolicy::new();
        assert_eq!(policy.observe(0, EpochResult::new(0.0, 0.0)), None);
        assert_eq!(policy.observe(1, EpochResult::new(0.2, 0.2)), Some(ModelSource::Shadow));
    }

    #[test]
    fn test_paths() {
        let paths = CheckpointPaths::new("runs/x/cnn");
        assert_eq!(paths.best(), PathBuf::from("runs/x/cnn_best"));
        assert_eq!(paths.last(), PathBuf::from("runs/x/cnn_last"));
        assert_eq!(paths.ema_last(), PathBuf::from("runs/x/cnn_ema_last"));

        assert_eq!(checkpoint_stem(Path::new("a/cnn_best.mpk")), PathBuf::from("a/cnn_best"));
        assert_eq!(checkpoint_stem(Path::new("a/cnn_best")), PathBuf::from("a/cnn_best"));
    }

    #[test]
    fn test_round_trip_reproduces_outputs() {
        let dir = TempDir::new().unwrap();
        let device = NdArrayDevice::Cpu;
        let config = VisionNetConfig::new(3).with_base_filters(4).with_embedding_size(6);
        let model: VisionNet<TestBackend> = config.init(&device);

        let stem = dir.path().join("nested").join("cnn_metric_best");
        let meta = CheckpointMeta::new(
            config,
            "cnn_metric",
            vec!["a".into(), "b".into(), "c".into()],
            4,
            0.75,
            ModelSource::Shadow,
        );
        save_checkpoint(&model, &stem, &meta).unwrap();
        assert!(stem.with_extension("mpk").exists());

        let (loaded, loaded_meta) =
            load_checkpoint::<TestBackend>(&stem.with_extension("mpk"), &device).unwrap();
        assert_eq!(loaded_meta.epoch, 4);
        assert_eq!(loaded_meta.source, ModelSource::Shadow);
        assert_eq!(loaded.embedding_size(), Some(6));

        let input = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Normal(0.0, 1.0), &device);
        let expected: Vec<f32> = model.forward(input.clone()).into_data().to_vec().unwrap();
        let actual: Vec<f32> = loaded.forward(input).into_data().to_vec().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let result = load_checkpoint::<TestBackend>(&dir.path().join("nothing"), &NdArrayDevice::Cpu);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
