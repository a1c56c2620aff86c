//! Run configuration: the `[DataSet]`, `[Models]` and `[Train]` sections.

use crate::types::{ImageDimensions, SamplerKind};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete configuration of a train or test run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Dataset and loader settings
    #[serde(rename = "DataSet")]
    pub dataset: DataSetConfig,
    /// Backbone, loss and optimizer selection
    #[serde(rename = "Models")]
    pub models: ModelsConfig,
    /// Training schedule
    #[serde(rename = "Train", default)]
    pub train: TrainConfig,
}

impl RunConfig {
    /// Checks value ranges of the keys the run consumes.
    pub fn validate(&self) -> Result<()> {
        let ds = &self.dataset;
        if ds.batch == 0 {
            return Err(Error::Config("DataSet.batch must be > 0".into()));
        }
        if ds.size[0] == 0 || ds.size[1] == 0 {
            return Err(Error::Config(format!(
                "DataSet.size must be positive, got {:?}",
                ds.size
            )));
        }
        if !(ds.ratio > 0.0 && ds.ratio <= 1.0) {
            return Err(Error::Config(format!(
                "DataSet.ratio must be in (0, 1], got {}",
                ds.ratio
            )));
        }

        let train = &self.train;
        if train.epochs == 0 {
            return Err(Error::Config("Train.epochs must be > 0".into()));
        }
        if !(train.lr > 0.0) {
            return Err(Error::Config(format!("Train.lr must be > 0, got {}", train.lr)));
        }
        if let Some(loss_lr) = train.loss_lr {
            if !(loss_lr > 0.0) {
                return Err(Error::Config(format!(
                    "Train.loss_lr must be > 0, got {loss_lr}"
                )));
            }
        }
        if !(train.ema_decay > 0.0 && train.ema_decay < 1.0) {
            return Err(Error::Config(format!(
                "Train.ema_decay must be in (0, 1), got {}",
                train.ema_decay
            )));
        }
        if train.log_interval == 0 {
            return Err(Error::Config("Train.log_interval must be > 0".into()));
        }

        Ok(())
    }

    /// Number of classes in the resolved label vocabulary.
    pub fn num_classes(&self) -> usize {
        self.dataset.labels.len()
    }
}

/// `[DataSet]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSetConfig {
    /// Dataset manifest, normally supplied on the command line
    #[serde(default)]
    pub txt: PathBuf,
    /// Class names, resolved from `labels.txt` next to the manifest
    #[serde(default)]
    pub labels: Vec<String>,
    /// Input size as `[height, width]`
    #[serde(default = "default_size")]
    pub size: [usize; 2],
    /// Batch size
    #[serde(default = "default_batch")]
    pub batch: usize,
    /// Sampling order for the training loader
    #[serde(default)]
    pub sampler: SamplerKind,
    /// Share of every class that goes to the train split
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    /// Image decoding threads, 0 picks the rayon default
    #[serde(default)]
    pub workers: usize,
}

impl DataSetConfig {
    /// Input dimensions derived from `size`
    pub fn dimensions(&self) -> ImageDimensions {
        ImageDimensions::rgb(self.size[0], self.size[1])
    }
}

impl Default for DataSetConfig {
    fn default() -> Self {
        Self {
            txt: PathBuf::new(),
            labels: Vec::new(),
            size: default_size(),
            batch: default_batch(),
            sampler: SamplerKind::default(),
            ratio: default_ratio(),
            workers: 0,
        }
    }
}

/// `[Models]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Backbone name
    pub backbone: String,
    /// Loss name, must match the task kind of the backbone
    pub loss: String,
    /// Optimizer name
    #[serde(default = "default_optimizer")]
    pub optimizer: String,
    /// Embedding dimension override for metric backbones
    #[serde(default)]
    pub embedding_size: Option<usize>,
    /// Checkpoint to evaluate, required by the test command
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            backbone: "cnn".to_string(),
            loss: "cross_entropy".to_string(),
            optimizer: default_optimizer(),
            embedding_size: None,
            checkpoint: None,
        }
    }
}

/// `[Train]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Base learning rate
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Number of epochs
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Scheduler name
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    /// Linear warmup length for `warmup_cosine`
    #[serde(default)]
    pub warmup_epochs: usize,
    /// Learning rate of the metric-loss parameter group, defaults to `lr`
    #[serde(default)]
    pub loss_lr: Option<f64>,
    /// Random seed for sampling and initialization
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Root directory for run folders
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// EMA decay of the shadow model
    #[serde(default = "default_ema_decay")]
    pub ema_decay: f64,
    /// Steps between `Train/loss` scalars
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            epochs: default_epochs(),
            scheduler: default_scheduler(),
            warmup_epochs: 0,
            loss_lr: None,
            seed: default_seed(),
            log_dir: default_log_dir(),
            ema_decay: default_ema_decay(),
            log_interval: default_log_interval(),
        }
    }
}

fn default_size() -> [usize; 2] {
    [224, 224]
}

fn default_batch() -> usize {
    32
}

fn default_ratio() -> f64 {
    0.8
}

fn default_optimizer() -> String {
    "adamw".to_string()
}

fn default_lr() -> f64 {
    1e-3
}

fn default_epochs() -> usize {
    50
}

fn default_scheduler() -> String {
    "cosine".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_ema_decay() -> f64 {
    0.9998
}

fn default_log_interval() -> usize {
    100
}
