//! Training and evaluation for classification and metric-learning models.
//!
//! The crate provides:
//! - A backbone trait and a small convolutional network
//! - Classification and proxy/pair-based metric losses, with a hard-pair miner
//! - An EMA shadow model evaluated next to the live model every epoch
//! - Accuracy and nearest-neighbor retrieval evaluators
//! - Best/last checkpointing and a CSV summary sink
//! - The training loop that ties these together

pub mod checkpoint;
pub mod ema;
pub mod env;
pub mod evaluator;
pub mod loss;
pub mod lr_schedule;
pub mod miner;
pub mod model;
pub mod optim;
pub mod summary;
pub mod task;
pub mod trainer;

pub use checkpoint::{
    checkpoint_stem, load_checkpoint, save_checkpoint, BestModelPolicy, CheckpointMeta,
    CheckpointPaths, EpochResult, ModelSource,
};
pub use ema::{unwrap_model, ModelEma};
pub use env::{init_env, RunEnv};
pub use evaluator::{
    embed_dataset, evaluate_classifier, nearest_neighbor_precision, retrieval_precision,
    LabeledEmbedding,
};
pub use loss::{ClassificationLoss, LossKind, MetricLoss, ProxyHead};
pub use lr_schedule::{LearningRateScheduler, SchedulerType};
pub use miner::{MinedPairs, MultiSimilarityMiner};
pub use model::{l2_normalize, Backbone, VisionNet, VisionNetConfig};
pub use optim::{OptimizerKind, ParamOptimizer};
pub use summary::{CsvSummaryWriter, MemorySink, SummarySink};
pub use task::{task_of, TaskComponents, TaskSetup};
pub use trainer::{run_training, train, TrainingReport, TrainingRunState};

/// Re-export commonly used types
pub mod prelude {
    pub use super::checkpoint::{load_checkpoint, CheckpointPaths, ModelSource};
    pub use super::evaluator::{evaluate_classifier, retrieval_precision};
    pub use super::model::{Backbone, VisionNet, VisionNetConfig};
    pub use super::trainer::{run_training, train, TrainingReport};
}
