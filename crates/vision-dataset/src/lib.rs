//! Dataset loading for the vision trainer.
//!
//! This crate reads dataset manifests and their label vocabulary, applies
//! the train/eval image transforms, and turns samples into normalized burn
//! batches through a parallel, order-preserving loader.

pub mod dataset;
pub mod loader;
pub mod manifest;
pub mod preview;
pub mod sampler;
pub mod transform;

pub use dataset::{decode_image, ImageBatch, ImageBatcher, ImageDataset, ImageItem};
pub use loader::{BatchIter, BatchLoader};
pub use manifest::{labels_path, LabelVocabulary, Manifest, LABELS_FILE};
pub use preview::{batch_grids, class_grids};
pub use sampler::Sampler;
pub use transform::{denormalize, to_chw, ImageTransform};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::dataset::*;
    pub use crate::loader::*;
    pub use crate::manifest::*;
    pub use crate::sampler::*;
    pub use crate::transform::*;
}
