//! Burn dataset and batcher over manifest samples.
//!
//! Images are decoded lazily in [`Dataset::get`], so a dataset doubles as the
//! raw, unbatched reference set used by retrieval evaluation.

use std::path::Path;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::ImageReader;
use tracing::warn;
use vision_core::{
    Error, ImageDimensions, ImageSample, Result, SplitMode, IMAGENET_MEAN, IMAGENET_STD,
};

use crate::manifest::Manifest;
use crate::transform::{to_chw, ImageTransform};

/// A single decoded, transformed sample
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// Image data as flattened CHW float array in `[0, 1]`
    pub image: Vec<f32>,
    /// Index into the label vocabulary
    pub label: usize,
    /// Source path, kept for logging
    pub path: String,
}

/// Decodes an image file
pub fn decode_image(path: &Path) -> Result<image::DynamicImage> {
    if !path.exists() {
        return Err(Error::NotFound(format!(
            "Image file not found: {}",
            path.display()
        )));
    }
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    Ok(reader.decode()?)
}

/// Lazily decoding image dataset for one manifest split
#[derive(Debug, Clone)]
pub struct ImageDataset {
    samples: Vec<ImageSample>,
    transform: ImageTransform,
}

impl ImageDataset {
    pub fn new(samples: Vec<ImageSample>, transform: ImageTransform) -> Self {
        Self { samples, transform }
    }

    /// Builds the dataset of one split; only `Train` is augmented
    pub fn from_manifest(
        manifest: &Manifest,
        mode: SplitMode,
        ratio: f64,
        dims: ImageDimensions,
    ) -> Self {
        let transform = if mode.is_training() {
            ImageTransform::train(dims)
        } else {
            ImageTransform::eval(dims)
        };
        Self::new(manifest.split(mode, ratio), transform)
    }

    /// Same samples with the deterministic eval transform
    pub fn without_augmentation(&self) -> Self {
        Self {
            samples: self.samples.clone(),
            transform: ImageTransform::eval(self.transform.dims()),
        }
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.label).collect()
    }

    pub fn dims(&self) -> ImageDimensions {
        self.transform.dims()
    }

    /// Decodes and transforms one sample
    pub fn load(&self, index: usize) -> Result<ImageItem> {
        let sample = self.samples.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "index {index} out of range for {} samples",
                self.samples.len()
            ))
        })?;

        let decoded = decode_image(&sample.path)?;
        let rgb = self.transform.apply(&decoded, &mut rand::thread_rng());

        Ok(ImageItem {
            image: to_chw(&rgb),
            label: sample.label,
            path: sample.path.to_string_lossy().to_string(),
        })
    }
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        match self.load(index) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping sample {index}: {e}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A batch of normalized images and their labels
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[N, 3, H, W]`, ImageNet-normalized
    pub images: Tensor<B, 4>,
    /// `[N]` label indices
    pub targets: Tensor<B, 1, Int>,
    /// Host copy of the labels, used by the miner and the metric losses
    pub labels: Vec<usize>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Stacks items into a normalized batch tensor
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    dims: ImageDimensions,
}

impl ImageBatcher {
    pub fn new(dims: ImageDimensions) -> Self {
        Self { dims }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let ImageDimensions {
            height,
            width,
            channels,
        } = self.dims;

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );

        let mean = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]), device);
        let std = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]), device);
        let images = (images - mean) / std;

        let labels: Vec<usize> = items.iter().map(|item| item.label).collect();
        let targets_data: Vec<i64> = labels.iter().map(|&label| label as i64).collect();
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        ImageBatch {
            images,
            targets,
            labels,
        }
    }
}
