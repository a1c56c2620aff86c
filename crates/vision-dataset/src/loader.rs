//! Batch loading over an [`ImageDataset`].
//!
//! Images of one batch are decoded in parallel, but batches are handed to
//! the caller strictly in sampler order.

use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::warn;
use vision_core::{Error, Result};

use crate::dataset::{ImageBatch, ImageBatcher, ImageDataset, ImageItem};
use crate::sampler::Sampler;

/// Iterable source of [`ImageBatch`]es for one device
pub struct BatchLoader<B: Backend> {
    dataset: Arc<ImageDataset>,
    batcher: ImageBatcher,
    sampler: Sampler,
    batch_size: usize,
    device: B::Device,
    pool: Option<Arc<ThreadPool>>,
}

impl<B: Backend> BatchLoader<B> {
    pub fn new(dataset: ImageDataset, sampler: Sampler, batch_size: usize, device: B::Device) -> Self {
        let batcher = ImageBatcher::new(dataset.dims());
        Self {
            dataset: Arc::new(dataset),
            batcher,
            sampler,
            batch_size: batch_size.max(1),
            device,
            pool: None,
        }
    }

    /// Loader visiting the dataset once in order
    pub fn sequential(dataset: ImageDataset, batch_size: usize, device: B::Device) -> Self {
        let sampler = Sampler::sequential(dataset.len());
        Self::new(dataset, sampler, batch_size, device)
    }

    /// Decodes on a dedicated pool of `workers` threads; 0 keeps the global pool
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        if workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| Error::Config(format!("Failed to build decoding pool: {e}")))?;
            self.pool = Some(Arc::new(pool));
        }
        Ok(self)
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        self.sampler.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_samples(&self) -> usize {
        self.sampler.len()
    }

    pub fn dataset(&self) -> &ImageDataset {
        &self.dataset
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Batches of `epoch` in sampler order
    pub fn iter(&self, epoch: usize) -> BatchIter<'_, B> {
        BatchIter {
            loader: self,
            indices: self.sampler.indices(epoch),
            position: 0,
        }
    }

    fn load_items(&self, indices: &[usize]) -> Vec<ImageItem> {
        let decode = || {
            indices
                .par_iter()
                .filter_map(|&index| self.dataset.get(index))
                .collect::<Vec<_>>()
        };
        match &self.pool {
            Some(pool) => pool.install(decode),
            None => decode(),
        }
    }
}

/// Iterator over the batches of one epoch
pub struct BatchIter<'a, B: Backend> {
    loader: &'a BatchLoader<B>,
    indices: Vec<usize>,
    position: usize,
}

impl<B: Backend> Iterator for BatchIter<'_, B> {
    type Item = ImageBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.indices.len() {
            let end = (self.position + self.loader.batch_size).min(self.indices.len());
            let chunk = &self.indices[self.position..end];
            self.position = end;

            let items = self.loader.load_items(chunk);
            if items.is_empty() {
                warn!("Dropping batch: none of its {} images could be loaded", chunk.len());
                continue;
            }
            return Some(self.loader.batcher.batch(items, &self.loader.device));
        }
        None
    }
}
