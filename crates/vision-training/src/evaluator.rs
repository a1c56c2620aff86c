//! Per-epoch evaluation of classifiers and embedding models.
//!
//! Callers pass the inference form of a model (see
//! [`crate::ema::unwrap_model`]), so no gradients are tracked here.

use std::time::Instant;

use burn::prelude::*;
use tracing::{info, warn};
use vision_core::{ConfusionMatrix, Error, Result};
use vision_dataset::{BatchLoader, ImageDataset};

use crate::model::Backbone;

/// Images per forward pass when embedding a reference set
pub const EMBED_BATCH: usize = 64;

/// Confusion matrix of `model` over every batch of `loader`
pub fn evaluate_classifier<B: Backend, M: Backbone<B>>(
    model: &M,
    loader: &BatchLoader<B>,
    num_classes: usize,
) -> Result<ConfusionMatrix> {
    let start = Instant::now();
    let mut matrix = ConfusionMatrix::new(num_classes);
    let mut out_of_range = 0usize;

    for batch in loader.iter(0) {
        let n = batch.len();
        let predictions: Vec<i64> = model
            .forward(batch.images)
            .argmax(1)
            .reshape([n])
            .into_data()
            .convert::<i64>()
            .to_vec()
            .map_err(|e| Error::Training(format!("{e:?}")))?;

        for (&actual, &predicted) in batch.labels.iter().zip(&predictions) {
            if !matrix.update(actual, predicted as usize) {
                out_of_range += 1;
            }
        }
    }

    if out_of_range > 0 {
        warn!("{out_of_range} samples had labels outside the {num_classes}-class vocabulary");
    }
    info!(
        "Evaluated {} samples in {:.2}s: accuracy {:.2}%",
        matrix.total(),
        start.elapsed().as_secs_f64(),
        matrix.accuracy() * 100.0
    );
    Ok(matrix)
}

/// One embedding with the label of the sample it came from
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledEmbedding {
    pub label: usize,
    pub vector: Vec<f32>,
}

impl LabeledEmbedding {
    pub fn new(label: usize, vector: Vec<f32>) -> Self {
        Self { label, vector }
    }
}

/// Embeds every readable sample of `dataset` in dataset order
pub fn embed_dataset<B: Backend, M: Backbone<B>>(
    model: &M,
    dataset: &ImageDataset,
    device: &B::Device,
) -> Result<Vec<LabeledEmbedding>> {
    let loader: BatchLoader<B> = BatchLoader::sequential(dataset.clone(), EMBED_BATCH, device.clone());
    let mut embeddings = Vec::with_capacity(dataset.samples().len());

    for batch in loader.iter(0) {
        let output = model.forward(batch.images);
        let [n, width] = output.dims();
        let values: Vec<f32> = output
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| Error::Training(format!("{e:?}")))?;

        for row in 0..n {
            embeddings.push(LabeledEmbedding::new(
                batch.labels[row],
                values[row * width..(row + 1) * width].to_vec(),
            ));
        }
    }
    Ok(embeddings)
}

fn normalized(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
    vector.iter().map(|v| v / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Fraction of queries whose most cosine-similar gallery embedding has the
/// query's label.
///
/// Ties go to the lowest gallery index. An empty gallery, or a query class
/// absent from the gallery, counts as a miss; no queries gives 0.
pub fn nearest_neighbor_precision(gallery: &[LabeledEmbedding], queries: &[LabeledEmbedding]) -> f64 {
    if queries.is_empty() {
        return 0.0;
    }
    let gallery: Vec<(usize, Vec<f32>)> = gallery
        .iter()
        .map(|g| (g.label, normalized(&g.vector)))
        .collect();

    let correct = queries
        .iter()
        .filter(|query| {
            let q = normalized(&query.vector);
            let mut best: Option<(f32, usize)> = None;
            for (label, g) in &gallery {
                let similarity = dot(&q, g);
                if best.map_or(true, |(s, _)| similarity > s) {
                    best = Some((similarity, *label));
                }
            }
            matches!(best, Some((_, label)) if label == query.label)
        })
        .count();

    correct as f64 / queries.len() as f64
}

/// Nearest-neighbor retrieval precision of `model`, with `gallery` as the
/// reference set and `queries` as the evaluation set
pub fn retrieval_precision<B: Backend, M: Backbone<B>>(
    model: &M,
    gallery: &ImageDataset,
    queries: &ImageDataset,
    device: &B::Device,
) -> Result<f64> {
    let start = Instant::now();
    let gallery = embed_dataset(model, gallery, device)?;
    let queries = embed_dataset(model, queries, device)?;
    let precision = nearest_neighbor_precision(&gallery, &queries);

    info!(
        "Retrieval over {} gallery / {} query embeddings in {:.2}s: precision {:.4}",
        gallery.len(),
        queries.len(),
        start.elapsed().as_secs_f64(),
        precision
    );
    Ok(precision)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(label: usize, v: &[f32]) -> LabeledEmbedding {
        LabeledEmbedding::new(label, v.to_vec())
    }

    #[test]
    fn test_separated_clusters_are_perfect() {
        let gallery = vec![emb(0, &[1.0, 0.0]), emb(1, &[0.0, 1.0]), emb(2, &[-1.0, 0.0])];
        let queries = vec![
            emb(0, &[0.9, 0.1]),
            emb(1, &[0.2, 0.8]),
            emb(2, &[-0.7, -0.1]),
            emb(0, &[5.0, 1.0]),
        ];
        assert_eq!(nearest_neighbor_precision(&gallery, &queries), 1.0);
    }

    #[test]
    fn test_equidistant_query_takes_first_gallery_entry() {
        let gallery = vec![emb(3, &[1.0, 0.0]), emb(7, &[0.0, 1.0])];
        let between = [std::f32::consts::FRAC_1_SQRT_2, std::f32::consts::FRAC_1_SQRT_2];

        assert_eq!(nearest_neighbor_precision(&gallery, &[emb(3, &between)]), 1.0);
        assert_eq!(nearest_neighbor_precision(&gallery, &[emb(7, &between)]), 0.0);
    }

    #[test]
    fn test_class_missing_from_gallery_is_a_miss() {
        let gallery = vec![emb(0, &[1.0, 0.0])];
        let queries = vec![emb(0, &[1.0, 0.1]), emb(5, &[0.0, 1.0])];
        assert_eq!(nearest_neighbor_precision(&gallery, &queries), 0.5);

        assert_eq!(nearest_neighbor_precision(&[], &queries), 0.0);
        assert_eq!(nearest_neighbor_precision(&gallery, &[]), 0.0);
    }

    #[test]
    fn test_confusion_matrix_accuracy() {
        let counts = vec![vec![9, 1, 0], vec![2, 8, 0], vec![1, 1, 8]];
        let matrix = ConfusionMatrix::from_counts(counts).unwrap();
        assert_eq!(matrix.accuracy(), 25.0 / 30.0);
    }
}
