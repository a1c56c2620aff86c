//! Per-class image grids of augmented batches for visual sanity checks.

use burn::prelude::*;
use image::{GenericImage, RgbImage};
use vision_core::{Error, ImageDimensions, Result};

use crate::dataset::ImageBatch;
use crate::transform::denormalize;

/// Default number of images shown per class
pub const PER_CLASS: usize = 4;

/// Groups a batch by class and tiles up to `per_class` denormalized images
/// of every class side by side.
///
/// Classes appear in order of first occurrence in the batch. `values` holds
/// the normalized batch as a flat `[N, 3, H, W]` buffer.
pub fn class_grids(
    values: &[f32],
    labels: &[usize],
    names: &[String],
    dims: ImageDimensions,
    per_class: usize,
) -> Result<Vec<(String, RgbImage)>> {
    let stride = dims.num_values();
    if values.len() != labels.len() * stride {
        return Err(Error::InvalidArgument(format!(
            "batch buffer holds {} values, expected {}",
            values.len(),
            labels.len() * stride
        )));
    }

    let mut order: Vec<usize> = Vec::new();
    for &label in labels {
        if !order.contains(&label) {
            order.push(label);
        }
    }

    let mut grids = Vec::with_capacity(order.len());
    for label in order {
        let members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == label)
            .map(|(i, _)| i)
            .take(per_class.max(1))
            .collect();

        let mut grid = RgbImage::new((dims.width * members.len()) as u32, dims.height as u32);
        for (slot, &index) in members.iter().enumerate() {
            let tile = denormalize(&values[index * stride..(index + 1) * stride], dims);
            grid.copy_from(&tile, (slot * dims.width) as u32, 0)
                .map_err(|e| Error::Image(e.to_string()))?;
        }

        let name = names
            .get(label)
            .cloned()
            .unwrap_or_else(|| label.to_string());
        grids.push((name, grid));
    }

    Ok(grids)
}

/// [`class_grids`] over a batch tensor
pub fn batch_grids<B: Backend>(
    batch: &ImageBatch<B>,
    names: &[String],
    per_class: usize,
) -> Result<Vec<(String, RgbImage)>> {
    let [_, channels, height, width] = batch.images.dims();
    let values: Vec<f32> = batch
        .images
        .clone()
        .into_data()
        .to_vec()
        .map_err(|e| Error::Other(format!("{e:?}")))?;

    let dims = ImageDimensions {
        height,
        width,
        channels,
    };
    class_grids(&values, &batch.labels, names, dims, per_class)
}
