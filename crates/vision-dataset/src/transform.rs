//! Image transforms applied before batching.
//!
//! - Eval: resize to cover `size / 0.875`, then center crop to `size`
//! - Train: random resized crop, horizontal flip, brightness/contrast jitter
//!
//! Both produce an RGB image of exactly the configured size. Mean/std
//! normalization happens in the batcher.

use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use rand::Rng;
use vision_core::{ImageDimensions, IMAGENET_MEAN, IMAGENET_STD};

const EVAL_CROP_PCT: f32 = 0.875;
const CROP_SCALE: (f32, f32) = (0.08, 1.0);
const CROP_RATIO: (f32, f32) = (3.0 / 4.0, 4.0 / 3.0);
const JITTER: f32 = 0.4;

/// Resize/crop/augment pipeline producing fixed-size RGB images
#[derive(Debug, Clone, Copy)]
pub struct ImageTransform {
    dims: ImageDimensions,
    training: bool,
}

impl ImageTransform {
    /// Deterministic evaluation transform
    pub fn eval(dims: ImageDimensions) -> Self {
        Self {
            dims,
            training: false,
        }
    }

    /// Randomized training transform
    pub fn train(dims: ImageDimensions) -> Self {
        Self {
            dims,
            training: true,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn dims(&self) -> ImageDimensions {
        self.dims
    }

    /// Applies the transform; `rng` is only consumed by the training variant
    pub fn apply<R: Rng>(&self, image: &DynamicImage, rng: &mut R) -> RgbImage {
        if !self.training {
            return self.center_crop(image).to_rgb8();
        }

        let mut rgb = self.random_resized_crop(image, rng).to_rgb8();

        if rng.gen_bool(0.5) {
            rgb = image::imageops::flip_horizontal(&rgb);
        }

        let brightness = rng.gen_range(1.0 - JITTER..=1.0 + JITTER);
        adjust_brightness(&mut rgb, brightness);

        let contrast = rng.gen_range(1.0 - JITTER..=1.0 + JITTER);
        adjust_contrast(&mut rgb, contrast);

        rgb
    }

    fn target(&self) -> (u32, u32) {
        (self.dims.width as u32, self.dims.height as u32)
    }

    fn center_crop(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = self.target();
        let scaled_w = ((width as f32 / EVAL_CROP_PCT).round() as u32).max(width);
        let scaled_h = ((height as f32 / EVAL_CROP_PCT).round() as u32).max(height);

        let resized = image.resize_to_fill(scaled_w, scaled_h, FilterType::Triangle);
        let x = (scaled_w - width) / 2;
        let y = (scaled_h - height) / 2;
        resized.crop_imm(x, y, width, height)
    }

    fn random_resized_crop<R: Rng>(&self, image: &DynamicImage, rng: &mut R) -> DynamicImage {
        let (src_w, src_h) = (image.width(), image.height());
        let area = (src_w * src_h) as f32;
        let (width, height) = self.target();

        for _ in 0..10 {
            let target_area = area * rng.gen_range(CROP_SCALE.0..=CROP_SCALE.1);
            let log_ratio = rng.gen_range(CROP_RATIO.0.ln()..=CROP_RATIO.1.ln());
            let aspect = log_ratio.exp();

            let crop_w = (target_area * aspect).sqrt().round() as u32;
            let crop_h = (target_area / aspect).sqrt().round() as u32;

            if crop_w > 0 && crop_h > 0 && crop_w <= src_w && crop_h <= src_h {
                let x = rng.gen_range(0..=src_w - crop_w);
                let y = rng.gen_range(0..=src_h - crop_h);
                return image
                    .crop_imm(x, y, crop_w, crop_h)
                    .resize_exact(width, height, FilterType::Triangle);
            }
        }

        self.center_crop(image)
    }
}

fn adjust_brightness(image: &mut RgbImage, factor: f32) {
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = (*channel as f32 * factor).clamp(0.0, 255.0) as u8;
        }
    }
}

fn adjust_contrast(image: &mut RgbImage, factor: f32) {
    let count = (image.width() * image.height()).max(1) as f32;
    let mean = image
        .pixels()
        .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
        .sum::<f32>()
        / count;

    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = ((*channel as f32 - mean) * factor + mean).clamp(0.0, 255.0) as u8;
        }
    }
}

/// Converts an RGB image into a CHW float buffer in `[0, 1]`
pub fn to_chw(image: &RgbImage) -> Vec<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;
    let mut values = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        values[offset] = pixel[0] as f32 / 255.0;
        values[plane + offset] = pixel[1] as f32 / 255.0;
        values[2 * plane + offset] = pixel[2] as f32 / 255.0;
    }

    values
}

/// Inverts ImageNet normalization of one CHW image back to 8-bit RGB
pub fn denormalize(chw: &[f32], dims: ImageDimensions) -> RgbImage {
    let (width, height) = (dims.width, dims.height);
    let plane = width * height;

    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let offset = y as usize * width + x as usize;
        let mut rgb = [0u8; 3];
        for (c, value) in rgb.iter_mut().enumerate() {
            let v = chw[c * plane + offset] * IMAGENET_STD[c] + IMAGENET_MEAN[c];
            *value = (v * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        Rgb(rgb)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    #[test]
    fn test_eval_transform_output_size() {
        let transform = ImageTransform::eval(ImageDimensions::rgb(32, 48));
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let out = transform.apply(&gradient(100, 60), &mut rng);
        assert_eq!(out.dimensions(), (48, 32));
    }

    #[test]
    fn test_eval_transform_is_deterministic() {
        let transform = ImageTransform::eval(ImageDimensions::rgb(16, 16));
        let image = gradient(40, 40);

        let a = transform.apply(&image, &mut ChaCha8Rng::seed_from_u64(1));
        let b = transform.apply(&image, &mut ChaCha8Rng::seed_from_u64(2));
        assert_eq!(a, b);
    }

    #[test]
    fn test_train_transform_output_size() {
        let transform = ImageTransform::train(ImageDimensions::rgb(24, 24));
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        for _ in 0..5 {
            let out = transform.apply(&gradient(50, 30), &mut rng);
            assert_eq!(out.dimensions(), (24, 24));
        }
    }

    #[test]
    fn test_to_chw_layout() {
        let image = RgbImage::from_fn(2, 1, |x, _| if x == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 255, 0]) });
        let chw = to_chw(&image);
        assert_eq!(chw, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_denormalize_inverts_normalization() {
        let dims = ImageDimensions::rgb(1, 1);
        let raw = [128.0f32 / 255.0, 64.0 / 255.0, 1.0];
        let normalized: Vec<f32> = (0..3)
            .map(|c| (raw[c] - IMAGENET_MEAN[c]) / IMAGENET_STD[c])
            .collect();

        let image = denormalize(&normalized, dims);
        assert_eq!(image.get_pixel(0, 0).0, [128, 64, 255]);
    }
}
