//! Write-only sinks for scalar time series and images.
//!
//! Sinks never fail the caller: write errors are logged and dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use image::RgbImage;
use tracing::warn;

/// Observability sink fed by the training loop
pub trait SummarySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize);

    /// Scalars sharing a parent tag, recorded as `<main_tag>/<name>`
    fn add_scalars(&mut self, main_tag: &str, values: &[(&str, f64)], step: usize) {
        for (name, value) in values {
            self.add_scalar(&format!("{main_tag}/{name}"), *value, step);
        }
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: usize);

    fn flush(&mut self) {}
}

/// Appends scalars to `scalars.csv` and writes images under `images/`
pub struct CsvSummaryWriter {
    dir: PathBuf,
    scalars: Option<BufWriter<File>>,
}

impl CsvSummaryWriter {
    pub fn new(dir: impl Into<PathBuf>) -> vision_core::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("images"))?;

        let path = dir.join("scalars.csv");
        let fresh = !path.exists();
        let mut file = BufWriter::new(OpenOptions::new().create(true).append(true).open(&path)?);
        if fresh {
            writeln!(file, "wall_time,tag,step,value")?;
        }

        Ok(Self {
            dir,
            scalars: Some(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flushes and closes the scalar file; later writes are dropped
    pub fn close(&mut self) {
        self.flush();
        self.scalars = None;
    }
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// File-name-safe form of a tag
fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl SummarySink for CsvSummaryWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        if let Some(file) = self.scalars.as_mut() {
            if let Err(e) = writeln!(file, "{:.3},{},{},{}", wall_time(), tag.replace(',', ";"), step, value) {
                warn!("Dropping scalar {tag}: {e}");
            }
        }
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: usize) {
        let path = self.dir.join("images").join(format!("{}_{step}.png", sanitize(tag)));
        if let Err(e) = image.save(&path) {
            warn!("Dropping image {tag}: {e}");
        }
    }

    fn flush(&mut self) {
        if let Some(file) = self.scalars.as_mut() {
            if let Err(e) = file.flush() {
                warn!("Failed to flush summaries: {e}");
            }
        }
    }
}

impl Drop for CsvSummaryWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub scalars: Vec<(String, usize, f64)>,
    pub images: Vec<(String, usize, (u32, u32))>,
}

impl MemorySink {
    /// Values recorded under `tag`, in order
    pub fn series(&self, tag: &str) -> Vec<(usize, f64)> {
        self.scalars
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, step, value)| (*step, *value))
            .collect()
    }
}

impl SummarySink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        self.scalars.push((tag.to_string(), step, value));
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: usize) {
        self.images.push((tag.to_string(), step, image.dimensions()));
    }
}
