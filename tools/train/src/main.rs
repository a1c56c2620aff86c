//! Training CLI Tool
//!
//! Trains a classification or metric-learning model from a TOML config and a
//! dataset manifest. Checkpoints, scalars and the resolved config are written
//! to a timestamped directory under `Train.log_dir`.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use tracing::info;
use vision_core::{load_toml_config, select_best_device, setup_cli_logging, RunConfig};
use vision_training::train;

/// Classification / metric-learning trainer
#[derive(Parser, Debug)]
#[command(
    name = "vision-train",
    about = "Train an image classification or metric-learning model",
    long_about = "Train a backbone with a classification or metric loss, tracking an EMA \
                  shadow model and keeping the best and last checkpoints."
)]
struct Args {
    /// Path to the run configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Dataset manifest; `labels.txt` must sit next to it
    #[arg(short, long, value_name = "FILE")]
    txt: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_cli_logging(args.verbose)?;

    let mut cfg: RunConfig = load_toml_config(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))?;
    if !args.txt.exists() {
        bail!("Dataset manifest does not exist: {}", args.txt.display());
    }
    cfg.dataset.txt = args.txt;

    match select_best_device(cfg!(feature = "wgpu")) {
        #[cfg(feature = "wgpu")]
        vision_core::Device::Gpu(_) => run::<Autodiff<burn::backend::Wgpu>>(
            &cfg,
            &burn::backend::wgpu::WgpuDevice::default(),
        ),
        _ => run::<Autodiff<NdArray>>(&cfg, &NdArrayDevice::Cpu),
    }
}

fn run<B: AutodiffBackend>(cfg: &RunConfig, device: &B::Device) -> Result<()> {
    info!(
        "Training '{}' with '{}' loss on {}",
        cfg.models.backbone,
        cfg.models.loss,
        cfg.dataset.txt.display()
    );

    let (report, run_dir) = train::<B>(cfg, device).context("Training failed")?;

    match report.best {
        Some((epoch, source)) => info!(
            "Best {} {:.4} from the {source} model of epoch {}",
            report.task.score_name(),
            report.best_score,
            epoch + 1
        ),
        None => info!("No epoch scored above 0; no best checkpoint was written"),
    }
    info!("Best checkpoint: {}", report.checkpoints.best().display());
    info!("Run directory: {}", run_dir.display());
    Ok(())
}
