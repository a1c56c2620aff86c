//! Evaluation CLI Tool
//!
//! Loads the checkpoint named by `Models.checkpoint` and evaluates it on a
//! test manifest. Classifiers get a confusion matrix with per-class metrics;
//! metric models get nearest-neighbor retrieval precision against the
//! `train.txt` gallery next to the manifest.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::tensor::backend::Backend;
use clap::Parser;
use colored::Colorize;
use tracing::{info, warn};
use vision_core::{
    load_toml_config, select_best_device, setup_cli_logging, ConfusionMatrix, RunConfig,
    SplitMode, TaskKind,
};
use vision_dataset::{BatchLoader, ImageDataset, LabelVocabulary, Manifest};
use vision_training::{
    checkpoint_stem, evaluate_classifier, load_checkpoint, retrieval_precision, task_of,
};

/// Gallery manifest expected next to the test manifest of a metric model
const GALLERY_MANIFEST: &str = "train.txt";
/// Train split ratio used to carve the gallery out of `train.txt`
const GALLERY_RATIO: f64 = 0.8;

/// Checkpoint evaluation tool
#[derive(Parser, Debug)]
#[command(
    name = "vision-test",
    about = "Evaluate a trained checkpoint on a test manifest",
    long_about = "Evaluate the checkpoint named by Models.checkpoint. Classification models \
                  report accuracy, a confusion matrix and per-class metrics; metric models \
                  report nearest-neighbor retrieval precision."
)]
struct Args {
    /// Path to the run configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Test manifest; `labels.txt` must sit next to it
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
    let checkpoint = resolve_checkpoint(&cfg)?;
    if !args.txt.exists() {
        bail!("Test manifest does not exist: {}", args.txt.display());
    }
    cfg.dataset.txt = args.txt;

    match select_best_device(cfg!(feature = "wgpu")) {
        #[cfg(feature = "wgpu")]
        vision_core::Device::Gpu(_) => run::<burn::backend::Wgpu>(
            &cfg,
            &checkpoint,
            &burn::backend::wgpu::WgpuDevice::default(),
        ),
        _ => run::<NdArray>(&cfg, &checkpoint, &NdArrayDevice::Cpu),
    }
}

/// Checkpoint stem from the config; both record files must exist
fn resolve_checkpoint(cfg: &RunConfig) -> Result<PathBuf> {
    let Some(path) = cfg.models.checkpoint.as_deref() else {
        bail!("Models.checkpoint must be set for evaluation");
    };
    let stem = checkpoint_stem(path);
    for ext in ["mpk", "json"] {
        let file = stem.with_extension(ext);
        if !file.exists() {
            bail!("Checkpoint file does not exist: {}", file.display());
        }
    }
    Ok(stem)
}

fn run<B: Backend>(cfg: &RunConfig, checkpoint: &Path, device: &B::Device) -> Result<()> {
    let (model, meta) = load_checkpoint::<B>(checkpoint, device)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
    info!(
        "Loaded {} ({} model of epoch {}, {:.4}) from {}",
        meta.backbone,
        meta.source,
        meta.epoch + 1,
        meta.score,
        checkpoint.display()
    );

    let txt = &cfg.dataset.txt;
    let vocabulary = LabelVocabulary::for_manifest(txt)?;
    if vocabulary.names() != meta.labels.as_slice() {
        warn!(
            "labels.txt next to {} differs from the labels the checkpoint was trained on",
            txt.display()
        );
    }
    let manifest = Manifest::load(txt, &vocabulary)?;
    let dims = cfg.dataset.dimensions();
    let test_set = ImageDataset::from_manifest(&manifest, SplitMode::Test, 1.0, dims);
    info!("Evaluating on {} samples from {}", test_set.samples().len(), txt.display());

    match task_of(&model) {
        TaskKind::Classification => {
            let loader = BatchLoader::<B>::sequential(test_set, cfg.dataset.batch, device.clone())
                .with_workers(cfg.dataset.workers)?;
            let mut matrix = evaluate_classifier(&model, &loader, vocabulary.len())?;
            matrix.relabel(vocabulary.names())?;
            print_classification_report(&matrix);

            let csv_path = checkpoint
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("confusion_matrix.csv");
            fs::write(&csv_path, matrix.to_csv())
                .with_context(|| format!("Failed to write {}", csv_path.display()))?;
            info!("Confusion matrix written to {}", csv_path.display());
        }
        TaskKind::Metric => {
            let gallery_txt = txt
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(GALLERY_MANIFEST);
            let gallery_manifest = Manifest::load(&gallery_txt, &vocabulary)
                .with_context(|| format!("Failed to load gallery {}", gallery_txt.display()))?;
            let gallery =
                ImageDataset::from_manifest(&gallery_manifest, SplitMode::Train, GALLERY_RATIO, dims)
                    .without_augmentation();
            info!("Gallery: {} samples from {}", gallery.samples().len(), gallery_txt.display());

            let precision = retrieval_precision(&model, &gallery, &test_set, device)?;
            println!();
            println!("{}", "=== Retrieval Results ===".bold().cyan());
            println!(
                "Top-1 precision: {}",
                format!("{precision:.4}").green().bold()
            );
        }
    }
    Ok(())
}

fn print_classification_report(matrix: &ConfusionMatrix) {
    println!();
    println!("{}", "=== Evaluation Results ===".bold().cyan());
    println!(
        "Overall accuracy: {} ({}/{})",
        format!("{:.4}", matrix.accuracy()).green().bold(),
        matrix.correct(),
        matrix.total()
    );

    let names = matrix.class_names();
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0).max(8);

    println!();
    println!("{}", "Confusion matrix (row-normalized)".bold());
    print!("{:>width$}", "");
    for name in names {
        print!(" {:>width$}", name);
    }
    println!();
    for (name, row) in names.iter().zip(matrix.normalized()) {
        print!("{:>width$}", name.yellow());
        for value in row {
            print!(" {:>width$.3}", value);
        }
        println!();
    }

    println!();
    println!("{}", "Per-class metrics".bold());
    println!(
        "{:<width$} {:>9} {:>9} {:>9} {:>8}",
        "class", "precision", "recall", "f1", "support"
    );
    for m in matrix.class_metrics() {
        println!(
            "{:<width$} {:>9.4} {:>9.4} {:>9.4} {:>8}",
            m.name, m.precision, m.recall, m.f1, m.support
        );
    }
    println!("Macro F1: {:.4}", matrix.macro_f1());
}
