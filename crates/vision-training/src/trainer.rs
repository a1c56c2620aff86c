//! The training loop.
//!
//! One loop drives both tasks. The task is decided once from the model,
//! [`TaskSetup`] builds the matching data and loss, and every later branch
//! matches on [`TaskComponents`].
//!
//! Per step: forward, loss (metric: mine pairs first), backward, optimizer
//! step(s), EMA update, per-update schedule. Per epoch: evaluate the live and
//! the shadow model, update the best checkpoint, overwrite the last ones.

use std::path::PathBuf;
use std::time::Instant;

use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use vision_core::{Result, RunConfig, TaskKind};
use vision_dataset::{batch_grids, preview::PER_CLASS, ImageBatch, LabelVocabulary, Manifest};

use crate::checkpoint::{
    save_checkpoint, BestModelPolicy, CheckpointMeta, CheckpointPaths, EpochResult, ModelSource,
};
use crate::ema::{unwrap_model, ModelEma};
use crate::env::init_env;
use crate::evaluator::{evaluate_classifier, retrieval_precision};
use crate::loss::ProxyHead;
use crate::lr_schedule::{LearningRateScheduler, SchedulerType};
use crate::model::{log_model_summary, Backbone, VisionNet, VisionNetConfig};
use crate::optim::{OptimizerKind, ParamOptimizer};
use crate::summary::{CsvSummaryWriter, SummarySink};
use crate::task::{task_of, TaskComponents, TaskSetup};

/// Epochs between augmentation previews
const PREVIEW_EVERY: usize = 10;

/// Mutable state of one run, created at start and closed at the end
pub struct TrainingRunState<S: SummarySink> {
    pub policy: BestModelPolicy,
    pub sink: S,
    pub checkpoints: CheckpointPaths,
}

impl<S: SummarySink> TrainingRunState<S> {
    pub fn new(sink: S, checkpoints: CheckpointPaths) -> Self {
        Self {
            policy: BestModelPolicy::new(),
            sink,
            checkpoints,
        }
    }

    /// Flushes the sink and hands it back
    pub fn close(mut self) -> S {
        self.sink.flush();
        self.sink
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub task: TaskKind,
    pub history: Vec<EpochResult>,
    pub best_score: f64,
    pub best: Option<(usize, ModelSource)>,
    pub skipped_steps: usize,
    pub checkpoints: CheckpointPaths,
}

/// Loads the manifest named by `DataSet.txt`, sets up a run directory and
/// trains. Returns the report and the run directory.
pub fn train<B: AutodiffBackend>(cfg: &RunConfig, device: &B::Device) -> Result<(TrainingReport, PathBuf)> {
    let mut cfg = cfg.clone();
    let vocabulary = LabelVocabulary::for_manifest(&cfg.dataset.txt)?;
    cfg.dataset.labels = vocabulary.names().to_vec();
    cfg.validate()?;

    let manifest = Manifest::load(&cfg.dataset.txt, &vocabulary)?;
    info!(
        "Loaded {} samples over {} classes from {}",
        manifest.len(),
        vocabulary.len(),
        cfg.dataset.txt.display()
    );

    let env = init_env(&cfg)?;
    let state = TrainingRunState::new(env.writer, env.checkpoints);
    let (report, mut writer): (TrainingReport, CsvSummaryWriter) =
        run_training::<B, _>(&cfg, &manifest, state, device, true)?;
    writer.close();
    Ok((report, env.run_dir))
}

/// Trains on an already loaded manifest. `cfg.dataset.labels` must hold the
/// label vocabulary.
pub fn run_training<B: AutodiffBackend, S: SummarySink>(
    cfg: &RunConfig,
    manifest: &Manifest,
    mut state: TrainingRunState<S>,
    device: &B::Device,
    show_progress: bool,
) -> Result<(TrainingReport, S)> {
    cfg.validate()?;
    let num_classes = cfg.num_classes();
    let net_config = VisionNetConfig::from_backbone_name(
        &cfg.models.backbone,
        num_classes,
        cfg.models.embedding_size,
    )?;

    let mut model: VisionNet<B> = net_config.init(device);
    let task = task_of(&model);
    let TaskSetup {
        train: loader,
        mut components,
        ..
    } = TaskSetup::<B>::build(cfg, manifest, task, model.embedding_size(), device)?;

    let optimizer_kind: OptimizerKind = cfg.models.optimizer.parse()?;
    let schedule = SchedulerType::from_name(&cfg.train.scheduler, cfg.train.epochs, cfg.train.warmup_epochs)?;
    let scheduler =
        LearningRateScheduler::new(schedule, cfg.train.lr).with_updates_per_epoch(loader.len());
    let mut driver = StepDriver {
        optimizer: optimizer_kind.build::<B, VisionNet<B>>(),
        head_optimizer: optimizer_kind.build::<B, ProxyHead<B>>(),
        scheduler,
        ema: ModelEma::new(unwrap_model(&model), cfg.train.ema_decay),
        loss_lr: cfg.train.loss_lr.unwrap_or(cfg.train.lr),
        skipped: 0,
    };
    let ema_score = format!("ema_{}", task.score_name());
    let mut history = Vec::with_capacity(cfg.train.epochs);

    info!(
        "Training {} ({task}) for {} epochs, {} batches per epoch",
        cfg.models.backbone,
        cfg.train.epochs,
        loader.len()
    );

    for epoch in 0..cfg.train.epochs {
        let start = Instant::now();
        info!("start epoch {}/{}", epoch + 1, cfg.train.epochs);
        state.sink.add_scalar("Train/lr", driver.scheduler.get_lr(), epoch);

        let progress = progress_bar(loader.len(), show_progress);
        let mut epoch_loss = 0.0;
        let mut epoch_steps = 0usize;

        for (batch_idx, batch) in loader.iter(epoch).enumerate() {
            let step = epoch * loader.len() + batch_idx;
            if step == 0 {
                log_model_summary(&model);
            }
            if epoch % PREVIEW_EVERY == 0 && batch_idx == 0 {
                write_previews(&mut state.sink, &batch, &cfg.dataset.labels, epoch);
            }

            let (updated, loss_value) = train_step(model, &mut driver, &mut components, &batch, step)?;
            model = updated;
            if loss_value.is_finite() {
                epoch_loss += loss_value;
                epoch_steps += 1;
            }

            if batch_idx % cfg.train.log_interval == 0 {
                state.sink.add_scalar("Train/loss", loss_value, step);
            }
            progress.set_message(format!("loss {loss_value:.4}"));
            progress.inc(1);
        }
        progress.finish_and_clear();
        driver.scheduler.step();

        let live = unwrap_model(&model);
        let result = match &components {
            TaskComponents::Classification { val, .. } => EpochResult::new(
                evaluate_classifier(&live, val, num_classes)?.accuracy(),
                evaluate_classifier(driver.ema.shadow(), val, num_classes)?.accuracy(),
            ),
            TaskComponents::Metric {
                gallery, queries, ..
            } => EpochResult::new(
                retrieval_precision(&live, gallery, queries, device)?,
                retrieval_precision(driver.ema.shadow(), gallery, queries, device)?,
            ),
        };
        state.sink.add_scalars(
            "Eval",
            &[(task.score_name(), result.live), (ema_score.as_str(), result.shadow)],
            epoch,
        );

        let meta = |score: f64, source: ModelSource| {
            CheckpointMeta::new(
                net_config.clone(),
                cfg.models.backbone.clone(),
                cfg.dataset.labels.clone(),
                epoch,
                score,
                source,
            )
        };
        if let Some(source) = state.policy.observe(epoch, result) {
            let best = state.checkpoints.best();
            match source {
                ModelSource::Live => save_checkpoint(&live, &best, &meta(result.live, source))?,
                ModelSource::Shadow => {
                    save_checkpoint(driver.ema.shadow(), &best, &meta(result.shadow, source))?
                }
            }
        }
        save_checkpoint(&live, &state.checkpoints.last(), &meta(result.live, ModelSource::Live))?;
        save_checkpoint(
            driver.ema.shadow(),
            &state.checkpoints.ema_last(),
            &meta(result.shadow, ModelSource::Shadow),
        )?;

        info!(
            "epoch {}: loss {:.4}, {} {:.4}, {} {:.4}, best {:.4} ({:.1}s)",
            epoch + 1,
            if epoch_steps > 0 { epoch_loss / epoch_steps as f64 } else { f64::NAN },
            task.score_name(),
            result.live,
            ema_score,
            result.shadow,
            state.policy.best_score(),
            start.elapsed().as_secs_f64()
        );
        history.push(result);
    }

    if driver.skipped > 0 {
        warn!("{} steps were skipped for non-finite losses", driver.skipped);
    }

    let report = TrainingReport {
        task,
        history,
        best_score: state.policy.best_score(),
        best: state.policy.best(),
        skipped_steps: driver.skipped,
        checkpoints: state.checkpoints.clone(),
    };
    Ok((report, state.close()))
}

/// Optimizers, schedule and shadow model advanced by every training step
pub(crate) struct StepDriver<B: AutodiffBackend> {
    pub optimizer: Box<dyn ParamOptimizer<B, VisionNet<B>>>,
    /// Steps the proxy head of a metric loss, if any
    pub head_optimizer: Box<dyn ParamOptimizer<B, ProxyHead<B>>>,
    pub scheduler: LearningRateScheduler,
    pub ema: ModelEma<B::InnerBackend, VisionNet<B::InnerBackend>>,
    /// Base learning rate of the metric-loss parameters
    pub loss_lr: f64,
    /// Steps skipped because the loss was not finite
    pub skipped: usize,
}

/// One optimization step at global update `step`. Returns the updated model
/// and the loss value.
///
/// A non-finite loss leaves the model, the proxy head and the shadow
/// untouched. The per-update schedule advances either way.
pub(crate) fn train_step<B: AutodiffBackend>(
    mut model: VisionNet<B>,
    driver: &mut StepDriver<B>,
    components: &mut TaskComponents<B>,
    batch: &ImageBatch<B>,
    step: usize,
) -> Result<(VisionNet<B>, f64)> {
    let loss = batch_loss(components, &model, batch)?;
    let loss_value: f64 = loss.clone().into_scalar().elem();

    if loss_value.is_finite() {
        let lr = driver.scheduler.get_lr();
        let mut grads = loss.backward();
        let model_grads = GradientsParams::from_module(&mut grads, &model);
        model = driver.optimizer.apply(lr, model, model_grads);

        if let TaskComponents::Metric { loss: metric_loss, .. } = components {
            let head_lr = driver.loss_lr * driver.scheduler.factor();
            let head_optimizer = &mut driver.head_optimizer;
            metric_loss.update_head(|head| {
                let head_grads = GradientsParams::from_module(&mut grads, &head);
                head_optimizer.apply(head_lr, head, head_grads)
            });
        }

        driver.ema.update(&unwrap_model(&model))?;
    } else {
        driver.skipped += 1;
        warn!("Non-finite loss at step {step}; skipping the update");
    }

    driver.scheduler.step_update(step + 1);
    Ok((model, loss_value))
}

/// Task-specific loss of one batch
fn batch_loss<B: AutodiffBackend>(
    components: &TaskComponents<B>,
    model: &VisionNet<B>,
    batch: &ImageBatch<B>,
) -> Result<Tensor<B, 1>> {
    let output = model.forward(batch.images.clone());
    match components {
        TaskComponents::Classification { loss, .. } => Ok(loss.forward(output, batch.targets.clone())),
        TaskComponents::Metric { miner, loss, .. } => {
            let pairs = miner.mine(&output, &batch.labels)?;
            Ok(loss.forward(output, &batch.labels, batch.targets.clone(), &pairs))
        }
    }
}

fn write_previews<B: AutodiffBackend, S: SummarySink>(
    sink: &mut S,
    batch: &ImageBatch<B>,
    names: &[String],
    epoch: usize,
) {
    match batch_grids(batch, names, PER_CLASS) {
        Ok(grids) => {
            for (name, grid) in grids {
                sink.add_image(&format!("Train/{name}"), &grid, epoch);
            }
        }
        Err(e) => warn!("Skipping augmentation preview: {e}"),
    }
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    match ProgressStyle::default_bar()
        .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        Ok(style) => bar.set_style(style.progress_chars("#>-")),
        Err(e) => warn!("Invalid progress template: {e}"),
    }
    bar
}
