//! Task dispatch: everything that differs between classification and
//! metric learning is built here, once, before the first epoch.

use burn::tensor::backend::{AutodiffBackend, Backend};
use tracing::info;
use vision_core::{Error, Result, RunConfig, SplitMode, TaskKind};
use vision_dataset::{BatchLoader, ImageDataset, Manifest, Sampler};

use crate::loss::{ClassificationLoss, LossKind, MetricLoss};
use crate::miner::MultiSimilarityMiner;
use crate::model::Backbone;

/// Task of a model, decided by its embedding capability alone
pub fn task_of<B: Backend, M: Backbone<B>>(model: &M) -> TaskKind {
    TaskKind::from_embedding_size(model.embedding_size())
}

/// Collaborators that exist for one task only
pub enum TaskComponents<B: AutodiffBackend> {
    Classification {
        val: BatchLoader<B::InnerBackend>,
        loss: ClassificationLoss<B>,
    },
    Metric {
        /// Train split with the eval transform, embedded as the gallery
        gallery: ImageDataset,
        /// Val split, embedded as queries
        queries: ImageDataset,
        miner: MultiSimilarityMiner,
        loss: MetricLoss<B>,
    },
}

/// Task kind, training loader and task-specific collaborators of a run
pub struct TaskSetup<B: AutodiffBackend> {
    pub task: TaskKind,
    pub loss_kind: LossKind,
    pub train: BatchLoader<B>,
    pub components: TaskComponents<B>,
}

impl<B: AutodiffBackend> TaskSetup<B> {
    /// Resolves the loss against `task` before touching any data, then
    /// builds the datasets and loaders of the split.
    pub fn build(
        cfg: &RunConfig,
        manifest: &Manifest,
        task: TaskKind,
        embedding_size: Option<usize>,
        device: &B::Device,
    ) -> Result<Self> {
        let loss_kind = LossKind::for_task(&cfg.models.loss, task)?;
        let ds = &cfg.dataset;
        let dims = ds.dimensions();

        let train_set = ImageDataset::from_manifest(manifest, SplitMode::Train, ds.ratio, dims);
        let val_set = ImageDataset::from_manifest(manifest, SplitMode::Val, ds.ratio, dims);
        if train_set.samples().is_empty() {
            return Err(Error::Dataset(format!(
                "train split of {} is empty",
                ds.txt.display()
            )));
        }
        info!(
            "{task} task with '{loss_kind}' loss: {} train / {} val samples",
            train_set.samples().len(),
            val_set.samples().len()
        );

        let sampler = Sampler::for_training(ds.sampler, &train_set.labels(), cfg.train.seed);
        let train = BatchLoader::new(train_set.clone(), sampler, ds.batch, device.clone())
            .with_workers(ds.workers)?;

        let components = match task {
            TaskKind::Classification => TaskComponents::Classification {
                val: BatchLoader::sequential(val_set, ds.batch, device.clone())
                    .with_workers(ds.workers)?,
                loss: ClassificationLoss::new(loss_kind, device)?,
            },
            TaskKind::Metric => {
                let embedding_size = embedding_size.filter(|&e| e > 0).ok_or_else(|| {
                    Error::Config("metric task requires a positive embedding size".into())
                })?;
                TaskComponents::Metric {
                    gallery: train_set.without_augmentation(),
                    queries: val_set,
                    miner: MultiSimilarityMiner::default(),
                    loss: MetricLoss::new(loss_kind, cfg.num_classes(), embedding_size, device)?,
                }
            }
        };

        Ok(Self {
            task,
            loss_kind,
            train,
            components,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{VisionNet, VisionNetConfig};
    use burn::backend::Autodiff;
    use burn::module::Module;
    use burn::nn::{Linear, LinearConfig};
    use burn::tensor::Tensor;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use vision_core::{DataSetConfig, ModelsConfig, TrainConfig};
    use vision_dataset::LabelVocabulary;

    type TestBackend = Autodiff<NdArray>;

    /// Reports a fixed embedding size
    #[derive(Module, Debug)]
    struct StubBackbone<B: Backend> {
        linear: Linear<B>,
        reported: usize,
    }

    impl<B: Backend> Backbone<B> for StubBackbone<B> {
        fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
            self.linear.forward(images.flatten(1, 3))
        }

        fn embedding_size(&self) -> Option<usize> {
            Some(self.reported)
        }
    }

    fn stub(reported: usize) -> StubBackbone<NdArray> {
        StubBackbone {
            linear: LinearConfig::new(2, 2).init(&NdArrayDevice::Cpu),
            reported,
        }
    }

    #[test]
    fn test_dispatch_follows_embedding_size() {
        assert_eq!(task_of(&stub(16)), TaskKind::Metric);
        assert_eq!(task_of(&stub(0)), TaskKind::Classification);

        let classifier: VisionNet<NdArray> = VisionNetConfig::new(3).init(&NdArrayDevice::Cpu);
        assert_eq!(task_of(&classifier), TaskKind::Classification);
    }

    fn run_config(loss: &str) -> RunConfig {
        RunConfig {
            dataset: DataSetConfig {
                labels: vec!["a".into(), "b".into()],
                ratio: 0.5,
                ..Default::default()
            },
            models: ModelsConfig {
                backbone: "cnn".into(),
                loss: loss.into(),
                ..Default::default()
            },
            train: TrainConfig::default(),
        }
    }

    #[test]
    fn test_mismatched_loss_fails_before_data() {
        let vocab = LabelVocabulary::new(vec!["a".into(), "b".into()]).unwrap();
        // unreadable paths: nothing may be decoded before the loss is checked
        let manifest = Manifest::parse(
            "missing/a.png,0\nmissing/b.png,1\n",
            std::path::Path::new("."),
            &vocab,
        )
        .unwrap();

        let result = TaskSetup::<TestBackend>::build(
            &run_config("arcface"),
            &manifest,
            TaskKind::Classification,
            None,
            &NdArrayDevice::Cpu,
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let result = TaskSetup::<TestBackend>::build(
            &run_config("focal"),
            &manifest,
            TaskKind::Metric,
            Some(8),
            &NdArrayDevice::Cpu,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builds_metric_components() {
        let vocab = LabelVocabulary::new(vec!["a".into(), "b".into()]).unwrap();
        let manifest = Manifest::parse(
            "a0.png,0\na1.png,0\na2.png,0\nb0.png,1\nb1.png,1\nb2.png,1\n",
            std::path::Path::new("/data"),
            &vocab,
        )
        .unwrap();

        let setup = TaskSetup::<TestBackend>::build(
            &run_config("circleloss"),
            &manifest,
            TaskKind::Metric,
            Some(8),
            &NdArrayDevice::Cpu,
        )
        .unwrap();

        assert_eq!(setup.loss_kind, LossKind::Circle);
        assert_eq!(setup.train.num_samples(), 6 - 2);
        match setup.components {
            TaskComponents::Metric { gallery, queries, .. } => {
                assert_eq!(gallery.samples().len(), 4);
                assert_eq!(queries.samples().len(), 2);
            }
            TaskComponents::Classification { .. } => panic!("expected metric components"),
        }
    }
}
