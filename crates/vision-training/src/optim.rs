//! Optimizers selected by name.

use std::str::FromStr;

use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, AdamWConfig, GradientsParams, Optimizer, SgdConfig};
use burn::tensor::backend::AutodiffBackend;
use vision_core::{Error, Result};

/// Object-safe view of a burn [`Optimizer`] for one module type
pub trait ParamOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    /// One update of `module` with `grads` at learning rate `lr`
    fn apply(&mut self, lr: f64, module: M, grads: GradientsParams) -> M;
}

impl<B, M, O> ParamOptimizer<B, M> for O
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fn apply(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        self.step(lr, module, grads)
    }
}

/// `Models.optimizer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            other => Err(Error::Config(format!(
                "unknown optimizer '{other}' (expected sgd, adam or adamw)"
            ))),
        }
    }
}

impl OptimizerKind {
    /// Fresh optimizer state for module type `M`
    pub fn build<B, M>(&self) -> Box<dyn ParamOptimizer<B, M>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + 'static,
    {
        match self {
            OptimizerKind::Sgd => Box::new(
                SgdConfig::new()
                    .with_momentum(Some(MomentumConfig::new().with_momentum(0.9)))
                    .with_weight_decay(Some(WeightDecayConfig::new(1e-4)))
                    .init::<B, M>(),
            ),
            OptimizerKind::Adam => Box::new(
                AdamConfig::new()
                    .with_weight_decay(Some(WeightDecayConfig::new(1e-4)))
                    .init::<B, M>(),
            ),
            OptimizerKind::AdamW => Box::new(AdamWConfig::new().init::<B, M>()),
        }
    }
}
