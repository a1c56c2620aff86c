//! Exponential moving average of model parameters.

use std::collections::HashMap;
use std::marker::PhantomData;

use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use vision_core::{Error, Result};

/// The plain parameter set of a training model, detached from autodiff.
///
/// The shadow model is always kept in this form; it is never a target of
/// gradient descent.
pub fn unwrap_model<B: AutodiffBackend, M: AutodiffModule<B>>(model: &M) -> M::InnerModule {
    model.valid()
}

/// Trailing average of a live model: `shadow = d * shadow + (1 - d) * live`
/// for every float parameter, applied once per optimizer step.
pub struct ModelEma<B: Backend, M: Module<B>> {
    shadow: M,
    decay: f64,
    updates: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: Module<B>> ModelEma<B, M> {
    /// Starts from an exact copy of the live model's parameters
    pub fn new(shadow: M, decay: f64) -> Self {
        Self {
            shadow,
            decay,
            updates: 0,
            _backend: PhantomData,
        }
    }

    /// Number of updates applied so far
    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn shadow(&self) -> &M {
        &self.shadow
    }

    /// Blends `live` into the shadow. Parameters are matched by id, so
    /// `live` must descend from the module the shadow was copied from.
    pub fn update(&mut self, live: &M) -> Result<()> {
        let mut collector = ParamCollector::default();
        live.visit(&mut collector);

        let mut blend = EmaBlend {
            live: collector.params,
            decay: self.decay,
            missing: 0,
        };
        let shadow = self.shadow.clone().map(&mut blend);

        if blend.missing > 0 || !blend.live.is_empty() {
            return Err(Error::Model(format!(
                "shadow model diverged from live model: {} shadow parameters unmatched, {} live parameters unused",
                blend.missing,
                blend.live.len()
            )));
        }
        self.shadow = shadow;
        self.updates += 1;
        Ok(())
    }
}

/// Flattened float parameters keyed by id
struct ParamCollector<B: Backend> {
    params: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> Default for ParamCollector<B> {
    fn default() -> Self {
        Self {
            params: HashMap::new(),
        }
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let numel = tensor.shape().num_elements();
        self.params.insert(id, tensor.clone().reshape([numel]));
    }
}

struct EmaBlend<B: Backend> {
    live: HashMap<ParamId, Tensor<B, 1>>,
    decay: f64,
    missing: usize,
}

impl<B: Backend> ModuleMapper<B> for EmaBlend<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.live.remove(&id) {
            Some(live) => {
                let shape = tensor.shape();
                tensor.mul_scalar(self.decay) + live.reshape(shape).mul_scalar(1.0 - self.decay)
            }
            None => {
                self.missing += 1;
                tensor
            }
        }
    }
}
