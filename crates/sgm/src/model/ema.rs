//! Exponential moving average of model parameters.
//!
//! The shadow copy lives on the inner (non-autodiff) backend. Parameters are
//! matched by visit order, which is stable for a given architecture and does
//! not depend on parameter ids surviving a checkpoint round trip.

use std::marker::PhantomData;

use burn::module::{AutodiffModule, ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

/// Flattens every float parameter of a module, in visit order.
struct ParamCollector<B: Backend> {
    tensors: Vec<Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.tensors.push(tensor.clone().flatten::<1>(0, D - 1));
    }
}

/// Replaces every float parameter with `decay · shadow + (1 − decay) · live`.
/// Shadow parameters with no live counterpart are kept and counted.
struct EmaBlend<B: Backend> {
    live: std::vec::IntoIter<Tensor<B, 1>>,
    decay: f64,
    unmatched: usize,
}

impl<B: Backend> ModuleMapper<B> for EmaBlend<B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.live.next() {
            Some(live) => {
                let live: Tensor<B, D> = live.reshape(tensor.shape());
                tensor.mul_scalar(self.decay) + live.mul_scalar(1.0 - self.decay)
            }
            None => {
                self.unmatched += 1;
                tensor
            }
        }
    }
}

/// Collect a module's float parameters in visit order, flattened.
pub fn collect_params<B: Backend, M: Module<B>>(module: &M) -> Vec<Tensor<B, 1>> {
    let mut collector = ParamCollector { tensors: Vec::new() };
    module.visit(&mut collector);
    collector.tensors
}

/// Shape of every float parameter, in visit order.
pub fn param_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    struct Shapes(Vec<Vec<usize>>);
    impl<B: Backend> ModuleVisitor<B> for Shapes {
        fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
            self.0.push(tensor.dims().to_vec());
        }
    }
    let mut shapes = Shapes(Vec::new());
    module.visit(&mut shapes);
    shapes.0
}

/// EMA shadow of an autodiff module `M`.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage<B: AutodiffBackend, M: AutodiffModule<B>> {
    shadow: M::InnerModule,
    decay: f64,
    num_updates: u64,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> ExponentialMovingAverage<B, M> {
    /// Start the average at the model's current parameters.
    pub fn new(model: &M, decay: f64) -> Self {
        Self {
            shadow: model.valid(),
            decay,
            num_updates: 0,
            _backend: PhantomData,
        }
    }

    /// Rebuild from a restored shadow and update count.
    pub fn from_parts(shadow: M::InnerModule, decay: f64, num_updates: u64) -> Self {
        Self {
            shadow,
            decay,
            num_updates,
            _backend: PhantomData,
        }
    }

    /// Effective decay for the next update: `min(decay, (1 + n) / (10 + n))`.
    pub fn current_decay(&self) -> f64 {
        let n = self.num_updates as f64;
        self.decay.min((1.0 + n) / (10.0 + n))
    }

    /// Blend the live parameters of `model` into the shadow.
    pub fn update(&mut self, model: &M) {
        let decay = self.current_decay();
        let live = collect_params(&model.valid());
        let live_count = live.len();
        let mut blend = EmaBlend {
            live: live.into_iter(),
            decay,
            unmatched: 0,
        };
        self.shadow = self.shadow.clone().map(&mut blend);
        let leftover = blend.live.len();
        if blend.unmatched > 0 || leftover > 0 {
            tracing::error!(
                live = live_count,
                unmatched_shadow = blend.unmatched,
                unmatched_live = leftover,
                "EMA shadow and model parameters are out of step"
            );
        }
        debug_assert!(
            blend.unmatched == 0 && leftover == 0,
            "EMA parameter mismatch: {} shadow and {leftover} live parameters unmatched",
            blend.unmatched
        );
        self.num_updates += 1;
    }

    /// Run `f` with the EMA weights. The live model is never touched.
    pub fn with_ema_weights<R>(&self, f: impl FnOnce(&M::InnerModule) -> R) -> R {
        f(&self.shadow)
    }

    pub fn shadow(&self) -> &M::InnerModule {
        &self.shadow
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }
}
