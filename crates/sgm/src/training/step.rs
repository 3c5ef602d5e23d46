//! One optimisation or evaluation step of the score model.

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::model::ema::ExponentialMovingAverage;
use crate::model::unet::ScoreUNet;
use crate::sde::Sde;
use crate::training::data::{step_rng, step_seed, ProteinBatch, RngStream};
use crate::training::loss::{dsm_loss, DsmNoise};

/// `[optim]` config section.
#[derive(Config, Debug)]
pub struct OptimConfig {
    /// Peak learning rate for Adam.
    #[config(default = 2e-4)]
    pub lr: f64,
    #[config(default = 0.9)]
    pub beta1: f64,
    #[config(default = 1e-8)]
    pub eps: f64,
    /// Decoupled L2 penalty. 0 disables it.
    #[config(default = 0.0)]
    pub weight_decay: f64,
    /// Number of linear warmup steps. 0 disables warmup.
    #[config(default = 5000)]
    pub warmup: usize,
    /// Maximum global gradient norm. Non-positive disables clipping.
    #[config(default = 1.0)]
    pub grad_clip: f64,
}

impl OptimConfig {
    /// Adam with clipping and weight decay wired in.
    pub fn adam(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.beta1 as f32)
            .with_epsilon(self.eps as f32)
            .with_weight_decay(
                (self.weight_decay > 0.0).then(|| WeightDecayConfig::new(self.weight_decay as f32)),
            )
            .with_grad_clipping(
                (self.grad_clip > 0.0).then(|| GradientClippingConfig::Norm(self.grad_clip as f32)),
            )
    }
}

/// Learning rate at `step`: linear warmup to `base_lr`, then constant.
pub fn lr_schedule(base_lr: f64, warmup_steps: usize, step: usize) -> f64 {
    if warmup_steps > 0 && step < warmup_steps {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    } else {
        base_lr
    }
}

/// Everything a checkpoint persists.
pub struct TrainState<B: AutodiffBackend, O> {
    pub model: ScoreUNet<B>,
    pub optimizer: O,
    pub ema: ExponentialMovingAverage<B, ScoreUNet<B>>,
    /// Number of completed train steps.
    pub step: usize,
}

impl<B: AutodiffBackend, O: Optimizer<ScoreUNet<B>, B>> TrainState<B, O> {
    pub fn new(model: ScoreUNet<B>, optimizer: O, ema_rate: f64) -> Self {
        let ema = ExponentialMovingAverage::new(&model, ema_rate);
        Self {
            model,
            optimizer,
            ema,
            step: 0,
        }
    }
}

/// Train/eval step functions bound to a schedule and optimiser settings.
#[derive(Debug, Clone)]
pub struct StepFn {
    sde: Sde,
    optim: OptimConfig,
    likelihood_weighting: bool,
    seed: u64,
}

impl StepFn {
    pub fn new(sde: Sde, optim: OptimConfig, likelihood_weighting: bool, seed: u64) -> Self {
        Self {
            sde,
            optim,
            likelihood_weighting,
            seed,
        }
    }

    pub fn sde(&self) -> &Sde {
        &self.sde
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        lr_schedule(self.optim.lr, self.optim.warmup, step)
    }

    /// One gradient update. Advances `state.step` by exactly one.
    ///
    /// Noise is drawn from the `(seed, state.step)` stream and the backend RNG
    /// is reseeded from the same pair before the forward pass, so replaying a
    /// step after resume reproduces its dropout masks too.
    pub fn train_step<B, O>(
        &self,
        state: &mut TrainState<B, O>,
        batch: &ProteinBatch<B>,
        context: Tensor<B, 3>,
    ) -> f64
    where
        B: AutodiffBackend,
        O: Optimizer<ScoreUNet<B>, B>,
    {
        let device = batch.coords_6d.device();
        B::seed(step_seed(self.seed, state.step, RngStream::Dropout));
        let mut rng = step_rng(self.seed, state.step, RngStream::TrainNoise);
        let noise = DsmNoise::sample(batch.coords_6d.dims(), &mut rng, &device);

        let loss = dsm_loss(
            &state.model,
            &self.sde,
            batch,
            context,
            noise,
            self.likelihood_weighting,
        );
        let loss_val: f64 = loss.clone().into_scalar().elem();
        if !loss_val.is_finite() {
            tracing::warn!(step = state.step, loss = loss_val, "Non-finite training loss");
        }

        let lr = self.lr_at(state.step);
        let grads = GradientsParams::from_grads(loss.backward(), &state.model);
        state.model = state.optimizer.step(lr, state.model.clone(), grads);
        state.ema.update(&state.model);
        state.step += 1;
        loss_val
    }

    /// Loss on `batch` without touching parameters, optimiser or EMA.
    pub fn eval_step<B, O>(
        &self,
        state: &TrainState<B, O>,
        batch: &ProteinBatch<B>,
        context: Tensor<B, 3>,
    ) -> f64
    where
        B: AutodiffBackend,
    {
        let batch = batch.inner();
        let device = batch.coords_6d.device();
        let mut rng = step_rng(self.seed, state.step, RngStream::EvalNoise);
        let noise = DsmNoise::sample(batch.coords_6d.dims(), &mut rng, &device);

        let model = state.model.valid();
        let loss = dsm_loss(
            &model,
            &self.sde,
            &batch,
            context.inner(),
            noise,
            self.likelihood_weighting,
        );
        let loss_val: f64 = loss.into_scalar().elem();
        if !loss_val.is_finite() {
            tracing::warn!(step = state.step, loss = loss_val, "Non-finite eval loss");
        }
        loss_val
    }
}
