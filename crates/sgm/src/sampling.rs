//! Reverse-time SDE samplers.

use burn::prelude::*;
use burn::tensor::Distribution;

use crate::error::SgmError;
use crate::model::unet::ScoreUNet;
use crate::sde::Sde;
use crate::training::loss::score_fn;

/// Draws pair maps from a trained score network.
pub trait Sampler<B: Backend> {
    /// Generate one sample per context row. Returns the sample and the number
    /// of network evaluations used.
    fn sample(
        &self,
        model: &ScoreUNet<B>,
        context: Tensor<B, 3>,
    ) -> Result<(Tensor<B, 4>, usize), SgmError>;
}

/// Euler–Maruyama integration of the reverse SDE from `t = 1` to
/// `sampling_eps`.
#[derive(Debug, Clone)]
pub struct EulerMaruyamaSampler {
    sde: Sde,
    num_channels: usize,
    resolution: usize,
    steps: usize,
}

impl EulerMaruyamaSampler {
    /// One step per discrete noise scale of `sde`.
    pub fn new(sde: Sde, num_channels: usize, resolution: usize) -> Self {
        let steps = sde.num_scales();
        Self {
            sde,
            num_channels,
            resolution,
            steps,
        }
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    fn timesteps(&self) -> Vec<f64> {
        let (start, end) = (self.sde.t_max(), self.sde.sampling_eps());
        if self.steps == 1 {
            return vec![start];
        }
        let delta = (end - start) / (self.steps - 1) as f64;
        (0..self.steps).map(|i| start + delta * i as f64).collect()
    }
}

impl<B: Backend> Sampler<B> for EulerMaruyamaSampler {
    fn sample(
        &self,
        model: &ScoreUNet<B>,
        context: Tensor<B, 3>,
    ) -> Result<(Tensor<B, 4>, usize), SgmError> {
        if self.steps == 0 {
            return Err(SgmError::InvalidConfig(
                "sampler needs at least one step".to_string(),
            ));
        }
        let device = context.device();
        let [batch, _, _] = context.dims();
        let shape = [batch, self.num_channels, self.resolution, self.resolution];

        let dt = -1.0 / self.steps as f64;
        let mut x = self.sde.prior_sampling::<B>(shape, &device);
        let mut x_mean = x.clone();
        for t in self.timesteps() {
            let t_vec = Tensor::<B, 1>::full([batch], t, &device);
            let score = score_fn(model, &self.sde, x.clone(), t_vec, context.clone());
            let (drift, g) = self.sde.sde_coefficients(x.clone(), t);
            let drift = drift - score.mul_scalar(g * g);
            x_mean = x + drift.mul_scalar(dt);
            let z = Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device);
            x = x_mean.clone() + z.mul_scalar(g * (-dt).sqrt());
        }
        tracing::debug!(steps = self.steps, batch, "Reverse SDE integrated");
        Ok((x_mean, self.steps))
    }
}
