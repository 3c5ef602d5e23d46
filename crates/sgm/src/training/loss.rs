//! Denoising score matching.
//!
//! Generic over `B: Backend`; the train step runs it on the autodiff backend,
//! the eval step on the inner backend.

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::model::unet::ScoreUNet;
use crate::sde::{per_sample, Sde, SdeKind};
use crate::training::data::ProteinBatch;

/// Smallest diffusion time drawn for training.
pub const TRAIN_EPS: f64 = 1e-5;

/// Score `∇ log p_t(x)` predicted by `model` at times `t`.
///
/// VP networks predict noise, so their output is scaled by `-1/std(t)`; VE
/// networks predict the score directly.
pub fn score_fn<B: Backend>(
    model: &ScoreUNet<B>,
    sde: &Sde,
    x: Tensor<B, 4>,
    t: Tensor<B, 1>,
    context: Tensor<B, 3>,
) -> Tensor<B, 4> {
    let labels = sde.timestep_labels(t.clone());
    let out = model.forward(x, labels, context);
    match sde.kind() {
        SdeKind::Vp => out.neg() / per_sample(sde.std_at(t)),
        SdeKind::Ve => out,
    }
}

/// Times and Gaussian noise for one loss evaluation.
#[derive(Debug, Clone)]
pub struct DsmNoise<B: Backend> {
    /// `(batch,)`, uniform in `[TRAIN_EPS, 1)`.
    pub t: Tensor<B, 1>,
    /// Same shape as the clean sample.
    pub z: Tensor<B, 4>,
}

impl<B: Backend> DsmNoise<B> {
    /// Draw `t` and `z` from a host RNG so the draw depends only on its seed.
    pub fn sample(shape: [usize; 4], rng: &mut impl Rng, device: &B::Device) -> Self {
        let [batch, ..] = shape;
        let t: Vec<f32> = (0..batch)
            .map(|_| rng.gen_range(TRAIN_EPS..1.0) as f32)
            .collect();
        let numel = shape.iter().product();
        let z: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
        Self {
            t: Tensor::from_data(TensorData::new(t, [batch]), device),
            z: Tensor::from_data(TensorData::new(z, shape), device),
        }
    }
}

/// Masked denoising score-matching loss, shape `(1,)`.
///
/// ```text
/// x_t   = mean(x0, t) + std(t) · z        (known inpainting region keeps x0)
/// term  = ‖score · std + z‖²              (λ = std²)
///       | ‖score + z / std‖² · g(t)²      (likelihood weighting)
/// loss  = mean_b [ Σ mask · term / max(Σ mask, 1) ]
/// ```
///
/// The mask is the valid-pair mask times the inpainting mask, broadcast over
/// channels. An all-zero mask yields exactly zero.
pub fn dsm_loss<B: Backend>(
    model: &ScoreUNet<B>,
    sde: &Sde,
    batch: &ProteinBatch<B>,
    context: Tensor<B, 3>,
    noise: DsmNoise<B>,
    likelihood_weighting: bool,
) -> Tensor<B, 1> {
    let x0 = batch.coords_6d.clone();
    let [size, channels, rows, cols] = x0.dims();
    let DsmNoise { t, z } = noise;

    let (mean, std) = sde.marginal_prob(x0.clone(), t.clone());
    let std4 = per_sample(std.clone());
    let mut x_t = mean + z.clone() * std4.clone();
    if let Some(inpaint) = &batch.inpaint {
        let generate = inpaint.clone().unsqueeze_dim::<4>(1);
        x_t = x_t * generate.clone() + x0 * generate.neg().add_scalar(1.0);
    }

    let score = score_fn(model, sde, x_t, t.clone(), context);
    let term = if likelihood_weighting {
        let g2 = per_sample(sde.diffusion_sq(t));
        (score + z / std4).powf_scalar(2.0) * g2
    } else {
        (score * std4 + z).powf_scalar(2.0)
    };

    let mask = batch
        .pair_mask()
        .unsqueeze_dim::<4>(1)
        .repeat_dim(1, channels);
    let flat = channels * rows * cols;
    let total = (term * mask.clone()).reshape([size, flat]).sum_dim(1);
    let count = mask.reshape([size, flat]).sum_dim(1).clamp_min(1.0);
    (total / count).reshape([size]).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::unet::ScoreNetConfig;
    use crate::training::data::collate;
    use crate::training::data::tests::make_record;
    use burn::backend::ndarray::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn setup(sde_kind: &str) -> (ScoreUNet<TestBackend>, Sde, ProteinBatch<TestBackend>) {
        let device = Default::default();
        let config = ScoreNetConfig::new()
            .with_nf(8)
            .with_ch_mult(vec![1, 2])
            .with_num_res_blocks(1)
            .with_context_dim(4)
            .with_attn_heads(1)
            .with_attn_head_dim(8)
            .with_num_scales(20)
            .with_sigma_max(5.0)
            .with_init_scale(1.0)
            .with_scale_by_sigma(sde_kind == "vesde");
        let sde = Sde::from_config(
            sde_kind,
            config.beta_min,
            config.beta_max,
            config.sigma_min,
            config.sigma_max,
            config.num_scales,
        )
        .unwrap();
        let model = config.init::<TestBackend>(2, &sde, &device).unwrap();
        let a = make_record("a", 6, 2);
        let b = make_record("b", 8, 2);
        let batch = collate(&[&a, &b], 2, 8, &device);
        (model, sde, batch)
    }

    fn context(batch: usize) -> Tensor<TestBackend, 3> {
        Tensor::zeros([batch, 1, 4], &Default::default())
    }

    #[test]
    fn test_loss_is_finite_and_positive() {
        for kind in ["vesde", "vpsde"] {
            let (model, sde, batch) = setup(kind);
            let mut rng = StdRng::seed_from_u64(1);
            let noise = DsmNoise::sample([2, 2, 8, 8], &mut rng, &Default::default());
            for weighting in [false, true] {
                let loss = dsm_loss(&model, &sde, &batch, context(2), noise.clone(), weighting);
                assert_eq!(loss.dims(), [1]);
                let value: f32 = loss.into_scalar();
                assert!(value.is_finite() && value > 0.0, "{kind}/{weighting}: loss={value}");
            }
        }
    }

    #[test]
    fn test_all_zero_mask_gives_zero_loss() {
        let (model, sde, mut batch) = setup("vesde");
        batch.mask = batch.mask.zeros_like();
        let mut rng = StdRng::seed_from_u64(2);
        let noise = DsmNoise::sample([2, 2, 8, 8], &mut rng, &Default::default());
        let loss: f32 = dsm_loss(&model, &sde, &batch, context(2), noise, false).into_scalar();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_loss_is_batch_mean_of_per_sample_means() {
        let (model, sde, batch) = setup("vesde");
        let mut rng = StdRng::seed_from_u64(3);
        let noise = DsmNoise::sample([2, 2, 8, 8], &mut rng, &Default::default());
        let device = Default::default();

        let with_mask = |keep: [f32; 2]| {
            let mut masked = batch.clone();
            let scale = Tensor::<TestBackend, 1>::from_data(TensorData::from(keep), &device);
            masked.mask = batch.mask.clone() * scale.unsqueeze_dim::<2>(1);
            let loss: f32 =
                dsm_loss(&model, &sde, &masked, context(2), noise.clone(), false).into_scalar();
            loss
        };

        let full = with_mask([1.0, 1.0]);
        let first = with_mask([1.0, 0.0]);
        let second = with_mask([0.0, 1.0]);
        assert!(
            (full - (first + second)).abs() / full < 1e-4,
            "full={full} first={first} second={second}"
        );
    }

    #[test]
    fn test_noise_draw_is_reproducible() {
        let device = Default::default();
        let a = DsmNoise::<TestBackend>::sample([2, 1, 2, 2], &mut StdRng::seed_from_u64(9), &device);
        let b = DsmNoise::<TestBackend>::sample([2, 1, 2, 2], &mut StdRng::seed_from_u64(9), &device);
        let ta: Vec<f32> = a.t.into_data().to_vec().unwrap();
        let tb: Vec<f32> = b.t.into_data().to_vec().unwrap();
        assert_eq!(ta, tb);
        assert!(ta.iter().all(|&t| (TRAIN_EPS as f32..1.0).contains(&t)));
        let za: Vec<f32> = a.z.into_data().to_vec().unwrap();
        let zb: Vec<f32> = b.z.into_data().to_vec().unwrap();
        assert_eq!(za, zb);
    }

    #[test]
    fn test_inpainting_restricts_loss_region() {
        let (model, sde, mut batch) = setup("vesde");
        let mut rng = StdRng::seed_from_u64(4);
        let noise = DsmNoise::sample([2, 2, 8, 8], &mut rng, &Default::default());
        batch.inpaint = Some(Tensor::zeros([2, 8, 8], &Default::default()));
        let loss: f32 = dsm_loss(&model, &sde, &batch, context(2), noise, false).into_scalar();
        assert_eq!(loss, 0.0, "nothing to generate means nothing to score");
    }
}
