//! Forward noising processes and their discretisations.
//!
//! Two schedule families are supported:
//!
//! ```text
//! VP:  dx = -½ β(t) x dt + √β(t) dw        β(t) = β_min + t (β_max − β_min)
//! VE:  dx = σ(t) √(2 ln(σ_max/σ_min)) dw   σ(t) = σ_min (σ_max/σ_min)^t
//! ```
//!
//! Each schedule also carries a discretised noise-scale table of length `N`
//! indexed by the integer timestep label the score network is queried with.

use std::str::FromStr;

use burn::prelude::*;
use burn::tensor::Distribution;

use crate::error::SgmError;

/// Which SDE family to train with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdeKind {
    /// Variance preserving (DDPM-like) schedule.
    Vp,
    /// Variance exploding (NCSN-like) schedule.
    Ve,
}

impl FromStr for SdeKind {
    type Err = SgmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vpsde" | "vp" => Ok(Self::Vp),
            "vesde" | "ve" => Ok(Self::Ve),
            _ => Err(SgmError::UnknownSde(s.to_string())),
        }
    }
}

impl std::fmt::Display for SdeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vp => write!(f, "vpsde"),
            Self::Ve => write!(f, "vesde"),
        }
    }
}

/// Variance-preserving schedule with linearly interpolated β.
#[derive(Debug, Clone)]
pub struct VpSde {
    pub beta_min: f64,
    pub beta_max: f64,
    pub num_scales: usize,
    discrete_betas: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
}

impl VpSde {
    pub fn new(beta_min: f64, beta_max: f64, num_scales: usize) -> Self {
        let n = num_scales as f64;
        let discrete_betas = linspace(beta_min / n, beta_max / n, num_scales);
        let mut cumprod = 1.0;
        let sqrt_one_minus_alphas_cumprod = discrete_betas
            .iter()
            .map(|beta| {
                cumprod *= 1.0 - beta;
                (1.0 - cumprod).sqrt()
            })
            .collect();
        Self {
            beta_min,
            beta_max,
            num_scales,
            discrete_betas,
            sqrt_one_minus_alphas_cumprod,
        }
    }

    pub fn beta(&self, t: f64) -> f64 {
        self.beta_min + t * (self.beta_max - self.beta_min)
    }

    fn log_mean_coeff(&self, t: f64) -> f64 {
        -0.25 * t * t * (self.beta_max - self.beta_min) - 0.5 * t * self.beta_min
    }
}

/// Variance-exploding schedule with geometrically growing σ.
#[derive(Debug, Clone)]
pub struct VeSde {
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub num_scales: usize,
    /// Ascending: `discrete_sigmas[0] == sigma_min`.
    discrete_sigmas: Vec<f64>,
}

impl VeSde {
    pub fn new(sigma_min: f64, sigma_max: f64, num_scales: usize) -> Self {
        let discrete_sigmas = linspace(sigma_min.ln(), sigma_max.ln(), num_scales)
            .into_iter()
            .map(f64::exp)
            .collect();
        Self {
            sigma_min,
            sigma_max,
            num_scales,
            discrete_sigmas,
        }
    }

    pub fn sigma(&self, t: f64) -> f64 {
        self.sigma_min * (self.sigma_max / self.sigma_min).powf(t)
    }

    fn log_ratio(&self) -> f64 {
        (self.sigma_max / self.sigma_min).ln()
    }
}

/// A forward noising process.
#[derive(Debug, Clone)]
pub enum Sde {
    Vp(VpSde),
    Ve(VeSde),
}

impl Sde {
    /// Build the schedule selected by `kind` (case-insensitive string).
    ///
    /// Fails before anything is allocated when the kind is unknown or the
    /// parameters cannot define a schedule.
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        kind: &str,
        beta_min: f64,
        beta_max: f64,
        sigma_min: f64,
        sigma_max: f64,
        num_scales: usize,
    ) -> Result<Self, SgmError> {
        if num_scales < 2 {
            return Err(SgmError::InvalidConfig(format!(
                "model.num_scales must be at least 2, got {num_scales}"
            )));
        }
        match kind.parse::<SdeKind>()? {
            SdeKind::Vp => {
                if !(0.0 < beta_min && beta_min < beta_max) {
                    return Err(SgmError::InvalidConfig(format!(
                        "VP schedule needs 0 < beta_min < beta_max, got {beta_min}..{beta_max}"
                    )));
                }
                Ok(Self::Vp(VpSde::new(beta_min, beta_max, num_scales)))
            }
            SdeKind::Ve => {
                if !(0.0 < sigma_min && sigma_min < sigma_max) {
                    return Err(SgmError::InvalidConfig(format!(
                        "VE schedule needs 0 < sigma_min < sigma_max, got {sigma_min}..{sigma_max}"
                    )));
                }
                Ok(Self::Ve(VeSde::new(sigma_min, sigma_max, num_scales)))
            }
        }
    }

    pub fn kind(&self) -> SdeKind {
        match self {
            Self::Vp(_) => SdeKind::Vp,
            Self::Ve(_) => SdeKind::Ve,
        }
    }

    /// Number of discretisation steps `N`.
    pub fn num_scales(&self) -> usize {
        match self {
            Self::Vp(vp) => vp.num_scales,
            Self::Ve(ve) => ve.num_scales,
        }
    }

    /// End time of the forward process.
    pub fn t_max(&self) -> f64 {
        1.0
    }

    /// Smallest time the reverse sampler integrates down to.
    pub fn sampling_eps(&self) -> f64 {
        match self {
            Self::Vp(_) => 1e-3,
            Self::Ve(_) => 1e-5,
        }
    }

    /// Coefficient `a(t)` of the marginal mean `a(t) · x0`.
    pub fn mean_coeff(&self, t: f64) -> f64 {
        match self {
            Self::Vp(vp) => vp.log_mean_coeff(t).exp(),
            Self::Ve(_) => 1.0,
        }
    }

    /// Standard deviation of the marginal `p_t(x | x0)`.
    pub fn marginal_std(&self, t: f64) -> f64 {
        match self {
            Self::Vp(vp) => (1.0 - (2.0 * vp.log_mean_coeff(t)).exp()).sqrt(),
            Self::Ve(ve) => ve.sigma(t),
        }
    }

    /// Diffusion coefficient `g(t)`.
    pub fn diffusion_coeff(&self, t: f64) -> f64 {
        match self {
            Self::Vp(vp) => vp.beta(t).sqrt(),
            Self::Ve(ve) => ve.sigma(t) * (2.0 * ve.log_ratio()).sqrt(),
        }
    }

    /// Closed-form mean and per-sample std of the forward marginal.
    ///
    /// `x0`: `(batch, C, L, L)`, `t`: `(batch,)`. Returns the mean with the
    /// shape of `x0` and the std with shape `(batch,)`.
    pub fn marginal_prob<B: Backend>(
        &self,
        x0: Tensor<B, 4>,
        t: Tensor<B, 1>,
    ) -> (Tensor<B, 4>, Tensor<B, 1>) {
        match self {
            Self::Vp(vp) => {
                let log_mean_coeff = t
                    .clone()
                    .powf_scalar(2.0)
                    .mul_scalar(-0.25 * (vp.beta_max - vp.beta_min))
                    + t.mul_scalar(-0.5 * vp.beta_min);
                let mean = x0 * per_sample(log_mean_coeff.clone().exp());
                let std = (log_mean_coeff.mul_scalar(2.0).exp().neg().add_scalar(1.0)).sqrt();
                (mean, std)
            }
            Self::Ve(ve) => {
                let std = t.mul_scalar(ve.log_ratio()).exp().mul_scalar(ve.sigma_min);
                (x0, std)
            }
        }
    }

    /// Per-sample marginal std at times `t`: `(batch,)` → `(batch,)`.
    pub fn std_at<B: Backend>(&self, t: Tensor<B, 1>) -> Tensor<B, 1> {
        let x0 = Tensor::<B, 4>::zeros([t.dims()[0], 1, 1, 1], &t.device());
        self.marginal_prob(x0, t).1
    }

    /// Squared diffusion `g(t)²` per sample, used for likelihood weighting.
    pub fn diffusion_sq<B: Backend>(&self, t: Tensor<B, 1>) -> Tensor<B, 1> {
        match self {
            Self::Vp(vp) => t.mul_scalar(vp.beta_max - vp.beta_min).add_scalar(vp.beta_min),
            Self::Ve(ve) => {
                let sigma = t.mul_scalar(ve.log_ratio()).exp().mul_scalar(ve.sigma_min);
                sigma.powf_scalar(2.0).mul_scalar(2.0 * ve.log_ratio())
            }
        }
    }

    /// Drift and diffusion of the forward SDE at a time shared by the batch.
    pub fn sde_coefficients<B: Backend>(&self, x: Tensor<B, 4>, t: f64) -> (Tensor<B, 4>, f64) {
        match self {
            Self::Vp(vp) => (x.mul_scalar(-0.5 * vp.beta(t)), self.diffusion_coeff(t)),
            Self::Ve(_) => (x.zeros_like(), self.diffusion_coeff(t)),
        }
    }

    /// Discrete-step form `x_{i+1} = x_i + f_i + G_i z_i` at time `t`.
    pub fn discretize<B: Backend>(&self, x: Tensor<B, 4>, t: f64) -> (Tensor<B, 4>, f64) {
        let index = self.time_index(t);
        match self {
            Self::Vp(vp) => {
                let beta = vp.discrete_betas[index];
                let alpha = 1.0 - beta;
                (x.mul_scalar(alpha.sqrt() - 1.0), beta.sqrt())
            }
            Self::Ve(ve) => {
                let sigma = ve.discrete_sigmas[index];
                let adjacent = if index == 0 { 0.0 } else { ve.discrete_sigmas[index - 1] };
                (x.zeros_like(), (sigma * sigma - adjacent * adjacent).sqrt())
            }
        }
    }

    /// Draw from the stationary prior `p_1`.
    pub fn prior_sampling<B: Backend>(&self, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        let std = match self {
            Self::Vp(_) => 1.0,
            Self::Ve(ve) => ve.sigma_max,
        };
        Tensor::random(shape, Distribution::Normal(0.0, std), device)
    }

    /// Map continuous times to the network's integer timestep labels.
    ///
    /// VP counts up with `t`; VE counts down so that label 0 is `σ_max`.
    pub fn timestep_labels<B: Backend>(&self, t: Tensor<B, 1>) -> Tensor<B, 1> {
        let last = (self.num_scales() - 1) as f64;
        match self {
            Self::Vp(_) => t.mul_scalar(last),
            Self::Ve(_) => t
                .neg()
                .add_scalar(1.0)
                .mul_scalar(last)
                .add_scalar(0.5)
                .int()
                .float(),
        }
    }

    /// Noise scale at each timestep label, length `N`.
    pub fn noise_scales(&self) -> Vec<f32> {
        match self {
            Self::Vp(vp) => vp
                .sqrt_one_minus_alphas_cumprod
                .iter()
                .map(|&s| s as f32)
                .collect(),
            Self::Ve(ve) => ve.discrete_sigmas.iter().rev().map(|&s| s as f32).collect(),
        }
    }

    fn time_index(&self, t: f64) -> usize {
        let last = self.num_scales() - 1;
        ((t / self.t_max()) * last as f64).clamp(0.0, last as f64) as usize
    }
}

/// Reshape a per-sample `(batch,)` tensor so it broadcasts over `(batch, C, L, L)`.
pub fn per_sample<B: Backend>(values: Tensor<B, 1>) -> Tensor<B, 4> {
    let [batch] = values.dims();
    values.reshape([batch, 1, 1, 1])
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn vp() -> Sde {
        Sde::from_config("vpsde", 0.1, 20.0, 0.01, 50.0, 1000).unwrap()
    }

    fn ve() -> Sde {
        Sde::from_config("vesde", 0.1, 20.0, 0.01, 50.0, 1000).unwrap()
    }

    #[test]
    fn test_kind_parsing_is_case_insensitive() {
        assert_eq!("VPSDE".parse::<SdeKind>().unwrap(), SdeKind::Vp);
        assert_eq!("VeSde".parse::<SdeKind>().unwrap(), SdeKind::Ve);
        assert_eq!(" ve ".parse::<SdeKind>().unwrap(), SdeKind::Ve);
        let err = "subvpsde".parse::<SdeKind>().unwrap_err();
        assert!(err.to_string().contains("subvpsde"), "error should name the value: {err}");
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(Sde::from_config("vpsde", 20.0, 0.1, 0.01, 50.0, 1000).is_err());
        assert!(Sde::from_config("vesde", 0.1, 20.0, 0.0, 50.0, 1000).is_err());
        assert!(Sde::from_config("vesde", 0.1, 20.0, 0.01, 50.0, 1).is_err());
    }

    #[test]
    fn test_vp_variance_bounded() {
        let sde = vp();
        for i in 1..100 {
            let t = i as f64 / 100.0;
            let std = sde.marginal_std(t);
            assert!(std <= 1.0, "VP std must stay below 1, got {std} at t={t}");
            // Mean and std live on the unit circle for a VP process.
            let a = sde.mean_coeff(t);
            assert!((a * a + std * std - 1.0).abs() < 1e-9);
        }
        // Near t=1 the marginal is essentially the N(0, 1) prior.
        assert!(sde.marginal_std(1.0) > 0.99);
        assert!(sde.mean_coeff(1.0) < 0.01);
    }

    #[test]
    fn test_ve_variance_strictly_increasing() {
        let sde = ve();
        let mut prev = 0.0;
        for i in 1..100 {
            let t = i as f64 / 100.0;
            let std = sde.marginal_std(t);
            assert!(std > prev, "VE std must increase: {std} <= {prev} at t={t}");
            prev = std;
        }
        assert!((sde.marginal_std(1.0) - 50.0).abs() < 1e-9);

        // Larger sigma_max keeps growing the terminal variance without bound.
        let wider = Sde::from_config("vesde", 0.1, 20.0, 0.01, 5000.0, 1000).unwrap();
        assert!(wider.marginal_std(1.0) > 100.0 * sde.marginal_std(1.0) * 0.99);
    }

    #[test]
    fn test_marginal_prob_recovers_clean_signal_near_zero() {
        let device = Default::default();
        let x0 = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device);
        let t = Tensor::<TestBackend, 1>::from_data(TensorData::from([1e-6_f32, 1e-6]), &device);

        for sde in [vp(), ve()] {
            let (mean, std) = sde.marginal_prob(x0.clone(), t.clone());
            let mean_err: f32 = (mean - x0.clone()).abs().max().into_scalar().elem();
            let std_max: f32 = std.max().into_scalar().elem();
            assert!(mean_err < 1e-4, "{:?}: mean should equal x0, err={mean_err}", sde.kind());
            assert!(std_max < 0.02, "{:?}: std should vanish, got {std_max}", sde.kind());
        }
    }

    #[test]
    fn test_marginal_prob_tensor_matches_scalar_form() {
        let device = Default::default();
        let x0 = Tensor::<TestBackend, 4>::ones([3, 1, 1, 1], &device);
        let times = [0.1_f32, 0.5, 0.9];
        let t = Tensor::<TestBackend, 1>::from_data(TensorData::from(times), &device);

        for sde in [vp(), ve()] {
            let (mean, std) = sde.marginal_prob(x0.clone(), t.clone());
            let mean: Vec<f32> = mean.into_data().to_vec().unwrap();
            let std: Vec<f32> = std.into_data().to_vec().unwrap();
            for (i, &ti) in times.iter().enumerate() {
                let expected_std = sde.marginal_std(ti as f64) as f32;
                let expected_mean = sde.mean_coeff(ti as f64) as f32;
                assert!((std[i] - expected_std).abs() / expected_std < 1e-3);
                assert!((mean[i] - expected_mean).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_noise_scale_tables() {
        let sde = ve();
        let scales = sde.noise_scales();
        assert_eq!(scales.len(), 1000);
        assert!((scales[0] - 50.0).abs() < 1e-3, "label 0 is sigma_max");
        assert!((scales[999] - 0.01).abs() < 1e-6, "last label is sigma_min");

        let sde = vp();
        let scales = sde.noise_scales();
        assert_eq!(scales.len(), 1000);
        assert!(scales.windows(2).all(|w| w[0] < w[1]), "VP scales grow with t");
        assert!(scales[999] > 0.99);
    }

    #[test]
    fn test_timestep_labels() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_data(TensorData::from([1.0_f32, 0.5, 1e-5]), &device);

        let labels: Vec<f32> = ve().timestep_labels(t.clone()).into_data().to_vec().unwrap();
        assert_eq!(labels, vec![0.0, 500.0, 999.0]);

        let labels: Vec<f32> = vp().timestep_labels(t).into_data().to_vec().unwrap();
        assert!((labels[0] - 999.0).abs() < 1e-3);
        assert!((labels[1] - 499.5).abs() < 1e-3);
    }

    #[test]
    fn test_discretize_ve_first_step_has_no_predecessor() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let sde = ve();
        let (f, g) = sde.discretize(x, 0.0);
        let f_max: f32 = f.abs().max().into_scalar().elem();
        assert_eq!(f_max, 0.0);
        assert!((g - 0.01).abs() < 1e-9, "G at index 0 is sigma_min, got {g}");
    }

    #[test]
    fn test_tensor_coefficients_match_scalar_form() {
        let device = Default::default();
        let times = [0.2_f32, 0.7];
        let t = Tensor::<TestBackend, 1>::from_data(TensorData::from(times), &device);
        for sde in [vp(), ve()] {
            let g2: Vec<f32> = sde.diffusion_sq(t.clone()).into_data().to_vec().unwrap();
            let std: Vec<f32> = sde.std_at(t.clone()).into_data().to_vec().unwrap();
            for (i, &ti) in times.iter().enumerate() {
                let g = sde.diffusion_coeff(ti as f64);
                assert!(((g2[i] as f64) - g * g).abs() / (g * g) < 1e-4);
                let s = sde.marginal_std(ti as f64);
                assert!(((std[i] as f64) - s).abs() / s < 1e-4);
            }
        }
    }
}
