//! Shared building blocks for the score network: activations, initialised
//! convolutions, resampling and time embeddings.

use std::str::FromStr;

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation;
use burn::tensor::{Distribution, TensorData};
use serde::{Deserialize, Serialize};

use crate::error::SgmError;

/// Pointwise nonlinearity used throughout the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Nonlinearity {
    Swish,
    Relu,
    LeakyRelu,
    Elu,
}

impl FromStr for Nonlinearity {
    type Err = SgmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "swish" | "silu" => Ok(Self::Swish),
            "relu" => Ok(Self::Relu),
            "lrelu" => Ok(Self::LeakyRelu),
            "elu" => Ok(Self::Elu),
            _ => Err(SgmError::UnknownActivation(s.to_string())),
        }
    }
}

impl Nonlinearity {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Self::Swish => activation::silu(x),
            Self::Relu => activation::relu(x),
            Self::LeakyRelu => x.clone().clamp_min(0.0) + x.clamp_max(0.0).mul_scalar(0.2),
            Self::Elu => x.clone().clamp_min(0.0) + x.clamp_max(0.0).exp().sub_scalar(1.0),
        }
    }
}

/// Direction of a resolution change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResampleDirection {
    Up,
    Down,
}

/// Variance-scaling (fan-avg, uniform) initializer with the given scale.
///
/// A scale of zero is clamped to `1e-10` so zero-initialised output layers
/// still carry a valid distribution.
pub fn default_init(scale: f64) -> Initializer {
    let scale = if scale == 0.0 { 1e-10 } else { scale };
    Initializer::XavierUniform { gain: scale.sqrt() }
}

fn zero_bias<B: Backend>(mut conv: Conv2d<B>) -> Conv2d<B> {
    conv.bias = conv.bias.map(|bias| bias.map(|t| t.zeros_like()));
    conv
}

/// 3×3 convolution, padding 1. With `stride = 2` it halves an even resolution.
pub fn conv3x3<B: Backend>(
    in_ch: usize,
    out_ch: usize,
    stride: usize,
    init_scale: f64,
    device: &B::Device,
) -> Conv2d<B> {
    let conv = Conv2dConfig::new([in_ch, out_ch], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_initializer(default_init(init_scale))
        .init(device);
    zero_bias(conv)
}

/// 1×1 convolution (network-in-network projection).
pub fn conv1x1<B: Backend>(
    in_ch: usize,
    out_ch: usize,
    init_scale: f64,
    device: &B::Device,
) -> Conv2d<B> {
    let conv = Conv2dConfig::new([in_ch, out_ch], [1, 1])
        .with_initializer(default_init(init_scale))
        .init(device);
    zero_bias(conv)
}

pub fn dense<B: Backend>(d_in: usize, d_out: usize, device: &B::Device) -> Linear<B> {
    let mut linear = LinearConfig::new(d_in, d_out)
        .with_initializer(default_init(1.0))
        .init(device);
    linear.bias = linear.bias.map(|bias| bias.map(|t| t.zeros_like()));
    linear
}

/// Number of GroupNorm groups for `channels`: `min(channels / 4, 32)`.
pub fn num_groups(channels: usize) -> usize {
    (channels / 4).clamp(1, 32)
}

pub fn group_norm<B: Backend>(channels: usize, device: &B::Device) -> GroupNorm<B> {
    GroupNormConfig::new(num_groups(channels), channels)
        .with_epsilon(1e-6)
        .init(device)
}

/// Nearest-neighbour ×2 upsampling: `(B, C, H, W) → (B, C, 2H, 2W)`.
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    x.reshape([b, c, h, 1, w, 1])
        .repeat_dim(3, 2)
        .repeat_dim(5, 2)
        .reshape([b, c, h * 2, w * 2])
}

/// 2×2 average pooling with stride 2: `(B, C, H, W) → (B, C, H/2, W/2)`.
pub fn avg_pool2x<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    x.reshape([b, c, h / 2, 2, w / 2, 2])
        .mean_dim(5)
        .mean_dim(3)
        .reshape([b, c, h / 2, w / 2])
}

/// Sinusoidal embedding of (possibly fractional) timestep labels.
///
/// `labels`: `(batch,)` → `(batch, dim)`, `[sin | cos]` halves with
/// frequencies `exp(-k · ln(10000) / (half - 1))`. Odd `dim` is zero padded.
pub fn positional_embedding<B: Backend>(labels: Tensor<B, 1>, dim: usize) -> Tensor<B, 2> {
    let [batch] = labels.dims();
    let device = labels.device();
    let half = dim / 2;
    let scale = (10_000f64).ln() / (half.max(2) - 1) as f64;
    let freqs: Vec<f32> = (0..half).map(|k| (-(k as f64) * scale).exp() as f32).collect();
    let freqs = Tensor::<B, 2>::from_data(TensorData::new(freqs, [1, half]), &device);

    let args = labels.reshape([batch, 1]) * freqs;
    let emb = Tensor::cat(vec![args.clone().sin(), args.cos()], 1);
    if dim % 2 == 1 {
        Tensor::cat(vec![emb, Tensor::zeros([batch, 1], &device)], 1)
    } else {
        emb
    }
}

/// Random Fourier features of the log noise level.
///
/// The frequency vector `W ~ N(0, scale²)` is fixed at construction and
/// excluded from gradient updates.
#[derive(Module, Debug)]
pub struct GaussianFourierProjection<B: Backend> {
    weight: Param<Tensor<B, 1>>,
}

impl<B: Backend> GaussianFourierProjection<B> {
    /// Projection producing `embedding_size` features (`embedding_size / 2` frequencies).
    pub fn new(embedding_size: usize, scale: f64, device: &B::Device) -> Self {
        let weight = Tensor::random([embedding_size / 2], Distribution::Normal(0.0, scale), device);
        Self {
            weight: Param::from_tensor(weight).set_require_grad(false),
        }
    }

    /// `x`: `(batch,)` → `(batch, embedding_size)`.
    pub fn forward(&self, x: Tensor<B, 1>) -> Tensor<B, 2> {
        let [batch] = x.dims();
        let weight = self.weight.val().detach();
        let [n] = weight.dims();
        let proj = x.reshape([batch, 1]) * weight.reshape([1, n]).mul_scalar(2.0 * std::f64::consts::PI);
        Tensor::cat(vec![proj.clone().sin(), proj.cos()], 1)
    }
}
