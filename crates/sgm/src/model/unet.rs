//! Time- and context-conditioned UNet score network.
//!
//! ```text
//! x (batch, C, L, L) ─ conv3x3 ─ push ─┐
//!   encoder:   [Residual → Attention → push] × num_res_blocks, Downsample → push
//!   bottleneck: Residual → Attention → Residual
//!   decoder:   [Residual(concat pop) → Attention] × (num_res_blocks + 1), Upsample
//!   head:       GroupNorm → act → conv3x3 (init_scale) [÷ σ(label)]
//! ```

use std::str::FromStr;

use burn::module::Ignored;
use burn::nn::conv::Conv2d;
use burn::nn::{GroupNorm, Linear};
use burn::prelude::*;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::error::SgmError;
use crate::model::attention::{SpatialTransformer, SpatialTransformerConfig};
use crate::model::layers::{
    conv3x3, dense, group_norm, positional_embedding, GaussianFourierProjection, Nonlinearity,
};
use crate::model::plan::{LayerSpec, UNetPlan};
use crate::model::resblock::{Resample, ResblockType, ResnetBlock, ResnetBlockConfig};
use crate::sde::{per_sample, Sde};

/// How timestep labels are embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingType {
    /// Sinusoidal embedding of the label itself.
    Positional,
    /// Gaussian Fourier features of `ln σ(label)`.
    Fourier,
}

impl FromStr for EmbeddingType {
    type Err = SgmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positional" => Ok(Self::Positional),
            "fourier" => Ok(Self::Fourier),
            _ => Err(SgmError::UnknownEmbedding(s.to_string())),
        }
    }
}

/// Score network and diffusion hyperparameters (`[model]` config section).
#[derive(Config, Debug)]
pub struct ScoreNetConfig {
    /// Base channel width.
    #[config(default = 128)]
    pub nf: usize,
    /// Width multiplier per resolution level.
    #[config(default = "vec![1, 1, 2, 2, 2, 2]")]
    pub ch_mult: Vec<usize>,
    #[config(default = 2)]
    pub num_res_blocks: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    /// Use a 3×3 conv in standalone (ddpm) resampling layers.
    #[config(default = true)]
    pub resamp_with_conv: bool,
    #[config(default = true)]
    pub skip_rescale: bool,
    /// `"ddpm"` or `"biggan"`.
    #[config(default = "String::from(\"biggan\")")]
    pub resblock_type: String,
    #[config(default = 0.0)]
    pub init_scale: f64,
    /// `"positional"` or `"fourier"`.
    #[config(default = "String::from(\"positional\")")]
    pub embedding_type: String,
    #[config(default = 16.0)]
    pub fourier_scale: f64,
    /// `"swish"`, `"relu"`, `"lrelu"` or `"elu"`.
    #[config(default = "String::from(\"swish\")")]
    pub nonlinearity: String,
    #[config(default = 0.999)]
    pub ema_rate: f64,
    #[config(default = 0.1)]
    pub beta_min: f64,
    #[config(default = 20.0)]
    pub beta_max: f64,
    #[config(default = 0.01)]
    pub sigma_min: f64,
    #[config(default = 100.0)]
    pub sigma_max: f64,
    /// Number of discrete noise levels `N`.
    #[config(default = 2000)]
    pub num_scales: usize,
    /// Divide the network output by the noise scale of its label.
    #[config(default = true)]
    pub scale_by_sigma: bool,
    /// Conditioning signals: any of `"length"`, `"ss"`, `"inpainting"`.
    #[config(default = "vec![String::from(\"length\")]")]
    pub condition: Vec<String>,
    /// Width of each context token.
    #[config(default = 128)]
    pub context_dim: usize,
    #[config(default = 4)]
    pub attn_heads: usize,
    #[config(default = 32)]
    pub attn_head_dim: usize,
    /// Range of the fraction of residues hidden by a random inpainting mask.
    #[config(default = "[0.1, 0.5]")]
    pub inpaint_fraction: [f64; 2],
}

/// String-typed choices of [`ScoreNetConfig`], parsed and checked.
#[derive(Debug, Clone, Copy)]
pub struct NetChoices {
    pub resblock: ResblockType,
    pub embedding: EmbeddingType,
    pub nonlinearity: Nonlinearity,
}

impl ScoreNetConfig {
    /// Parse the string-typed fields and range-check scalars.
    pub fn choices(&self) -> Result<NetChoices, SgmError> {
        let choices = NetChoices {
            resblock: self.resblock_type.parse()?,
            embedding: self.embedding_type.parse()?,
            nonlinearity: self.nonlinearity.parse()?,
        };
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(SgmError::InvalidConfig(format!(
                "model.dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(0.0..=1.0).contains(&self.ema_rate) {
            return Err(SgmError::InvalidConfig(format!(
                "model.ema_rate must be in [0, 1], got {}",
                self.ema_rate
            )));
        }
        if self.context_dim == 0 || self.attn_heads == 0 || self.attn_head_dim == 0 {
            return Err(SgmError::InvalidConfig(
                "context_dim, attn_heads and attn_head_dim must be positive".to_string(),
            ));
        }
        if choices.embedding == EmbeddingType::Positional && self.nf < 2 {
            return Err(SgmError::InvalidConfig("nf must be at least 2".to_string()));
        }
        Ok(choices)
    }

    /// Layer plan for inputs with `num_channels` feature channels.
    pub fn plan(&self, num_channels: usize) -> Result<UNetPlan, SgmError> {
        UNetPlan::build(num_channels, self.nf, &self.ch_mult, self.num_res_blocks)
    }

    /// Build the network. Every configuration error surfaces here, before
    /// any parameter tensor is allocated.
    pub fn init<B: Backend>(
        &self,
        num_channels: usize,
        sde: &Sde,
        device: &B::Device,
    ) -> Result<ScoreUNet<B>, SgmError> {
        let choices = self.choices()?;
        let plan = self.plan(num_channels)?;
        let temb_dim = self.nf * 4;

        let block = |in_ch: usize, out_ch: usize| {
            ResnetBlockConfig::new(in_ch, out_ch, temb_dim)
                .with_dropout(self.dropout)
                .with_init_scale(self.init_scale)
                .with_skip_rescale(self.skip_rescale)
                .with_nonlinearity(choices.nonlinearity)
        };

        let mut residual = Vec::new();
        let mut attention = Vec::new();
        let mut resample = Vec::new();
        let mut ops = Vec::new();
        for spec in plan.layers() {
            match *spec {
                LayerSpec::PushSkip => ops.push(LayerOp::PushSkip),
                LayerSpec::Residual { in_ch, out_ch, skip_ch } => {
                    let width = in_ch + skip_ch.unwrap_or(0);
                    ops.push(LayerOp::Residual {
                        index: residual.len(),
                        pop: skip_ch.is_some(),
                    });
                    residual.push(block(width, out_ch).init(device));
                }
                LayerSpec::Attention { channels } => {
                    ops.push(LayerOp::Attention(attention.len()));
                    attention.push(
                        SpatialTransformerConfig::new(channels, self.context_dim)
                            .with_n_heads(self.attn_heads)
                            .with_d_head(self.attn_head_dim)
                            .init(device),
                    );
                }
                LayerSpec::Resample { channels, direction } => {
                    ops.push(LayerOp::Resample(resample.len()));
                    resample.push(Resample::new(
                        choices.resblock,
                        direction,
                        &block(channels, channels),
                        self.resamp_with_conv,
                        device,
                    ));
                }
            }
        }

        let out_ch = plan.output_channels();
        let fourier = (choices.embedding == EmbeddingType::Fourier)
            .then(|| GaussianFourierProjection::new(self.nf, self.fourier_scale, device));

        let model = ScoreUNet {
            fourier,
            temb_0: dense(self.nf, temb_dim, device),
            temb_1: dense(temb_dim, temb_dim, device),
            conv_in: conv3x3(num_channels, plan.stem_channels(), 1, 1.0, device),
            residual,
            attention,
            resample,
            norm_out: group_norm(out_ch, device),
            conv_out: conv3x3(out_ch, num_channels, 1, self.init_scale, device),
            ops: Ignored(ops),
            settings: Ignored(NetSettings {
                act: choices.nonlinearity,
                nf: self.nf,
                scale_by_sigma: self.scale_by_sigma,
                noise_scales: sde.noise_scales(),
            }),
        };
        tracing::debug!(
            params = model.num_params(),
            residual = plan.residual_count(),
            attention = plan.attention_count(),
            resample = plan.resample_count(),
            "Score network built"
        );
        Ok(model)
    }
}

/// Instantiated counterpart of a [`LayerSpec`], indexing the typed module lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerOp {
    Residual { index: usize, pop: bool },
    Attention(usize),
    Resample(usize),
    PushSkip,
}

#[derive(Debug, Clone)]
struct NetSettings {
    act: Nonlinearity,
    nf: usize,
    scale_by_sigma: bool,
    /// Noise scale per timestep label.
    noise_scales: Vec<f32>,
}

/// Module-consumption record of one forward pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardTrace {
    pub residual_calls: usize,
    pub attention_calls: usize,
    pub resample_calls: usize,
    pub pushes: usize,
    pub pops: usize,
    pub max_depth: usize,
    /// Skip entries left on the stack after the decoder.
    pub remaining: usize,
}

#[derive(Module, Debug)]
pub struct ScoreUNet<B: Backend> {
    fourier: Option<GaussianFourierProjection<B>>,
    temb_0: Linear<B>,
    temb_1: Linear<B>,
    conv_in: Conv2d<B>,
    residual: Vec<ResnetBlock<B>>,
    attention: Vec<SpatialTransformer<B>>,
    resample: Vec<Resample<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
    ops: Ignored<Vec<LayerOp>>,
    settings: Ignored<NetSettings>,
}

impl<B: Backend> ScoreUNet<B> {
    /// `x`: `(batch, C, L, L)`, `labels`: `(batch,)`, `context`:
    /// `(batch, T, context_dim)` → score estimate `(batch, C, L, L)`.
    pub fn forward(&self, x: Tensor<B, 4>, labels: Tensor<B, 1>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        self.forward_traced(x, labels, context).0
    }

    /// Forward pass that also reports how many modules and skip entries it used.
    pub fn forward_traced(
        &self,
        x: Tensor<B, 4>,
        labels: Tensor<B, 1>,
        context: Tensor<B, 3>,
    ) -> (Tensor<B, 4>, ForwardTrace) {
        let (h, sigmas, trace) = self.forward_unscaled(x, labels, context);
        if self.settings.scale_by_sigma {
            (h / per_sample(sigmas), trace)
        } else {
            (h, trace)
        }
    }

    /// Noise scale for each label: `noise_scales[round(label)]`, clamped to the table.
    pub fn sigmas_for(&self, labels: Tensor<B, 1>) -> Tensor<B, 1> {
        let scales = &self.settings.noise_scales;
        let n = scales.len();
        let device = labels.device();
        let table = Tensor::<B, 1>::from_data(TensorData::new(scales.clone(), [n]), &device);
        let index = labels.add_scalar(0.5).int().clamp(0i64, n as i64 - 1);
        table.select(0, index)
    }

    fn forward_unscaled(
        &self,
        x: Tensor<B, 4>,
        labels: Tensor<B, 1>,
        context: Tensor<B, 3>,
    ) -> (Tensor<B, 4>, Tensor<B, 1>, ForwardTrace) {
        let act = self.settings.act;
        let sigmas = self.sigmas_for(labels.clone());
        let temb = match &self.fourier {
            Some(fourier) => fourier.forward(sigmas.clone().log()),
            None => positional_embedding(labels, self.settings.nf),
        };
        let temb = self.temb_1.forward(act.apply(self.temb_0.forward(temb)));

        let mut trace = ForwardTrace::default();
        let mut skips: Vec<Tensor<B, 4>> = Vec::new();
        let mut h = self.conv_in.forward(x);

        for op in self.ops.iter() {
            match *op {
                LayerOp::PushSkip => {
                    skips.push(h.clone());
                    trace.pushes += 1;
                    trace.max_depth = trace.max_depth.max(skips.len());
                }
                LayerOp::Residual { index, pop } => {
                    let input = if pop {
                        let skip = skips.pop().expect("skip stack balanced by the layer plan");
                        trace.pops += 1;
                        Tensor::cat(vec![h, skip], 1)
                    } else {
                        h
                    };
                    h = self.residual[index].forward(input, temb.clone());
                    trace.residual_calls += 1;
                }
                LayerOp::Attention(index) => {
                    h = self.attention[index].forward(h, context.clone());
                    trace.attention_calls += 1;
                }
                LayerOp::Resample(index) => {
                    h = self.resample[index].forward(h, temb.clone());
                    trace.resample_calls += 1;
                }
            }
        }
        trace.remaining = skips.len();

        let h = self.conv_out.forward(act.apply(self.norm_out.forward(h)));
        (h, sigmas, trace)
    }
}
