use std::str::FromStr;

use burn::module::Ignored;
use burn::nn::conv::Conv2d;
use burn::nn::{Dropout, DropoutConfig, GroupNorm, Linear};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SgmError;
use crate::model::layers::{
    avg_pool2x, conv1x1, conv3x3, dense, group_norm, upsample_nearest, Nonlinearity,
    ResampleDirection,
};

/// Residual block family, fixed for the whole network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResblockType {
    /// Resampling happens in standalone up/down layers.
    Ddpm,
    /// Resampling is folded into a residual block.
    BigGan,
}

impl FromStr for ResblockType {
    type Err = SgmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ddpm" => Ok(Self::Ddpm),
            "biggan" => Ok(Self::BigGan),
            _ => Err(SgmError::UnknownResblock(s.to_string())),
        }
    }
}

/// Configuration for a time-conditioned residual block.
///
/// ```text
/// x → GroupNorm → act → [resample] → conv3x3 → + Dense(act(temb))
///   → GroupNorm → act → Dropout → conv3x3(init_scale)
///   → + shortcut(x)  [÷ √2 if skip_rescale]
/// ```
#[derive(Config, Debug)]
pub struct ResnetBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Width of the time embedding fed to the dense projection.
    pub temb_dim: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    /// Initializer scale of the final convolution (0 ≈ zero init).
    #[config(default = 0.0)]
    pub init_scale: f64,
    #[config(default = true)]
    pub skip_rescale: bool,
    #[config(default = "Nonlinearity::Swish")]
    pub nonlinearity: Nonlinearity,
    /// Optional ×2 resolution change folded into the block.
    #[config(default = "None")]
    pub resample: Option<ResampleDirection>,
}

#[derive(Debug, Clone)]
struct BlockSettings {
    act: Nonlinearity,
    resample: Option<ResampleDirection>,
    skip_rescale: bool,
}

#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    norm_0: GroupNorm<B>,
    conv_0: Conv2d<B>,
    dense_0: Linear<B>,
    norm_1: GroupNorm<B>,
    dropout: Dropout,
    conv_1: Conv2d<B>,
    /// 1×1 projection when channels change or the block resamples.
    shortcut: Option<Conv2d<B>>,
    settings: Ignored<BlockSettings>,
}

impl ResnetBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResnetBlock<B> {
        let needs_shortcut = self.in_channels != self.out_channels || self.resample.is_some();
        ResnetBlock {
            norm_0: group_norm(self.in_channels, device),
            conv_0: conv3x3(self.in_channels, self.out_channels, 1, 1.0, device),
            dense_0: dense(self.temb_dim, self.out_channels, device),
            norm_1: group_norm(self.out_channels, device),
            dropout: DropoutConfig::new(self.dropout).init(),
            conv_1: conv3x3(self.out_channels, self.out_channels, 1, self.init_scale, device),
            shortcut: needs_shortcut
                .then(|| conv1x1(self.in_channels, self.out_channels, 1.0, device)),
            settings: Ignored(BlockSettings {
                act: self.nonlinearity,
                resample: self.resample,
                skip_rescale: self.skip_rescale,
            }),
        }
    }
}

impl<B: Backend> ResnetBlock<B> {
    /// `x`: `(batch, in, H, W)`, `temb`: `(batch, temb_dim)` →
    /// `(batch, out, H', W')` with `H'` doubled/halved when resampling.
    pub fn forward(&self, x: Tensor<B, 4>, temb: Tensor<B, 2>) -> Tensor<B, 4> {
        let act = self.settings.act;
        let h = act.apply(self.norm_0.forward(x.clone()));
        let (h, x) = match self.settings.resample {
            Some(ResampleDirection::Up) => (upsample_nearest(h), upsample_nearest(x)),
            Some(ResampleDirection::Down) => (avg_pool2x(h), avg_pool2x(x)),
            None => (h, x),
        };

        let h = self.conv_0.forward(h);
        let [batch, channels, _, _] = h.dims();
        let h = h + self
            .dense_0
            .forward(act.apply(temb))
            .reshape([batch, channels, 1, 1]);
        let h = act.apply(self.norm_1.forward(h));
        let h = self.conv_1.forward(self.dropout.forward(h));

        let x = match &self.shortcut {
            Some(conv) => conv.forward(x),
            None => x,
        };
        let out = x + h;
        if self.settings.skip_rescale {
            out.div_scalar(std::f64::consts::SQRT_2)
        } else {
            out
        }
    }
}

/// Standalone resampling layer between resolution levels.
///
/// For `ddpm` it is a nearest upsample (optionally followed by a 3×3 conv) or
/// a stride-2 conv / 2×2 average pool. For `biggan` it wraps a residual block
/// with the resample folded in.
#[derive(Module, Debug)]
pub struct Resample<B: Backend> {
    conv: Option<Conv2d<B>>,
    block: Option<ResnetBlock<B>>,
    direction: Ignored<ResampleDirection>,
}

impl<B: Backend> Resample<B> {
    pub fn new(
        kind: ResblockType,
        direction: ResampleDirection,
        block: &ResnetBlockConfig,
        with_conv: bool,
        device: &B::Device,
    ) -> Self {
        let channels = block.in_channels;
        match kind {
            ResblockType::Ddpm => {
                let stride = match direction {
                    ResampleDirection::Up => 1,
                    ResampleDirection::Down => 2,
                };
                Self {
                    conv: with_conv.then(|| conv3x3(channels, channels, stride, 1.0, device)),
                    block: None,
                    direction: Ignored(direction),
                }
            }
            ResblockType::BigGan => Self {
                conv: None,
                block: Some(
                    ResnetBlockConfig {
                        out_channels: channels,
                        resample: Some(direction),
                        ..block.clone()
                    }
                    .init(device),
                ),
                direction: Ignored(direction),
            },
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, temb: Tensor<B, 2>) -> Tensor<B, 4> {
        if let Some(block) = &self.block {
            return block.forward(x, temb);
        }
        match (*self.direction, &self.conv) {
            (ResampleDirection::Up, Some(conv)) => conv.forward(upsample_nearest(x)),
            (ResampleDirection::Up, None) => upsample_nearest(x),
            (ResampleDirection::Down, Some(conv)) => conv.forward(x),
            (ResampleDirection::Down, None) => avg_pool2x(x),
        }
    }
}
