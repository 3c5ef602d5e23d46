//! Context-conditioned spatial transformer used at every UNet resolution.

use burn::nn::conv::Conv2d;
use burn::nn::conv::Conv2dConfig;
use burn::nn::{GroupNorm, Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation;

use crate::model::layers::{conv1x1, group_norm};

/// Multi-head attention. Keys and values come from `context` when one is
/// given, otherwise from the queries' own sequence.
#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    to_q: Linear<B>,
    to_k: Linear<B>,
    to_v: Linear<B>,
    to_out: Linear<B>,
    n_heads: usize,
    d_head: usize,
}

impl<B: Backend> MultiHeadAttention<B> {
    pub fn new(
        query_dim: usize,
        context_dim: usize,
        n_heads: usize,
        d_head: usize,
        device: &B::Device,
    ) -> Self {
        let inner = n_heads * d_head;
        Self {
            to_q: LinearConfig::new(query_dim, inner).with_bias(false).init(device),
            to_k: LinearConfig::new(context_dim, inner).with_bias(false).init(device),
            to_v: LinearConfig::new(context_dim, inner).with_bias(false).init(device),
            to_out: LinearConfig::new(inner, query_dim).init(device),
            n_heads,
            d_head,
        }
    }

    /// `x`: `(batch, n, query_dim)`, `context`: `(batch, t, context_dim)`.
    pub fn forward(&self, x: Tensor<B, 3>, context: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let [batch, n, _] = x.dims();
        let context = context.unwrap_or_else(|| x.clone());
        let [_, t, _] = context.dims();

        let q = self.split_heads(self.to_q.forward(x), batch, n);
        let k = self.split_heads(self.to_k.forward(context.clone()), batch, t);
        let v = self.split_heads(self.to_v.forward(context), batch, t);

        let scale = (self.d_head as f64).sqrt().recip();
        let scores = q.matmul(k.swap_dims(2, 3)).mul_scalar(scale);
        let out = activation::softmax(scores, 3).matmul(v);

        let out = out
            .swap_dims(1, 2)
            .reshape([batch, n, self.n_heads * self.d_head]);
        self.to_out.forward(out)
    }

    fn split_heads(&self, x: Tensor<B, 3>, batch: usize, len: usize) -> Tensor<B, 4> {
        x.reshape([batch, len, self.n_heads, self.d_head])
            .swap_dims(1, 2)
    }
}

/// Gated-GELU feed-forward: `Linear(d, 2·4d) → a · gelu(g) → Linear(4d, d)`.
#[derive(Module, Debug)]
pub struct GegluFeedForward<B: Backend> {
    proj_in: Linear<B>,
    proj_out: Linear<B>,
}

impl<B: Backend> GegluFeedForward<B> {
    pub fn new(dim: usize, mult: usize, device: &B::Device) -> Self {
        let inner = dim * mult;
        Self {
            proj_in: LinearConfig::new(dim, inner * 2).init(device),
            proj_out: LinearConfig::new(inner, dim).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let mut halves = self.proj_in.forward(x).chunk(2, 2);
        let gate = halves.pop().expect("chunk(2) yields two halves");
        let value = halves.pop().expect("chunk(2) yields two halves");
        self.proj_out.forward(value * activation::gelu(gate))
    }
}

/// Pre-norm transformer block: self-attention, cross-attention, feed-forward.
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    norm_1: LayerNorm<B>,
    self_attn: MultiHeadAttention<B>,
    norm_2: LayerNorm<B>,
    cross_attn: MultiHeadAttention<B>,
    norm_3: LayerNorm<B>,
    ff: GegluFeedForward<B>,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(
        dim: usize,
        context_dim: usize,
        n_heads: usize,
        d_head: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            norm_1: LayerNormConfig::new(dim).init(device),
            self_attn: MultiHeadAttention::new(dim, dim, n_heads, d_head, device),
            norm_2: LayerNormConfig::new(dim).init(device),
            cross_attn: MultiHeadAttention::new(dim, context_dim, n_heads, d_head, device),
            norm_3: LayerNormConfig::new(dim).init(device),
            ff: GegluFeedForward::new(dim, 4, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, context: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone() + self.self_attn.forward(self.norm_1.forward(x), None);
        let x = x.clone() + self.cross_attn.forward(self.norm_2.forward(x), Some(context));
        x.clone() + self.ff.forward(self.norm_3.forward(x))
    }
}

/// Configuration for a [`SpatialTransformer`].
///
/// ```text
/// (batch, C, H, W) → GroupNorm → 1×1 conv (C → heads·d_head)
///   → flatten to (batch, H·W, heads·d_head) → TransformerBlock(context)
///   → 1×1 conv (zero-init, → C) → + input
/// ```
#[derive(Config, Debug)]
pub struct SpatialTransformerConfig {
    pub channels: usize,
    /// Width of each context token.
    pub context_dim: usize,
    #[config(default = 4)]
    pub n_heads: usize,
    #[config(default = 32)]
    pub d_head: usize,
}

#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    norm: GroupNorm<B>,
    proj_in: Conv2d<B>,
    block: TransformerBlock<B>,
    proj_out: Conv2d<B>,
}

impl SpatialTransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SpatialTransformer<B> {
        let inner = self.n_heads * self.d_head;
        SpatialTransformer {
            norm: group_norm(self.channels, device),
            proj_in: conv1x1(self.channels, inner, 1.0, device),
            block: TransformerBlock::new(inner, self.context_dim, self.n_heads, self.d_head, device),
            proj_out: Conv2dConfig::new([inner, self.channels], [1, 1])
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }
}

impl<B: Backend> SpatialTransformer<B> {
    /// `x`: `(batch, C, H, W)`, `context`: `(batch, T, context_dim)`.
    pub fn forward(&self, x: Tensor<B, 4>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch, _, height, width] = x.dims();
        let h = self.proj_in.forward(self.norm.forward(x.clone()));
        let [_, inner, _, _] = h.dims();

        let tokens = h
            .reshape([batch, inner, height * width])
            .swap_dims(1, 2);
        let tokens = self.block.forward(tokens, context);
        let h = tokens
            .swap_dims(1, 2)
            .reshape([batch, inner, height, width]);

        x + self.proj_out.forward(h)
    }
}
