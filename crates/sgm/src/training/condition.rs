//! Conditioning signals: random inpainting masks and context tokens.

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::Rng;

use crate::error::SgmError;
use crate::model::layers::positional_embedding;
use crate::training::data::ProteinBatch;

/// Parsed `model.condition` list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conditions {
    /// One token encoding the residue count.
    pub length: bool,
    /// One token per residue from the secondary-structure channels.
    pub ss: bool,
    /// Random contiguous blocks are regenerated while the rest stays fixed.
    pub inpainting: bool,
}

impl Conditions {
    pub fn parse(names: &[String]) -> Result<Self, SgmError> {
        let mut conditions = Self::default();
        for name in names {
            match name.trim().to_ascii_lowercase().as_str() {
                "length" => conditions.length = true,
                "ss" => conditions.ss = true,
                "inpainting" => conditions.inpainting = true,
                _ => return Err(SgmError::UnknownCondition(name.clone())),
            }
        }
        Ok(conditions)
    }
}

/// Attach a random inpainting mask when inpainting is enabled.
///
/// For each protein a contiguous block covering a fraction in
/// `fraction[0]..=fraction[1]` of its residues is chosen; every pair touching
/// the block is marked for generation.
pub fn random_mask_batch<B: Backend>(
    mut batch: ProteinBatch<B>,
    conditions: &Conditions,
    fraction: [f64; 2],
    rng: &mut impl Rng,
) -> ProteinBatch<B> {
    if !conditions.inpainting {
        batch.inpaint = None;
        return batch;
    }
    let [size, _, l, _] = batch.coords_6d.dims();
    let device = batch.coords_6d.device();
    let (lo, hi) = (fraction[0].min(fraction[1]), fraction[0].max(fraction[1]));

    let mut mask = vec![0.0f32; size * l * l];
    for (b, &n) in batch.lengths.iter().enumerate() {
        if n == 0 {
            continue;
        }
        let frac = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
        let block = ((frac * n as f64).round() as usize).clamp(1, n);
        let start = rng.gen_range(0..=n - block);
        let in_block = |i: usize| (start..start + block).contains(&i);
        for i in 0..n {
            for j in 0..n {
                if in_block(i) || in_block(j) {
                    mask[(b * l + i) * l + j] = 1.0;
                }
            }
        }
    }
    batch.inpaint = Some(Tensor::from_data(TensorData::new(mask, [size, l, l]), &device));
    batch
}

/// Length token `(batch, 1, context_dim)` for the given residue counts.
pub fn length_context<B: Backend>(
    lengths: &[usize],
    context_dim: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    let batch = lengths.len();
    let values: Vec<f32> = lengths.iter().map(|&n| n as f32).collect();
    let lengths = Tensor::<B, 1>::from_data(TensorData::new(values, [batch]), device);
    positional_embedding(lengths, context_dim).reshape([batch, 1, context_dim])
}

/// Context tokens `(batch, T, context_dim)` derived from a batch.
///
/// Tokens are concatenated in order: length token, then per-residue
/// secondary-structure tokens. With no active signal a single zero token is
/// returned so cross-attention always has something to attend to.
pub fn build_context<B: Backend>(
    batch: &ProteinBatch<B>,
    conditions: &Conditions,
    context_dim: usize,
) -> Result<Tensor<B, 3>, SgmError> {
    let device = batch.coords_6d.device();
    let size = batch.batch_size();
    let mut tokens = Vec::new();

    if conditions.length {
        tokens.push(length_context(&batch.lengths, context_dim, &device));
    }
    if conditions.ss {
        if let Some(ss) = &batch.ss {
            let [_, channels, l, _] = ss.dims();
            if channels > context_dim {
                return Err(SgmError::InvalidConfig(format!(
                    "{channels} secondary-structure channels do not fit context_dim {context_dim}"
                )));
            }
            // Row means give one feature vector per residue.
            let per_residue = ss
                .clone()
                .mean_dim(3)
                .reshape([size, channels, l])
                .swap_dims(1, 2);
            let per_residue = per_residue * batch.mask.clone().unsqueeze_dim::<3>(2);
            let padded = if channels < context_dim {
                Tensor::cat(
                    vec![per_residue, Tensor::zeros([size, l, context_dim - channels], &device)],
                    2,
                )
            } else {
                per_residue
            };
            tokens.push(padded);
        }
    }

    if tokens.is_empty() {
        return Ok(Tensor::zeros([size, 1, context_dim], &device));
    }
    Ok(Tensor::cat(tokens, 1))
}
