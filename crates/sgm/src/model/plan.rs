//! Explicit layer plan for the score UNet.
//!
//! The network is described first as an ordered list of typed layer specs.
//! Modules are instantiated from the plan and the forward pass walks the same
//! list, so skip-stack balance and per-kind counts can be checked without
//! allocating a single tensor.

use crate::error::SgmError;
use crate::model::layers::{num_groups, ResampleDirection};

/// One step of the UNet forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSpec {
    /// Time-conditioned residual block. When `skip_ch` is set the block pops
    /// a skip entry and consumes `concat(h, skip)` of width `in_ch + skip_ch`.
    Residual {
        in_ch: usize,
        out_ch: usize,
        skip_ch: Option<usize>,
    },
    /// Context-conditioned spatial transformer.
    Attention { channels: usize },
    /// Resolution change between levels.
    Resample {
        channels: usize,
        direction: ResampleDirection,
    },
    /// Push the current activation onto the skip stack.
    PushSkip,
}

/// Section of the network a layer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Encoder,
    Bottleneck,
    Decoder,
}

#[derive(Debug, Clone)]
pub struct UNetPlan {
    layers: Vec<(Section, LayerSpec)>,
    input_channels: usize,
    stem_channels: usize,
    output_channels: usize,
}

impl UNetPlan {
    /// Lay out the encoder, bottleneck and decoder for the given widths.
    ///
    /// The input convolution maps `num_channels → nf` and its output is the
    /// first skip entry; the plan starts with that push.
    pub fn build(
        num_channels: usize,
        nf: usize,
        ch_mult: &[usize],
        num_res_blocks: usize,
    ) -> Result<Self, SgmError> {
        if num_channels == 0 || nf == 0 {
            return Err(SgmError::InvalidConfig(
                "num_channels and nf must be positive".to_string(),
            ));
        }
        if ch_mult.is_empty() || ch_mult.contains(&0) {
            return Err(SgmError::InvalidConfig(format!(
                "ch_mult must be a non-empty list of positive multipliers, got {ch_mult:?}"
            )));
        }
        if num_res_blocks == 0 {
            return Err(SgmError::InvalidConfig(
                "num_res_blocks must be at least 1".to_string(),
            ));
        }
        for &mult in ch_mult {
            let channels = nf * mult;
            if channels % num_groups(channels) != 0 {
                return Err(SgmError::InvalidConfig(format!(
                    "width {channels} (nf={nf} × {mult}) is not divisible into {} GroupNorm groups",
                    num_groups(channels)
                )));
            }
        }

        let num_resolutions = ch_mult.len();
        let mut layers = Vec::new();
        let mut skip_channels = vec![nf];
        let mut in_ch = nf;
        layers.push((Section::Encoder, LayerSpec::PushSkip));

        for (level, &mult) in ch_mult.iter().enumerate() {
            let out_ch = nf * mult;
            for _ in 0..num_res_blocks {
                layers.push((
                    Section::Encoder,
                    LayerSpec::Residual {
                        in_ch,
                        out_ch,
                        skip_ch: None,
                    },
                ));
                layers.push((Section::Encoder, LayerSpec::Attention { channels: out_ch }));
                layers.push((Section::Encoder, LayerSpec::PushSkip));
                skip_channels.push(out_ch);
                in_ch = out_ch;
            }
            if level != num_resolutions - 1 {
                layers.push((
                    Section::Encoder,
                    LayerSpec::Resample {
                        channels: in_ch,
                        direction: ResampleDirection::Down,
                    },
                ));
                layers.push((Section::Encoder, LayerSpec::PushSkip));
                skip_channels.push(in_ch);
            }
        }

        let bottleneck = in_ch;
        layers.push((
            Section::Bottleneck,
            LayerSpec::Residual {
                in_ch: bottleneck,
                out_ch: bottleneck,
                skip_ch: None,
            },
        ));
        layers.push((Section::Bottleneck, LayerSpec::Attention { channels: bottleneck }));
        layers.push((
            Section::Bottleneck,
            LayerSpec::Residual {
                in_ch: bottleneck,
                out_ch: bottleneck,
                skip_ch: None,
            },
        ));

        for (level, &mult) in ch_mult.iter().enumerate().rev() {
            let out_ch = nf * mult;
            for _ in 0..=num_res_blocks {
                let skip_ch = skip_channels.pop().ok_or_else(|| {
                    SgmError::InvalidConfig("decoder pops more skips than encoder pushed".into())
                })?;
                let concat = in_ch + skip_ch;
                if concat % num_groups(concat) != 0 {
                    return Err(SgmError::InvalidConfig(format!(
                        "concatenated width {concat} is not divisible into {} GroupNorm groups",
                        num_groups(concat)
                    )));
                }
                layers.push((
                    Section::Decoder,
                    LayerSpec::Residual {
                        in_ch,
                        out_ch,
                        skip_ch: Some(skip_ch),
                    },
                ));
                layers.push((Section::Decoder, LayerSpec::Attention { channels: out_ch }));
                in_ch = out_ch;
            }
            if level != 0 {
                layers.push((
                    Section::Decoder,
                    LayerSpec::Resample {
                        channels: in_ch,
                        direction: ResampleDirection::Up,
                    },
                ));
            }
        }

        let plan = Self {
            layers,
            input_channels: num_channels,
            stem_channels: nf,
            output_channels: in_ch,
        };
        plan.check_skip_balance()?;
        Ok(plan)
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerSpec> {
        self.layers.iter().map(|(_, spec)| spec)
    }

    pub fn section_layers(&self, section: Section) -> impl Iterator<Item = &LayerSpec> {
        self.layers
            .iter()
            .filter(move |(s, _)| *s == section)
            .map(|(_, spec)| spec)
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Width produced by the input convolution.
    pub fn stem_channels(&self) -> usize {
        self.stem_channels
    }

    /// Width entering the output head.
    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    pub fn residual_count(&self) -> usize {
        self.layers()
            .filter(|l| matches!(l, LayerSpec::Residual { .. }))
            .count()
    }

    pub fn attention_count(&self) -> usize {
        self.layers()
            .filter(|l| matches!(l, LayerSpec::Attention { .. }))
            .count()
    }

    pub fn resample_count(&self) -> usize {
        self.layers()
            .filter(|l| matches!(l, LayerSpec::Resample { .. }))
            .count()
    }

    pub fn push_count(&self) -> usize {
        self.layers().filter(|l| matches!(l, LayerSpec::PushSkip)).count()
    }

    pub fn pop_count(&self) -> usize {
        self.layers()
            .filter(|l| matches!(l, LayerSpec::Residual { skip_ch: Some(_), .. }))
            .count()
    }

    /// Replay the skip stack: it must never underflow, every pop must see
    /// the width that was pushed, and it must end empty.
    pub fn check_skip_balance(&self) -> Result<(), SgmError> {
        let mut stack = Vec::new();
        let mut width = self.stem_channels;
        for spec in self.layers() {
            match *spec {
                LayerSpec::PushSkip => stack.push(width),
                LayerSpec::Residual { in_ch, out_ch, skip_ch } => {
                    if in_ch != width {
                        return Err(SgmError::InvalidConfig(format!(
                            "residual expects {in_ch} channels but receives {width}"
                        )));
                    }
                    if let Some(skip_ch) = skip_ch {
                        match stack.pop() {
                            Some(pushed) if pushed == skip_ch => {}
                            Some(pushed) => {
                                return Err(SgmError::InvalidConfig(format!(
                                    "skip width mismatch: planned {skip_ch}, pushed {pushed}"
                                )))
                            }
                            None => {
                                return Err(SgmError::InvalidConfig(
                                    "skip stack underflow".to_string(),
                                ))
                            }
                        }
                    }
                    width = out_ch;
                }
                LayerSpec::Attention { channels } | LayerSpec::Resample { channels, .. } => {
                    if channels != width {
                        return Err(SgmError::InvalidConfig(format!(
                            "layer expects {channels} channels but receives {width}"
                        )));
                    }
                }
            }
        }
        if !stack.is_empty() {
            return Err(SgmError::InvalidConfig(format!(
                "{} skip entries left unconsumed",
                stack.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protein_scale_plan_counts() {
        let plan = UNetPlan::build(5, 128, &[1, 1, 2, 2, 2, 2], 2).unwrap();

        let encoder_modules = plan
            .section_layers(Section::Encoder)
            .filter(|l| matches!(l, LayerSpec::Residual { .. } | LayerSpec::Attention { .. }))
            .count();
        assert_eq!(encoder_modules, 24);
        assert_eq!(plan.push_count(), 18);
        assert_eq!(plan.pop_count(), 18);

        // 12 encoder + 2 bottleneck + 18 decoder residual blocks.
        assert_eq!(plan.residual_count(), 32);
        // 12 encoder + 1 bottleneck + 18 decoder attention blocks.
        assert_eq!(plan.attention_count(), 31);
        // 5 downsamples + 5 upsamples.
        assert_eq!(plan.resample_count(), 10);

        assert_eq!(plan.input_channels(), 5);
        assert_eq!(plan.output_channels(), 128);
        plan.check_skip_balance().unwrap();
    }

    #[test]
    fn test_single_level_has_no_resampling() {
        let plan = UNetPlan::build(3, 8, &[1], 1).unwrap();
        assert_eq!(plan.resample_count(), 0);
        assert_eq!(plan.push_count(), 2);
        assert_eq!(plan.pop_count(), 2);
    }

    #[test]
    fn test_decoder_residuals_consume_matching_widths() {
        let plan = UNetPlan::build(2, 8, &[1, 2], 1).unwrap();
        let decoder: Vec<_> = plan.section_layers(Section::Decoder).collect();
        // First decoder block: bottleneck (16) concatenated with the last push (16).
        assert_eq!(
            *decoder[0],
            LayerSpec::Residual {
                in_ch: 16,
                out_ch: 16,
                skip_ch: Some(16)
            }
        );
        // Last decoder block consumes the input-conv skip (nf = 8).
        let last_residual = decoder
            .iter()
            .rev()
            .find(|l| matches!(l, LayerSpec::Residual { .. }))
            .unwrap();
        assert_eq!(
            **last_residual,
            LayerSpec::Residual {
                in_ch: 8,
                out_ch: 8,
                skip_ch: Some(8)
            }
        );
    }

    #[test]
    fn test_invalid_plans_rejected() {
        assert!(UNetPlan::build(5, 128, &[], 2).is_err());
        assert!(UNetPlan::build(5, 128, &[1, 0], 2).is_err());
        assert!(UNetPlan::build(5, 128, &[1], 0).is_err());
        // 6 channels → 1 group is fine, 18 → 4 groups is not.
        assert!(UNetPlan::build(5, 6, &[1], 1).is_ok());
        assert!(UNetPlan::build(5, 18, &[1], 1).is_err());
    }
}
