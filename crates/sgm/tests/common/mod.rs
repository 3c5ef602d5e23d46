//! Shared fixtures: a tiny synthetic dataset and a fast configuration.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use sgm::training::data::{ProteinDataset, ProteinRecord};
use sgm::SgmConfig;

pub const CHANNELS: usize = 2;
pub const MAX_RES: usize = 8;

/// Smooth synthetic pair map for a protein of `length` residues.
pub fn synthetic_record(index: usize, length: usize) -> ProteinRecord {
    let mut coords_6d = Vec::with_capacity(CHANNELS * length * length);
    for c in 0..CHANNELS {
        for i in 0..length {
            for j in 0..length {
                let d = (i as f32 - j as f32).abs();
                coords_6d.push(((d + c as f32 + index as f32 * 0.1) * 0.3).sin());
            }
        }
    }
    ProteinRecord {
        id: format!("p{index}"),
        length,
        coords_6d,
        ss: None,
    }
}

/// Write a JSON-lines dataset of `n` proteins with 4..=8 residues.
pub fn write_dataset(dir: &Path, n: usize) -> PathBuf {
    let path = dir.join("proteins.jsonl");
    let lines: Vec<String> = (0..n)
        .map(|i| serde_json::to_string(&synthetic_record(i, 4 + i % 5)).unwrap())
        .collect();
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

pub fn tiny_config(n_iters: usize) -> SgmConfig {
    let toml = format!(
        r#"
        seed = 3

        [data]
        num_channels = {CHANNELS}
        max_res_num = {MAX_RES}
        min_res_num = 4
        train_fraction = 0.75

        [model]
        nf = 8
        ch_mult = [1, 2]
        num_res_blocks = 1
        dropout = 0.0
        init_scale = 1.0
        num_scales = 10
        sigma_max = 5.0
        context_dim = 4
        attn_heads = 1
        attn_head_dim = 8
        ema_rate = 0.9
        condition = ["length", "inpainting"]

        [training]
        sde = "vesde"
        n_iters = {n_iters}
        batch_size = 2
        log_freq = 2
        eval_freq = 3
        snapshot_freq = 4
        snapshot_freq_for_preemption = 2
        snapshot_sampling = true
        sampling_steps = 2

        [optim]
        lr = 1e-3
        warmup = 2
        "#
    );
    SgmConfig::from_toml_str(&toml).unwrap()
}

pub fn load(path: &Path, config: &SgmConfig) -> ProteinDataset {
    ProteinDataset::load_jsonl(path, &config.data).unwrap()
}
