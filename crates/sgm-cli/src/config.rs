//! Config loading for the sgm CLI.
//!
//! Reads the run TOML through [`SgmConfig::load`], then applies command-line
//! overrides. Priority chain: section defaults < TOML values < CLI flags.

use std::path::{Path, PathBuf};

use burn::backend::ndarray::NdArrayDevice;
use sgm::SgmConfig;

/// Optional CLI overrides for a training run.
#[derive(Debug, Default, Clone)]
pub struct TrainOverrides {
    pub dataset: Option<PathBuf>,
    pub n_iters: Option<usize>,
    pub seed: Option<u64>,
}

/// Load `path` and apply `overrides`, re-validating the result.
pub fn load_with_overrides(path: &Path, overrides: &TrainOverrides) -> anyhow::Result<SgmConfig> {
    let config = SgmConfig::load(path)?;
    apply_overrides(config, overrides)
}

pub fn apply_overrides(mut config: SgmConfig, overrides: &TrainOverrides) -> anyhow::Result<SgmConfig> {
    if let Some(path) = &overrides.dataset {
        config.data.dataset_path = Some(path.display().to_string());
    }
    if let Some(n) = overrides.n_iters {
        config.training.n_iters = n;
    }
    if let Some(seed) = overrides.seed {
        config.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

/// Dataset file named by the config, which must be set by now.
pub fn dataset_path(config: &SgmConfig) -> anyhow::Result<PathBuf> {
    config
        .data
        .dataset_path
        .as_ref()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("No dataset: set data.dataset_path or pass --dataset"))
}

/// Only the CPU ndarray backend is built into this binary.
pub fn select_device(name: &str) -> anyhow::Result<NdArrayDevice> {
    match name.to_ascii_lowercase().as_str() {
        "cpu" => Ok(NdArrayDevice::Cpu),
        other => anyhow::bail!("Device {other:?} unsupported by this build (expected \"cpu\")"),
    }
}
