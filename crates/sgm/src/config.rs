//! Top-level run configuration loaded from TOML.
//!
//! Each section is a burn `Config`, so builders are available in code. The
//! document is merged over the serialised defaults before deserialising, so
//! omitted keys keep their default values. `model.scale_by_sigma` defaults to
//! `false` under the VP schedule, whose score function already divides by
//! `std(t)`:
//!
//! ```toml
//! seed = 42
//! [data]
//! max_res_num = 128
//! [model]
//! condition = ["length", "inpainting"]
//! [training]
//! sde = "vesde"
//! [optim]
//! lr = 2e-4
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SgmError;
use crate::model::unet::ScoreNetConfig;
use crate::sde::{Sde, SdeKind};
use crate::training::condition::Conditions;
use crate::training::data::DataConfig;
use crate::training::step::OptimConfig;
use crate::training::trainer::TrainingConfig;

fn default_seed() -> u64 {
    42
}

fn default_device() -> String {
    "cpu".to_string()
}

/// Full run configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SgmConfig {
    /// Seeds every data, mask and noise stream.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "DataConfig::new")]
    pub data: DataConfig,
    #[serde(default = "ScoreNetConfig::new")]
    pub model: ScoreNetConfig,
    #[serde(default = "TrainingConfig::new")]
    pub training: TrainingConfig,
    #[serde(default = "OptimConfig::new")]
    pub optim: OptimConfig,
}

impl Default for SgmConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            device: default_device(),
            data: DataConfig::new(),
            model: ScoreNetConfig::new(),
            training: TrainingConfig::new(),
            optim: OptimConfig::new(),
        }
    }
}

impl SgmConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, SgmError> {
        let user: toml::Table = toml::from_str(contents)
            .map_err(|e| SgmError::InvalidConfig(format!("TOML parse error: {e}")))?;
        let scale_by_sigma_set = user
            .get("model")
            .and_then(toml::Value::as_table)
            .is_some_and(|model| model.contains_key("scale_by_sigma"));

        let mut merged = match toml::Value::try_from(Self::default()) {
            Ok(toml::Value::Table(table)) => table,
            Ok(other) => {
                return Err(SgmError::InvalidConfig(format!(
                    "default config serialised to a {} instead of a table",
                    other.type_str()
                )))
            }
            Err(e) => {
                return Err(SgmError::InvalidConfig(format!(
                    "failed to serialise default config: {e}"
                )))
            }
        };
        merge_tables(&mut merged, user);
        let mut config: Self = toml::Value::Table(merged)
            .try_into()
            .map_err(|e| SgmError::InvalidConfig(format!("TOML parse error: {e}")))?;

        if !scale_by_sigma_set && matches!(config.training.sde.parse::<SdeKind>(), Ok(SdeKind::Vp)) {
            config.model.scale_by_sigma = false;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SgmError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Check everything that can be checked without allocating tensors.
    pub fn validate(&self) -> Result<(), SgmError> {
        self.training.sde.parse::<SdeKind>()?;
        self.model.choices()?;
        self.conditions()?;
        let plan = self.model.plan(self.data.num_channels)?;
        plan.check_skip_balance()?;

        let levels = self.model.ch_mult.len();
        let factor = 1usize << (levels - 1);
        if self.data.max_res_num == 0 || self.data.max_res_num % factor != 0 {
            return Err(SgmError::InvalidConfig(format!(
                "data.max_res_num ({}) must be a positive multiple of {factor} for {levels} resolution levels",
                self.data.max_res_num
            )));
        }
        if self.data.min_res_num > self.data.max_res_num {
            return Err(SgmError::InvalidConfig(format!(
                "data.min_res_num ({}) exceeds data.max_res_num ({})",
                self.data.min_res_num, self.data.max_res_num
            )));
        }
        if !(self.data.train_fraction > 0.0 && self.data.train_fraction < 1.0) {
            return Err(SgmError::InvalidConfig(format!(
                "data.train_fraction must be in (0, 1), got {}",
                self.data.train_fraction
            )));
        }

        let t = &self.training;
        for (name, value) in [
            ("training.batch_size", t.batch_size),
            ("training.log_freq", t.log_freq),
            ("training.eval_freq", t.eval_freq),
            ("training.snapshot_freq", t.snapshot_freq),
            ("training.snapshot_freq_for_preemption", t.snapshot_freq_for_preemption),
        ] {
            if value == 0 {
                return Err(SgmError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if t.sampling_steps == Some(0) {
            return Err(SgmError::InvalidConfig(
                "training.sampling_steps must be positive".to_string(),
            ));
        }

        let [lo, hi] = self.model.inpaint_fraction;
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
            return Err(SgmError::InvalidConfig(format!(
                "model.inpaint_fraction must satisfy 0 <= lo <= hi <= 1, got [{lo}, {hi}]"
            )));
        }
        let sde = self.build_sde()?;
        if sde.kind() == SdeKind::Vp && self.model.scale_by_sigma {
            return Err(SgmError::InvalidConfig(
                "model.scale_by_sigma must be false with the VP SDE".to_string(),
            ));
        }
        Ok(())
    }

    /// Noise schedule selected by `training.sde`.
    pub fn build_sde(&self) -> Result<Sde, SgmError> {
        Sde::from_config(
            &self.training.sde,
            self.model.beta_min,
            self.model.beta_max,
            self.model.sigma_min,
            self.model.sigma_max,
            self.model.num_scales,
        )
    }

    pub fn conditions(&self) -> Result<Conditions, SgmError> {
        Conditions::parse(&self.model.condition)
    }

    /// Write the resolved configuration as pretty JSON.
    pub fn write_snapshot(&self, path: &Path) -> Result<(), SgmError> {
        serde_json::to_writer_pretty(std::fs::File::create(path)?, self)?;
        Ok(())
    }
}

/// Recursively overwrite `base` with the entries of `overlay`.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(inner) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, inner),
                _ => {
                    base.insert(key, toml::Value::Table(inner));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}
