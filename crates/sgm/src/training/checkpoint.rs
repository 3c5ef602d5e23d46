//! Checkpoint and sample persistence.
//!
//! A checkpoint directory holds `model.mpk`, `ema.mpk`, `optimizer.mpk` and
//! `meta.json`. The rolling checkpoint is written to a sibling temp directory
//! and renamed into place, so a reader never observes a half-written one.

use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder, RecorderError};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::SgmError;
use crate::model::ema::{param_shapes, ExponentialMovingAverage};
use crate::model::unet::ScoreUNet;
use crate::training::step::TrainState;

const MODEL_FILE: &str = "model";
const EMA_FILE: &str = "ema";
const OPTIMIZER_FILE: &str = "optimizer";
const META_FILE: &str = "meta.json";

/// Metadata saved alongside each checkpoint for resuming training.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Number of completed train steps.
    pub step: usize,
    pub ema_num_updates: u64,
    /// Shape of every float parameter, in visit order.
    pub param_shapes: Vec<Vec<usize>>,
}

/// Layout of a training work directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rolling checkpoint, overwritten in place.
    pub fn rolling(&self) -> PathBuf {
        self.root.join("checkpoints-meta")
    }

    pub fn milestones(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    /// Milestone checkpoint for `step`. Never overwritten by later steps.
    pub fn milestone(&self, step: usize) -> PathBuf {
        self.milestones().join(format!("checkpoint_{step}"))
    }

    pub fn samples(&self, step: usize) -> PathBuf {
        self.root.join("samples").join(format!("iter_{step}"))
    }

    pub fn metrics(&self) -> PathBuf {
        self.root.join("metrics.jsonl")
    }

    pub fn config_snapshot(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn create(&self) -> Result<(), SgmError> {
        std::fs::create_dir_all(self.milestones())?;
        std::fs::create_dir_all(self.root.join("samples"))?;
        Ok(())
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

fn record_err(path: PathBuf) -> impl FnOnce(RecorderError) -> SgmError {
    move |e| SgmError::Record {
        path,
        message: e.to_string(),
    }
}

/// Write the full training state into `dir`, creating it if needed.
pub fn save_checkpoint<B, O>(dir: &Path, state: &TrainState<B, O>) -> Result<(), SgmError>
where
    B: AutodiffBackend,
    O: Optimizer<ScoreUNet<B>, B>,
{
    std::fs::create_dir_all(dir)?;
    let recorder = recorder();

    let model_path = dir.join(MODEL_FILE);
    state
        .model
        .clone()
        .save_file(&model_path, &recorder)
        .map_err(record_err(model_path))?;

    let ema_path = dir.join(EMA_FILE);
    state
        .ema
        .shadow()
        .clone()
        .save_file(&ema_path, &recorder)
        .map_err(record_err(ema_path))?;

    let optim_path = dir.join(OPTIMIZER_FILE);
    recorder
        .record(state.optimizer.to_record(), optim_path.clone())
        .map_err(record_err(optim_path))?;

    let meta = CheckpointMeta {
        step: state.step,
        ema_num_updates: state.ema.num_updates(),
        param_shapes: param_shapes(&state.model),
    };
    serde_json::to_writer_pretty(std::fs::File::create(dir.join(META_FILE))?, &meta)?;
    Ok(())
}

/// Overwrite the rolling checkpoint atomically.
pub fn save_rolling_checkpoint<B, O>(workdir: &WorkDir, state: &TrainState<B, O>) -> Result<(), SgmError>
where
    B: AutodiffBackend,
    O: Optimizer<ScoreUNet<B>, B>,
{
    let target = workdir.rolling();
    let tmp = target.with_extension("tmp");
    let old = target.with_extension("old");
    if tmp.exists() {
        std::fs::remove_dir_all(&tmp)?;
    }
    save_checkpoint(&tmp, state)?;

    if target.exists() {
        if old.exists() {
            std::fs::remove_dir_all(&old)?;
        }
        std::fs::rename(&target, &old)?;
    }
    std::fs::rename(&tmp, &target)?;
    if old.exists() {
        std::fs::remove_dir_all(&old)?;
    }
    Ok(())
}

/// Rolling checkpoint directory to resume from, if one exists.
///
/// Falls back to the previous copy when a crash hit between the two renames.
pub fn find_rolling_checkpoint(workdir: &WorkDir) -> Option<PathBuf> {
    let target = workdir.rolling();
    let old = target.with_extension("old");
    [target, old]
        .into_iter()
        .find(|dir| dir.join(META_FILE).is_file())
}

pub fn read_meta(dir: &Path) -> Result<CheckpointMeta, SgmError> {
    let file = std::fs::File::open(dir.join(META_FILE))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

fn check_shapes<B: Backend>(
    dir: &Path,
    meta: &CheckpointMeta,
    template: &ScoreUNet<B>,
) -> Result<(), SgmError> {
    let expected = param_shapes(template);
    if expected.len() != meta.param_shapes.len() {
        return Err(SgmError::CheckpointShape {
            path: dir.to_path_buf(),
            detail: format!(
                "{} parameter tensors stored, model has {}",
                meta.param_shapes.len(),
                expected.len()
            ),
        });
    }
    if let Some((i, (stored, wanted))) = meta
        .param_shapes
        .iter()
        .zip(&expected)
        .enumerate()
        .find(|(_, (stored, wanted))| stored != wanted)
    {
        return Err(SgmError::CheckpointShape {
            path: dir.to_path_buf(),
            detail: format!("parameter #{i} stored as {stored:?}, model expects {wanted:?}"),
        });
    }
    Ok(())
}

/// Restore a training state from `dir` on top of freshly built components.
///
/// The shape manifest is checked before any record is read.
pub fn load_checkpoint<B, O>(
    dir: &Path,
    model: ScoreUNet<B>,
    optimizer: O,
    ema_rate: f64,
    device: &B::Device,
) -> Result<TrainState<B, O>, SgmError>
where
    B: AutodiffBackend,
    O: Optimizer<ScoreUNet<B>, B>,
{
    let meta = read_meta(dir)?;
    check_shapes(dir, &meta, &model)?;
    let recorder = recorder();

    let shadow_template = model.valid();
    let model_path = dir.join(MODEL_FILE);
    let model = model
        .load_file(&model_path, &recorder, device)
        .map_err(record_err(model_path))?;

    let ema_path = dir.join(EMA_FILE);
    let shadow = shadow_template
        .load_file(&ema_path, &recorder, device)
        .map_err(record_err(ema_path))?;

    let optim_path = dir.join(OPTIMIZER_FILE);
    let optim_record = recorder
        .load(optim_path.clone(), device)
        .map_err(record_err(optim_path))?;
    let optimizer = optimizer.load_record(optim_record);

    Ok(TrainState {
        model,
        optimizer,
        ema: ExponentialMovingAverage::from_parts(shadow, ema_rate, meta.ema_num_updates),
        step: meta.step,
    })
}

/// Load only the EMA weights of a checkpoint, for sampling.
pub fn load_ema_weights<B: Backend>(
    dir: &Path,
    template: ScoreUNet<B>,
    device: &B::Device,
) -> Result<ScoreUNet<B>, SgmError> {
    let meta = read_meta(dir)?;
    check_shapes(dir, &meta, &template)?;
    let ema_path = dir.join(EMA_FILE);
    template
        .load_file(&ema_path, &recorder(), device)
        .map_err(record_err(ema_path))
}

/// Persist a generated sample as `<dir>/sample.mpk`. Returns the file path.
pub fn save_sample<B: Backend>(dir: &Path, sample: Tensor<B, 4>) -> Result<PathBuf, SgmError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("sample");
    recorder()
        .record(sample, path.clone())
        .map_err(record_err(path.clone()))?;
    Ok(path.with_extension("mpk"))
}

/// Read a sample written by [`save_sample`].
pub fn load_sample<B: Backend>(path: &Path, device: &B::Device) -> Result<Tensor<B, 4>, SgmError> {
    recorder()
        .load(path.with_extension(""), device)
        .map_err(record_err(path.to_path_buf()))
}
