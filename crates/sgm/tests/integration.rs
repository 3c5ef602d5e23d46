//! Integration tests for the sgm crate.
//!
//! These run the full loop on a tiny synthetic dataset: data loading, masking,
//! train/eval steps, rolling and milestone checkpoints, EMA sampling and
//! metrics. All use the NdArray backend.

mod common;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use tempfile::TempDir;

use sgm::training::checkpoint::{load_ema_weights, load_sample, read_meta, WorkDir};
use sgm::training::data::train_eval_samplers;
use sgm::training::metrics::{MemoryMetricsSink, MetricsSink};
use sgm::{train, EulerMaruyamaSampler, Sampler, SgmError};

use common::{load, tiny_config, write_dataset, CHANNELS, MAX_RES};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

struct FailingSink {
    calls: usize,
}

impl MetricsSink for FailingSink {
    fn add_scalar(&mut self, _: &str, _: f64, _: usize) -> Result<(), SgmError> {
        self.calls += 1;
        Err(SgmError::Io(std::io::Error::other("sink offline")))
    }
}

#[test]
fn test_full_training_run_writes_artifacts() {
    let tmp = TempDir::new().unwrap();
    let config = tiny_config(6);
    let dataset = load(&write_dataset(tmp.path(), 8), &config);
    let (mut train_src, mut eval_src) =
        train_eval_samplers(dataset, &config.data, config.training.batch_size, config.seed).unwrap();
    let workdir = WorkDir::new(tmp.path().join("run"));
    let mut sink = MemoryMetricsSink::new();
    let device = Default::default();

    let (state, summary) = train::<TestAutodiffBackend>(
        &config,
        &workdir,
        &mut train_src,
        &mut eval_src,
        &mut sink,
        &device,
    )
    .unwrap();

    assert_eq!(summary.initial_step, 0);
    assert_eq!(summary.final_step, 7);
    assert_eq!(state.step, 7);
    assert_eq!(state.ema.num_updates(), 7);
    assert!(summary.last_train_loss.unwrap().is_finite());
    assert_eq!(summary.non_finite_losses, 0);

    let steps = |name: &str| sink.series(name).into_iter().map(|(s, _)| s).collect::<Vec<_>>();
    assert_eq!(steps("training_loss"), vec![0, 2, 4, 6]);
    assert_eq!(steps("eval_loss"), vec![0, 3, 6]);

    // Milestones at the snapshot frequency and at the final step.
    assert_eq!(summary.milestones, vec![workdir.milestone(4), workdir.milestone(6)]);
    for dir in &summary.milestones {
        for file in ["model.mpk", "ema.mpk", "optimizer.mpk", "meta.json"] {
            assert!(dir.join(file).is_file(), "{} lacks {file}", dir.display());
        }
    }
    assert_eq!(read_meta(&workdir.milestone(4)).unwrap().step, 5);

    // Rolling checkpoint was last overwritten at step 6.
    assert_eq!(read_meta(&workdir.rolling()).unwrap().step, 7);
    assert!(workdir.config_snapshot().is_file());

    assert_eq!(summary.samples.len(), 2);
    let sample = load_sample::<TestBackend>(&summary.samples[1], &device).unwrap();
    assert_eq!(
        sample.dims(),
        [config.training.batch_size, CHANNELS, MAX_RES, MAX_RES]
    );
}

#[test]
fn test_failing_metrics_sink_does_not_stop_training() {
    let tmp = TempDir::new().unwrap();
    let mut config = tiny_config(3);
    config.training.snapshot_sampling = false;
    let dataset = load(&write_dataset(tmp.path(), 6), &config);
    let (mut train_src, mut eval_src) =
        train_eval_samplers(dataset, &config.data, config.training.batch_size, config.seed).unwrap();
    let mut sink = FailingSink { calls: 0 };

    let (_, summary) = train::<TestAutodiffBackend>(
        &config,
        &WorkDir::new(tmp.path().join("run")),
        &mut train_src,
        &mut eval_src,
        &mut sink,
        &Default::default(),
    )
    .unwrap();
    assert_eq!(summary.final_step, 4);
    assert!(summary.samples.is_empty());
    // training_loss at 0 and 2, eval_loss at 0 and 3.
    assert_eq!(sink.calls, 4);
}

#[test]
fn test_mismatched_checkpoint_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut config = tiny_config(2);
    config.training.snapshot_sampling = false;
    let dataset = load(&write_dataset(tmp.path(), 6), &config);
    let workdir = WorkDir::new(tmp.path().join("run"));
    let device = Default::default();

    let (mut train_src, mut eval_src) = train_eval_samplers(
        dataset.clone(),
        &config.data,
        config.training.batch_size,
        config.seed,
    )
    .unwrap();
    train::<TestAutodiffBackend>(
        &config,
        &workdir,
        &mut train_src,
        &mut eval_src,
        &mut MemoryMetricsSink::new(),
        &device,
    )
    .unwrap();

    // A wider network cannot adopt the stored weights.
    let mut wider = config.clone();
    wider.model.nf = 16;
    let sde = wider.build_sde().unwrap();
    let template = wider
        .model
        .init::<TestBackend>(CHANNELS, &sde, &device)
        .unwrap();
    assert!(matches!(
        load_ema_weights(&workdir.milestone(2), template, &device),
        Err(SgmError::CheckpointShape { .. })
    ));

    // Resuming the run with the wider network fails the same way.
    wider.training.n_iters = 4;
    let (mut train_src, mut eval_src) =
        train_eval_samplers(dataset, &wider.data, wider.training.batch_size, wider.seed).unwrap();
    let err = train::<TestAutodiffBackend>(
        &wider,
        &workdir,
        &mut train_src,
        &mut eval_src,
        &mut MemoryMetricsSink::new(),
        &device,
    )
    .err()
    .expect("resume must fail");
    assert!(matches!(
        err.downcast_ref::<SgmError>(),
        Some(SgmError::CheckpointShape { .. })
    ));
}

#[test]
fn test_ema_weights_sample_from_milestone() {
    let tmp = TempDir::new().unwrap();
    let mut config = tiny_config(4);
    config.training.snapshot_sampling = false;
    let dataset = load(&write_dataset(tmp.path(), 6), &config);
    let (mut train_src, mut eval_src) =
        train_eval_samplers(dataset, &config.data, config.training.batch_size, config.seed).unwrap();
    let workdir = WorkDir::new(tmp.path().join("run"));
    let device = Default::default();
    train::<TestAutodiffBackend>(
        &config,
        &workdir,
        &mut train_src,
        &mut eval_src,
        &mut MemoryMetricsSink::new(),
        &device,
    )
    .unwrap();

    let sde = config.build_sde().unwrap();
    let template = config
        .model
        .init::<TestBackend>(CHANNELS, &sde, &device)
        .unwrap();
    let model = load_ema_weights(&workdir.milestone(4), template, &device).unwrap();
    let context = sgm::training::condition::length_context::<TestBackend>(
        &[5, 8],
        config.model.context_dim,
        &device,
    );
    let sampler = EulerMaruyamaSampler::new(sde, CHANNELS, MAX_RES).with_steps(3);
    let (sample, n) = sampler.sample(&model, context).unwrap();
    assert_eq!(n, 3);
    assert_eq!(sample.dims(), [2, CHANNELS, MAX_RES, MAX_RES]);
    let values: Vec<f32> = sample.into_data().to_vec().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
}
