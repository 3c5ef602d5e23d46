//! `train` and `sample` command implementations.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use burn::tensor::TensorData;

use sgm::training::checkpoint::{load_ema_weights, save_sample, WorkDir};
use sgm::training::condition::length_context;
use sgm::training::data::{train_eval_samplers, ProteinDataset};
use sgm::training::metrics::JsonlMetricsSink;
use sgm::{train, EulerMaruyamaSampler, Sampler};

use crate::config::{dataset_path, load_with_overrides, select_device, TrainOverrides};

type InferenceBackend = NdArray<f32>;
type TrainBackend = Autodiff<InferenceBackend>;

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    pub config: PathBuf,
    pub workdir: PathBuf,
    pub dataset: Option<PathBuf>,
    pub n_iters: Option<usize>,
    pub seed: Option<u64>,
}

/// Arguments for the `sample` subcommand.
#[derive(Debug)]
pub struct SampleArgs {
    pub config: PathBuf,
    pub checkpoint: PathBuf,
    pub lengths: Vec<usize>,
    pub output: PathBuf,
    pub steps: Option<usize>,
}

/// Train a score model in `args.workdir`.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let overrides = TrainOverrides {
        dataset: args.dataset,
        n_iters: args.n_iters,
        seed: args.seed,
    };
    let config = load_with_overrides(&args.config, &overrides)?;
    let device = select_device(&config.device)?;

    let data_path = dataset_path(&config)?;
    let dataset = ProteinDataset::load_jsonl(&data_path, &config.data)
        .with_context(|| format!("Failed to load dataset {}", data_path.display()))?;
    let (mut train_src, mut eval_src) = train_eval_samplers(
        dataset,
        &config.data,
        config.training.batch_size,
        config.seed,
    )?;

    let workdir = WorkDir::new(&args.workdir);
    workdir.create()?;
    let mut sink = JsonlMetricsSink::open(&workdir.metrics())?;

    let (_, summary) = train::<TrainBackend>(
        &config,
        &workdir,
        &mut train_src,
        &mut eval_src,
        &mut sink,
        &device,
    )?;

    println!("steps:        {} -> {}", summary.initial_step, summary.final_step);
    if let Some(loss) = summary.last_train_loss {
        println!("train loss:   {loss:.5}");
    }
    if let Some(loss) = summary.last_eval_loss {
        println!("eval loss:    {loss:.5}");
    }
    println!("checkpoints:  {}", summary.milestones.len());
    println!("samples:      {}", summary.samples.len());
    println!("metrics:      {}", sink.path().display());
    println!("elapsed:      {:.1}s", summary.elapsed_secs);
    Ok(())
}

/// Sample pair maps for the requested lengths with a checkpoint's EMA weights.
pub fn run_sample(args: SampleArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let config = load_with_overrides(&args.config, &TrainOverrides::default())?;
    let device = select_device(&config.device)?;
    let max_res = config.data.max_res_num;

    if args.lengths.is_empty() {
        anyhow::bail!("--lengths must name at least one residue count");
    }
    if let Some(&bad) = args.lengths.iter().find(|&&n| n == 0 || n > max_res) {
        anyhow::bail!("Length {bad} outside 1..={max_res} (data.max_res_num)");
    }

    let sde = config.build_sde()?;
    let template = config
        .model
        .init::<InferenceBackend>(config.data.num_channels, &sde, &device)?;
    let model = load_ema_weights(&args.checkpoint, template, &device)
        .with_context(|| format!("Failed to load EMA weights from {}", args.checkpoint.display()))?;

    let conditions = config.conditions()?;
    let batch = args.lengths.len();
    let context_dim = config.model.context_dim;
    let context = if conditions.length {
        length_context::<InferenceBackend>(&args.lengths, context_dim, &device)
    } else {
        Tensor::zeros([batch, 1, context_dim], &device)
    };
    if conditions.ss || conditions.inpainting {
        tracing::warn!("Sampling ignores ss and inpainting conditions; only length is applied");
    }

    let steps = args
        .steps
        .or(config.training.sampling_steps)
        .unwrap_or(config.model.num_scales);
    let sampler = EulerMaruyamaSampler::new(sde, config.data.num_channels, max_res).with_steps(steps);
    let (sample, n) = sampler.sample(&model, context)?;

    // Zero every pair outside each protein.
    let mut mask = vec![0.0f32; batch * max_res];
    for (b, &n_res) in args.lengths.iter().enumerate() {
        mask[b * max_res..b * max_res + n_res].fill(1.0);
    }
    let mask = Tensor::<InferenceBackend, 2>::from_data(TensorData::new(mask, [batch, max_res]), &device);
    let pair = mask.clone().unsqueeze_dim::<3>(2) * mask.unsqueeze_dim::<3>(1);
    let sample = sample * pair.unsqueeze_dim::<4>(1);

    let path = save_sample(&args.output, sample)?;
    tracing::info!(
        steps = n,
        samples = batch,
        path = %path.display(),
        elapsed_secs = format!("{:.1}", start.elapsed().as_secs_f64()),
        "Sampling complete"
    );
    println!("{}", path.display());
    Ok(())
}
