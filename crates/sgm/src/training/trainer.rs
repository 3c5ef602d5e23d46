//! Score-model training loop.
//!
//! Ties together the batch sources, masking, the step functions, checkpoints
//! and snapshot sampling. The loop reads `state.step` but never advances it;
//! only the train step does.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::SgmConfig;
use crate::model::unet::ScoreUNet;
use crate::sampling::{EulerMaruyamaSampler, Sampler};
use crate::training::checkpoint::{
    find_rolling_checkpoint, load_checkpoint, save_checkpoint, save_rolling_checkpoint, save_sample,
    WorkDir,
};
use crate::training::condition::{build_context, random_mask_batch, Conditions};
use crate::training::data::{step_rng, step_seed, BatchSource, ProteinBatch, RngStream};
use crate::training::metrics::{log_scalar, MetricsSink};
use crate::training::step::{StepFn, TrainState};

/// `[training]` config section.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// `"vpsde"` or `"vesde"`.
    #[config(default = "String::from(\"vesde\")")]
    pub sde: String,
    /// Last step index; the loop runs steps `initial..=n_iters`.
    #[config(default = 1_300_000)]
    pub n_iters: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    /// Steps between `training_loss` records.
    #[config(default = 50)]
    pub log_freq: usize,
    /// Steps between `eval_loss` records.
    #[config(default = 100)]
    pub eval_freq: usize,
    /// Steps between milestone checkpoints.
    #[config(default = 50_000)]
    pub snapshot_freq: usize,
    /// Steps between rolling checkpoint overwrites.
    #[config(default = 10_000)]
    pub snapshot_freq_for_preemption: usize,
    /// Draw a sample with the EMA weights at every milestone.
    #[config(default = true)]
    pub snapshot_sampling: bool,
    /// Weight the loss by `g(t)²` instead of `σ(t)²`.
    #[config(default = false)]
    pub likelihood_weighting: bool,
    /// Reverse-SDE steps for snapshot samples. Defaults to `model.num_scales`.
    #[config(default = "None")]
    pub sampling_steps: Option<usize>,
}

/// What the loop does at one step, after the train step itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepActions {
    pub log: bool,
    pub preempt_checkpoint: bool,
    pub eval: bool,
    pub milestone: bool,
}

/// Decide the side effects of `step`.
pub fn step_actions(config: &TrainingConfig, step: usize) -> StepActions {
    let every = |freq: usize| freq > 0 && step % freq == 0;
    StepActions {
        log: every(config.log_freq),
        preempt_checkpoint: step != 0 && every(config.snapshot_freq_for_preemption),
        eval: every(config.eval_freq),
        milestone: (step != 0 && every(config.snapshot_freq)) || step == config.n_iters,
    }
}

/// Outcome of a [`train`] call.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Step the loop started from (non-zero after a resume).
    pub initial_step: usize,
    /// `state.step` when the loop ended.
    pub final_step: usize,
    pub last_train_loss: Option<f64>,
    pub last_eval_loss: Option<f64>,
    pub non_finite_losses: usize,
    pub milestones: Vec<PathBuf>,
    pub samples: Vec<PathBuf>,
    pub elapsed_secs: f64,
}

fn format_eta(remaining: f64) -> String {
    if remaining < 60.0 {
        format!("{:.0}s", remaining)
    } else if remaining < 3600.0 {
        format!("{:.0}m", remaining / 60.0)
    } else {
        format!("{:.1}h", remaining / 3600.0)
    }
}

fn masked_batch<B: Backend>(
    source: &mut dyn BatchSource<B>,
    step: usize,
    seed: u64,
    stream: RngStream,
    conditions: &Conditions,
    fraction: [f64; 2],
    device: &B::Device,
) -> anyhow::Result<ProteinBatch<B>> {
    let batch = source
        .next_batch(step, device)
        .with_context(|| format!("Failed to fetch batch at step {step}"))?;
    let mut rng = step_rng(seed, step, stream);
    let batch = random_mask_batch(batch, conditions, fraction, &mut rng);
    batch.validate()?;
    Ok(batch)
}

/// Run the training loop in `workdir`.
///
/// Resumes from the rolling checkpoint when one exists. Returns the final
/// state and a summary once step `n_iters` has completed.
pub fn train<B: AutodiffBackend>(
    config: &SgmConfig,
    workdir: &WorkDir,
    train_source: &mut dyn BatchSource<B>,
    eval_source: &mut dyn BatchSource<B>,
    sink: &mut dyn MetricsSink,
    device: &B::Device,
) -> anyhow::Result<(TrainState<B, impl Optimizer<ScoreUNet<B>, B>>, RunSummary)> {
    config.validate()?;
    let sde = config.build_sde()?;
    let conditions = config.conditions()?;
    let training = &config.training;
    let fraction = config.model.inpaint_fraction;
    let context_dim = config.model.context_dim;

    workdir.create()?;
    config
        .write_snapshot(&workdir.config_snapshot())
        .context("Failed to write config snapshot")?;

    B::seed(config.seed);
    let model = config
        .model
        .init::<B>(config.data.num_channels, &sde, device)?;
    let optimizer = config.optim.adam().init::<B, ScoreUNet<B>>();
    let mut state = match find_rolling_checkpoint(workdir) {
        Some(dir) => {
            let state = load_checkpoint(&dir, model, optimizer, config.model.ema_rate, device)
                .with_context(|| format!("Failed to resume from {}", dir.display()))?;
            tracing::info!(step = state.step, dir = %dir.display(), "Resumed from rolling checkpoint");
            state
        }
        None => TrainState::new(model, optimizer, config.model.ema_rate),
    };

    let step_fn = StepFn::new(
        sde.clone(),
        config.optim.clone(),
        training.likelihood_weighting,
        config.seed,
    );
    let sampler = EulerMaruyamaSampler::new(sde, config.data.num_channels, config.data.max_res_num)
        .with_steps(training.sampling_steps.unwrap_or(config.model.num_scales));

    let initial_step = state.step;
    let mut summary = RunSummary {
        initial_step,
        ..RunSummary::default()
    };
    let mut eval_batch: Option<ProteinBatch<B>> = None;
    let train_start = Instant::now();

    tracing::info!(
        initial_step,
        n_iters = training.n_iters,
        sde = %training.sde,
        batch_size = training.batch_size,
        "Starting training"
    );

    for step in initial_step..=training.n_iters {
        debug_assert_eq!(state.step, step);
        let actions = step_actions(training, step);

        let batch = masked_batch(
            train_source,
            step,
            config.seed,
            RngStream::TrainMask,
            &conditions,
            fraction,
            device,
        )?;
        let context = build_context(&batch, &conditions, context_dim)?;
        let loss = step_fn.train_step(&mut state, &batch, context);
        if !loss.is_finite() {
            summary.non_finite_losses += 1;
        }
        summary.last_train_loss = Some(loss);

        if actions.log {
            log_scalar(sink, "training_loss", loss, step);
            let done = step + 1 - initial_step;
            let elapsed = train_start.elapsed().as_secs_f64();
            let remaining = elapsed * (training.n_iters - step) as f64 / done as f64;
            let lr_str = format!("{:.2e}", step_fn.lr_at(step));
            tracing::info!(step, loss, lr = %lr_str, eta = format_eta(remaining), "training_loss");
        }

        if actions.preempt_checkpoint {
            save_rolling_checkpoint(workdir, &state)
                .with_context(|| format!("Failed to save rolling checkpoint at step {step}"))?;
            tracing::debug!(step, "Rolling checkpoint saved");
        }

        if actions.eval {
            let batch = masked_batch(
                eval_source,
                step,
                config.seed,
                RngStream::EvalMask,
                &conditions,
                fraction,
                device,
            )?;
            let context = build_context(&batch, &conditions, context_dim)?;
            let eval_loss = step_fn.eval_step(&state, &batch, context);
            if !eval_loss.is_finite() {
                summary.non_finite_losses += 1;
            }
            log_scalar(sink, "eval_loss", eval_loss, step);
            tracing::info!(step, eval_loss, "eval_loss");
            summary.last_eval_loss = Some(eval_loss);
            eval_batch = Some(batch);
        }

        if actions.milestone {
            let dir = workdir.milestone(step);
            save_checkpoint(&dir, &state)
                .with_context(|| format!("Failed to save checkpoint at step {step}"))?;
            tracing::info!(step, dir = %dir.display(), "Checkpoint saved (model + ema + optimizer + meta)");
            summary.milestones.push(dir);

            if training.snapshot_sampling {
                let batch = match eval_batch.take() {
                    Some(batch) => batch,
                    None => masked_batch(
                        eval_source,
                        step,
                        config.seed,
                        RngStream::EvalMask,
                        &conditions,
                        fraction,
                        device,
                    )?,
                };
                let context = build_context(&batch, &conditions, context_dim)?.inner();
                B::seed(step_seed(config.seed, step, RngStream::Sampling));
                let (sample, n) = state
                    .ema
                    .with_ema_weights(|ema| sampler.sample(ema, context))
                    .with_context(|| format!("Sampling failed at step {step}"))?;
                let path = save_sample(&workdir.samples(step), sample)?;
                tracing::info!(step, steps = n, path = %path.display(), "Sample saved");
                summary.samples.push(path);
                eval_batch = Some(batch);
            }
        }
    }

    summary.final_step = state.step;
    summary.elapsed_secs = train_start.elapsed().as_secs_f64();
    tracing::info!(
        final_step = summary.final_step,
        milestones = summary.milestones.len(),
        non_finite = summary.non_finite_losses,
        elapsed_secs = format!("{:.1}", summary.elapsed_secs),
        "Training loop finished"
    );
    if summary.non_finite_losses > 0 {
        tracing::warn!(
            count = summary.non_finite_losses,
            "Non-finite losses were observed during training"
        );
    }

    Ok((state, summary))
}
