mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{SampleArgs, TrainArgs};

/// sgm: score-based diffusion training and sampling for protein pair maps.
#[derive(Parser)]
#[command(name = "sgm", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a score model, resuming from the work directory's rolling checkpoint.
    Train {
        /// Path to the run config TOML file.
        #[arg(long, default_value = "configs/evosgm_length.toml")]
        config: PathBuf,
        /// Directory for checkpoints, samples, metrics and the config snapshot.
        #[arg(long)]
        workdir: PathBuf,
        /// Override `data.dataset_path`.
        #[arg(long)]
        dataset: Option<PathBuf>,
        /// Override `training.n_iters`.
        #[arg(long)]
        n_iters: Option<usize>,
        /// Override the top-level `seed`.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Draw pair maps with the EMA weights of a checkpoint.
    Sample {
        /// Path to the run config TOML file used for training.
        #[arg(long, default_value = "configs/evosgm_length.toml")]
        config: PathBuf,
        /// Checkpoint directory (e.g. `<workdir>/checkpoints/checkpoint_50000`).
        #[arg(long)]
        checkpoint: PathBuf,
        /// Comma-separated residue counts, one sample per entry.
        #[arg(long, value_delimiter = ',', required = true)]
        lengths: Vec<usize>,
        /// Output directory for `sample.mpk`.
        #[arg(long)]
        output: PathBuf,
        /// Reverse-SDE steps. Defaults to `training.sampling_steps`, then `model.num_scales`.
        #[arg(long)]
        steps: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            workdir,
            dataset,
            n_iters,
            seed,
        } => pipeline::run_train(TrainArgs {
            config,
            workdir,
            dataset,
            n_iters,
            seed,
        }),
        Command::Sample {
            config,
            checkpoint,
            lengths,
            output,
            steps,
        } => pipeline::run_sample(SampleArgs {
            config,
            checkpoint,
            lengths,
            output,
            steps,
        }),
    }
}
