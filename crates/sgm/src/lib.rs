//! Score-based generative modelling of protein pair feature maps.
//!
//! A UNet-style score network is trained by denoising score matching under a
//! VP or VE SDE, with rolling and milestone checkpoints, periodic evaluation
//! and EMA snapshot sampling through a reverse-SDE sampler.

pub mod config;
pub mod error;
pub mod model;
pub mod sampling;
pub mod sde;
pub mod training;

pub use config::SgmConfig;
pub use error::SgmError;
pub use model::unet::{ScoreNetConfig, ScoreUNet};
pub use sampling::{EulerMaruyamaSampler, Sampler};
pub use sde::{Sde, SdeKind};
pub use training::trainer::{train, RunSummary, TrainingConfig};
