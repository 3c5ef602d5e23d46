//! Score network: layer plan, building blocks and the EMA shadow.

pub mod attention;
pub mod ema;
pub mod layers;
pub mod plan;
pub mod resblock;
pub mod unet;
