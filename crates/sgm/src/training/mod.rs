//! Training pipeline: data and masking, the DSM loss and step functions,
//! checkpoints, metrics and the loop itself.

pub mod checkpoint;
pub mod condition;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod step;
pub mod trainer;
