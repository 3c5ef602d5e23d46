use std::path::PathBuf;

/// Errors raised while configuring, training or restoring a score model.
#[derive(Debug, thiserror::Error)]
pub enum SgmError {
    /// `training.sde` did not name a known noise schedule.
    #[error("SDE {0:?} unknown (expected \"vpsde\" or \"vesde\")")]
    UnknownSde(String),

    /// `model.resblock_type` did not name a known residual block.
    #[error("resblock type {0:?} unrecognized (expected \"ddpm\" or \"biggan\")")]
    UnknownResblock(String),

    /// `model.embedding_type` did not name a known time embedding.
    #[error("embedding type {0:?} unrecognized (expected \"positional\" or \"fourier\")")]
    UnknownEmbedding(String),

    /// `model.nonlinearity` did not name a supported activation.
    #[error("activation function {0:?} not supported")]
    UnknownActivation(String),

    /// An entry of `model.condition` is not a known conditioning signal.
    #[error("condition {0:?} unrecognized (expected \"length\", \"ss\" or \"inpainting\")")]
    UnknownCondition(String),

    /// A configuration value is structurally invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Batch mask does not line up with the pair feature map.
    #[error("mask shape {mask:?} does not match data shape {data:?}")]
    MaskShape { mask: Vec<usize>, data: Vec<usize> },

    /// Checkpoint parameters do not match the freshly built network.
    #[error("checkpoint {path} is incompatible with the model: {detail}")]
    CheckpointShape { path: PathBuf, detail: String },

    /// Reading or writing a record file failed.
    #[error("checkpoint record error at {path}: {message}")]
    Record { path: PathBuf, message: String },

    /// Dataset yielded no usable examples.
    #[error("dataset is empty: {0}")]
    EmptyDataset(String),

    /// IO error from checkpoint, dataset or metrics files.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error from checkpoint metadata or dataset lines.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
