use std::path::PathBuf;

/// Errors raised by the diffusion core, the training session and the
/// sampling pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two tensors that must agree on their shape do not. Never broadcast
    /// around this.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch { context: &'static str, expected: Vec<i64>, got: Vec<i64> },

    #[error("invalid noise schedule: {0}")]
    InvalidSchedule(String),

    #[error("cannot respace {num_timesteps} timesteps with {spec:?}: {reason}")]
    InvalidRespacing { num_timesteps: usize, spec: String, reason: String },

    #[error("checkpoint not available: {0:?}")]
    MissingCheckpoint(Option<PathBuf>),

    #[error("non-finite loss at step {step} after {skipped} consecutive skipped steps")]
    NonFiniteLoss { step: usize, skipped: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unexpected output from scripted module {module}: {reason}")]
    ScriptedOutput { module: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(context: &'static str, expected: &[i64], got: &[i64]) -> Self {
        Self::ShapeMismatch { context, expected: expected.to_vec(), got: got.to_vec() }
    }
}
