//! Error kinds shared by every diffusionkit crate.

use thiserror::Error;

/// Everything that can go wrong between option validation and pixel output.
#[derive(Error, Debug)]
pub enum DiffusionError {
    #[error("failed to load model '{name}': {reason}")]
    ModelLoadFailed { name: String, reason: String },

    #[error("inference failed in '{name}': {reason}")]
    InferenceFailed { name: String, reason: String },

    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("diffuser {0:?} is not supported by this pipeline")]
    UnsupportedDiffuser(crate::options::DiffuserType),

    #[error("scheduler {0:?} is not supported by this pipeline")]
    UnsupportedScheduler(crate::options::SchedulerType),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("generation was cancelled")]
    Cancelled,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl DiffusionError {
    pub fn model_load(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ModelLoadFailed { name: name.into(), reason: reason.to_string() }
    }

    pub fn inference(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InferenceFailed { name: name.into(), reason: reason.to_string() }
    }

    pub fn shape(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch { expected: expected.into(), actual: actual.into() }
    }
}

pub type Result<T> = std::result::Result<T, DiffusionError>;
