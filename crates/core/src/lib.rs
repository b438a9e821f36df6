//! diffusionkit_core - Shared types for the diffusionkit runtime
//!
//! This crate provides:
//! - Dense tensor helpers used across the diffusion loop
//! - Prompt/scheduler/batch option value types
//! - The model-set configuration surface
//! - Error kinds, progress reporting, and cancellation

pub mod config;
pub mod error;
pub mod image;
pub mod options;
pub mod progress;
pub mod tensor;

pub use config::{PipelineType, StableDiffusionModelSet, SubModelConfig};
pub use error::{DiffusionError, Result};
pub use image::{ImageNormalizeMode, InputImage, VideoFrames};
pub use options::{
    BatchOptionType, BatchOptions, BetaSchedule, DiffuserType, MemoryMode, PredictionType,
    PromptOptions, SchedulerOptions, SchedulerType, TimestepSpacing,
};
pub use progress::{CancellationToken, DiffusionProgress, ProgressCallback};
