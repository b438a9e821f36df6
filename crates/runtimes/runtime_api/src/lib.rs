//! diffusionkit_runtime_api - Pipeline traits and types
//!
//! This crate defines the contract every diffusion pipeline implements.
//! Each backend (the ONNX runtime crate today) provides concrete pipelines
//! behind these traits.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use diffusionkit_core::{
    BatchOptions, CancellationToken, DiffuserType, ProgressCallback, PromptOptions, Result,
    SchedulerOptions, SchedulerType,
};

/// Tasks a pipeline can drive.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineCaps {
    pub diffusers: Vec<DiffuserType>,
    pub schedulers: Vec<SchedulerType>,
    /// Prior + decoder pipelines run two denoising phases per image.
    pub two_stage: bool,
}

impl PipelineCaps {
    pub fn supports_diffuser(&self, diffuser: DiffuserType) -> bool {
        let effective = match diffuser {
            DiffuserType::VideoToVideo => DiffuserType::ImageToImage,
            other => other,
        };
        self.diffusers.contains(&diffuser) || self.diffusers.contains(&effective)
    }

    pub fn supports_scheduler(&self, scheduler: SchedulerType) -> bool {
        self.schedulers.contains(&scheduler)
    }
}

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    Unloaded,
    Loading,
    Ready,
    Error,
}

/// Decoded output: a `[1, 3, height, width]` pixel tensor with values in [0, 1].
pub type PixelTensor = Array4<f32>;

/// One entry of a batch run: the concrete options used (seed resolved) and the
/// decoded image.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub options: SchedulerOptions,
    pub pixels: PixelTensor,
}

/// A lazily-evaluated batch: entries are generated in order, and the stream
/// ends at the first error.
pub type BatchStream<'a> = BoxStream<'a, Result<BatchResult>>;

/// The capability set every pipeline provides: load, unload, run, run_batch.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// What this pipeline can do, as declared by its model set.
    fn caps(&self) -> PipelineCaps;

    fn status(&self) -> PipelineStatus;

    /// Loads all sub-models as an atomic set.
    async fn load(&mut self) -> Result<()>;

    /// Unloads all sub-models.
    async fn unload(&mut self) -> Result<()>;

    /// Runs one generation to a decoded pixel tensor.
    async fn run(
        &self,
        prompt: PromptOptions,
        options: SchedulerOptions,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<PixelTensor>;

    /// Expands `batch` over `options` and yields one result per entry, in
    /// generator order. Fails the remainder of the batch on first error.
    async fn run_batch<'a>(
        &'a self,
        prompt: PromptOptions,
        options: SchedulerOptions,
        batch: BatchOptions,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<BatchStream<'a>>;
}
