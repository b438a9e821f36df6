//! diffusionkit_runtime_onnx - ONNX Runtime execution backend
//!
//! This crate drives ONNX-compiled diffusion models end to end: prompt
//! encoding, iterative latent denoising under a discrete scheduler, and VAE
//! decoding to pixels. Pipelines for Stable Diffusion, InstaFlow,
//! LatentConsistency and Stable Cascade all implement the
//! `diffusionkit_runtime_api::Pipeline` contract.

pub mod batch;
pub(crate) mod diffusers;
pub mod pipelines;
pub mod prompt;
pub mod schedulers;
pub mod session;

pub use batch::generate_batch;
pub use pipelines::{
    create_pipeline, InstaFlowPipeline, LatentConsistencyPipeline, StableCascadePipeline,
    StableDiffusionPipeline,
};
pub use prompt::{PromptEmbeddings, PromptEncoder};
pub use schedulers::{create_scheduler, Scheduler, StepResult};
pub use session::{
    init_runtime, InputValue, ModelMetadata, OnnxInferenceParameters, OnnxModelSession,
    OutputValue, RuntimeOptions, TensorSignature,
};
