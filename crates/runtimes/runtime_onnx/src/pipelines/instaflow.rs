//! InstaFlow: the single-step distilled family. Rides the standard shell with
//! the distilled velocity term enabled and guidance-free, one-step defaults.

use async_trait::async_trait;

use diffusionkit_core::{
    BatchOptions, CancellationToken, ProgressCallback, PromptOptions, Result, SchedulerOptions,
    StableDiffusionModelSet,
};
use diffusionkit_runtime_api::{BatchStream, Pipeline, PipelineCaps, PipelineStatus, PixelTensor};

use super::StableDiffusionPipeline;

pub struct InstaFlowPipeline {
    inner: StableDiffusionPipeline,
}

impl InstaFlowPipeline {
    pub fn new(model: StableDiffusionModelSet) -> Self {
        let mut inner = StableDiffusionPipeline::new(model);
        inner.distilled_velocity = true;
        Self { inner }
    }

    /// The defaults this family was distilled for.
    pub fn default_scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions { inference_steps: 1, guidance_scale: 0.0, ..Default::default() }
    }
}

#[async_trait]
impl Pipeline for InstaFlowPipeline {
    fn caps(&self) -> PipelineCaps {
        self.inner.caps()
    }

    fn status(&self) -> PipelineStatus {
        self.inner.status()
    }

    async fn load(&mut self) -> Result<()> {
        self.inner.load().await
    }

    async fn unload(&mut self) -> Result<()> {
        self.inner.unload().await
    }

    async fn run(
        &self,
        prompt: PromptOptions,
        options: SchedulerOptions,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<PixelTensor> {
        self.inner.run(prompt, options, progress, cancel).await
    }

    async fn run_batch<'a>(
        &'a self,
        prompt: PromptOptions,
        options: SchedulerOptions,
        batch: BatchOptions,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<BatchStream<'a>> {
        self.inner.run_batch(prompt, options, batch, progress, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_set() -> StableDiffusionModelSet {
        serde_json::from_str(
            r#"{
                "name": "instaflow",
                "pipeline_type": "InstaFlow",
                "tokenizer": {"path": "models/tokenizer.onnx"},
                "text_encoder": {"path": "models/text_encoder.onnx"},
                "unet": {"path": "models/unet.onnx"},
                "vae_decoder": {"path": "models/vae_decoder.onnx"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn distilled_velocity_is_enabled() {
        let pipeline = InstaFlowPipeline::new(model_set());
        assert!(pipeline.inner.distilled_velocity);
    }

    #[test]
    fn defaults_are_single_step_guidance_free() {
        let defaults = InstaFlowPipeline::new(model_set()).default_scheduler_options();
        assert_eq!(defaults.inference_steps, 1);
        assert_eq!(defaults.guidance_scale, 0.0);
        assert!(!defaults.is_guidance_enabled());
    }
}
