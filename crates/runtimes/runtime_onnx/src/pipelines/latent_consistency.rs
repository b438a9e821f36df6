//! Latent Consistency: few-step generation without classifier-free guidance.
//! Restricted to the Euler-family solvers.

use async_trait::async_trait;

use diffusionkit_core::{
    BatchOptions, CancellationToken, ProgressCallback, PromptOptions, Result, SchedulerOptions,
    SchedulerType, StableDiffusionModelSet,
};
use diffusionkit_runtime_api::{BatchStream, Pipeline, PipelineCaps, PipelineStatus, PixelTensor};

use super::StableDiffusionPipeline;

pub struct LatentConsistencyPipeline {
    inner: StableDiffusionPipeline,
}

impl LatentConsistencyPipeline {
    pub fn new(mut model: StableDiffusionModelSet) -> Self {
        model.schedulers.retain(|s| {
            matches!(s, SchedulerType::Euler | SchedulerType::EulerAncestral)
        });
        if model.schedulers.is_empty() {
            model.schedulers = vec![SchedulerType::Euler, SchedulerType::EulerAncestral];
        }
        let mut inner = StableDiffusionPipeline::new(model);
        inner.force_guidance_off = true;
        Self { inner }
    }

    pub fn default_scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            inference_steps: 4,
            guidance_scale: 0.0,
            scheduler_type: SchedulerType::Euler,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Pipeline for LatentConsistencyPipeline {
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
    use diffusionkit_core::DiffusionError;

    fn model_set() -> StableDiffusionModelSet {
        serde_json::from_str(
            r#"{
                "name": "lcm-dreamshaper",
                "pipeline_type": "LatentConsistency",
                "tokenizer": {"path": "models/tokenizer.onnx"},
                "text_encoder": {"path": "models/text_encoder.onnx"},
                "unet": {"path": "models/unet.onnx"},
                "vae_decoder": {"path": "models/vae_decoder.onnx"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn scheduler_set_is_restricted() {
        let pipeline = LatentConsistencyPipeline::new(model_set());
        let caps = pipeline.caps();
        assert!(caps.supports_scheduler(SchedulerType::Euler));
        assert!(!caps.supports_scheduler(SchedulerType::Lms));
        assert!(!caps.supports_scheduler(SchedulerType::Ddpm));
    }

    #[test]
    fn guidance_is_forced_off() {
        let pipeline = LatentConsistencyPipeline::new(model_set());
        let resolved = pipeline
            .inner
            .resolve_options(&SchedulerOptions { guidance_scale: 7.5, seed: 1, ..Default::default() });
        assert_eq!(resolved.guidance_scale, 0.0);
    }

    #[test]
    fn unsupported_scheduler_is_rejected() {
        let pipeline = LatentConsistencyPipeline::new(model_set());
        let options = SchedulerOptions {
            scheduler_type: SchedulerType::Lms,
            ..Default::default()
        };
        let err = pipeline
            .inner
            .validate(&PromptOptions::text("a cat"), &options)
            .unwrap_err();
        assert!(matches!(err, DiffusionError::UnsupportedScheduler(SchedulerType::Lms)));
    }
}
