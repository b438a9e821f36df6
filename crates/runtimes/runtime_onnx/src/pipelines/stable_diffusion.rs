//! The standard Stable Diffusion pipeline shell.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use tokio::sync::Mutex;

use diffusionkit_core::{
    BatchOptions, CancellationToken, DiffuserType, DiffusionError, MemoryMode, PipelineType,
    ProgressCallback, PromptOptions, Result, SchedulerOptions, StableDiffusionModelSet,
};
use diffusionkit_runtime_api::{
    BatchResult, BatchStream, Pipeline, PipelineCaps, PipelineStatus, PixelTensor,
};

use super::{resolve_seed, SubModels};
use crate::batch::generate_batch;
use crate::diffusers::{create_diffuser, decode_latents, DiffusionContext, VideoDiffuser};
use crate::prompt::{PromptEmbeddings, PromptEncoder};
use crate::schedulers::create_scheduler;

pub struct StableDiffusionPipeline {
    pub(crate) model: StableDiffusionModelSet,
    pub(crate) models: Arc<Mutex<SubModels>>,
    pub(crate) status: PipelineStatus,
    pub(crate) encoder: PromptEncoder,
    /// InstaFlow's distilled velocity term.
    pub(crate) distilled_velocity: bool,
    /// LatentConsistency runs guidance-free regardless of the request.
    pub(crate) force_guidance_off: bool,
}

impl StableDiffusionPipeline {
    pub fn new(model: StableDiffusionModelSet) -> Self {
        let models = SubModels::from_model_set(&model);
        let encoder = PromptEncoder::new(model.tokenizer_limit, model.pad_token_id);
        Self {
            model,
            models: Arc::new(Mutex::new(models)),
            status: PipelineStatus::Unloaded,
            encoder,
            distilled_velocity: false,
            force_guidance_off: false,
        }
    }

    pub(crate) fn validate(&self, prompt: &PromptOptions, options: &SchedulerOptions) -> Result<()> {
        prompt.validate()?;
        options.validate()?;
        if !self.model.supports_diffuser(prompt.diffuser_type) {
            return Err(DiffusionError::UnsupportedDiffuser(prompt.diffuser_type));
        }
        if !self.model.supports_scheduler(options.scheduler_type) {
            return Err(DiffusionError::UnsupportedScheduler(options.scheduler_type));
        }
        Ok(())
    }

    /// Seed resolution plus the pipeline's option overrides.
    pub(crate) fn resolve_options(&self, options: &SchedulerOptions) -> SchedulerOptions {
        let mut resolved = resolve_seed(options);
        if self.force_guidance_off && resolved.guidance_scale > 1.0 {
            tracing::debug!("pipeline runs guidance-free; ignoring guidance_scale");
            resolved.guidance_scale = 0.0;
        }
        resolved
    }

    /// One full generation against an exclusive borrow of the sub-model set.
    /// The caller holds the pipeline lock for the duration.
    async fn generate(
        &self,
        models: &mut SubModels,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        progress: Option<&ProgressCallback>,
        cancel: &CancellationToken,
        batch_index: Option<usize>,
    ) -> Result<PixelTensor> {
        cancel.check()?;
        let minimum = self.model.memory_mode == MemoryMode::Minimum;
        let guidance = options.is_guidance_enabled();
        let diffuser_type = prompt.diffuser_type;

        let embeddings = self.encode_prompt(models, prompt, guidance).await?;
        if minimum {
            models.tokenizer.unload();
            models.text_encoder.unload();
            if let Some(t) = models.tokenizer2.as_mut() {
                t.unload();
            }
            if let Some(t) = models.text_encoder2.as_mut() {
                t.unload();
            }
        }

        models.unet.load()?;
        if diffuser_type.requires_control_image() {
            match models.controlnet.as_mut() {
                Some(controlnet) => controlnet.load()?,
                None => {
                    return Err(DiffusionError::InvalidOptions(
                        "model set has no ControlNet".to_string(),
                    ))
                }
            }
        }
        let needs_vae_encoder =
            diffuser_type.requires_input_image() || diffuser_type == DiffuserType::VideoToVideo;
        if needs_vae_encoder {
            match models.vae_encoder.as_mut() {
                Some(encoder) => encoder.load()?,
                None => {
                    return Err(DiffusionError::InvalidOptions(
                        "model set has no VAE encoder".to_string(),
                    ))
                }
            }
        }

        if diffuser_type == DiffuserType::VideoToVideo {
            models.vae_decoder.load()?;
            let frames = VideoDiffuser
                .diffuse_frames(&self.model, models, prompt, options, &embeddings, progress, cancel)
                .await?;
            if minimum {
                models.unload_all();
            }
            return Ok(frames);
        }

        let latents = {
            let ctx = DiffusionContext {
                model: &self.model,
                models,
                prompt,
                options,
                embeddings: &embeddings,
                progress,
                batch_index,
                cancel,
                distilled_velocity: self.distilled_velocity,
            };
            let mut diffuser = create_diffuser(prompt)?;
            let mut scheduler = create_scheduler(options);
            diffuser.diffuse(&ctx, scheduler.as_mut()).await?
        };
        if minimum {
            models.unet.unload();
            if let Some(controlnet) = models.controlnet.as_mut() {
                controlnet.unload();
            }
            if let Some(encoder) = models.vae_encoder.as_mut() {
                encoder.unload();
            }
        }

        cancel.check()?;
        models.vae_decoder.load()?;
        let pixels = decode_latents(&models.vae_decoder, self.model.scale_factor, latents).await?;
        if minimum {
            models.vae_decoder.unload();
        }

        let dim = pixels.dim();
        if dim != (1, 3, options.height, options.width) {
            return Err(DiffusionError::shape(
                format!("[1, 3, {}, {}]", options.height, options.width),
                format!("{dim:?}"),
            ));
        }
        Ok(pixels)
    }

    async fn encode_prompt(
        &self,
        models: &mut SubModels,
        prompt: &PromptOptions,
        guidance: bool,
    ) -> Result<PromptEmbeddings> {
        models.tokenizer.load()?;
        models.text_encoder.load()?;
        if let Some(encoder2) = models.text_encoder2.as_mut() {
            encoder2.load()?;
        }
        match models.text_encoder2.as_ref() {
            Some(encoder2) => {
                self.encoder
                    .encode_dual(
                        &models.tokenizer,
                        &models.text_encoder,
                        encoder2,
                        &prompt.prompt,
                        &prompt.negative_prompt,
                        guidance,
                    )
                    .await
            }
            None => {
                self.encoder
                    .encode(
                        &models.tokenizer,
                        &models.text_encoder,
                        &prompt.prompt,
                        &prompt.negative_prompt,
                        guidance,
                    )
                    .await
            }
        }
    }

    /// Serializes generations over the shared sub-model set and applies
    /// memory-mode cleanup on failure.
    pub(crate) async fn run_inner(
        &self,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        progress: Option<&ProgressCallback>,
        cancel: &CancellationToken,
        batch_index: Option<usize>,
    ) -> Result<PixelTensor> {
        self.validate(prompt, options)?;
        let mut guard = self.models.lock().await;
        let result = self
            .generate(&mut guard, prompt, options, progress, cancel, batch_index)
            .await;
        if result.is_err() && self.model.memory_mode == MemoryMode::Minimum {
            guard.unload_all();
        }
        result
    }
}

#[async_trait]
impl Pipeline for StableDiffusionPipeline {
    fn caps(&self) -> PipelineCaps {
        PipelineCaps {
            diffusers: self.model.diffusers.clone(),
            schedulers: self.model.schedulers.clone(),
            two_stage: self.model.pipeline_type == PipelineType::StableCascade,
        }
    }

    fn status(&self) -> PipelineStatus {
        self.status
    }

    async fn load(&mut self) -> Result<()> {
        self.status = PipelineStatus::Loading;
        tracing::info!(model = %self.model.name, "loading pipeline");
        let models = self.models.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let mut guard = models.blocking_lock();
            guard.load_all()
        })
        .await
        .map_err(|e| DiffusionError::model_load("pipeline", e))?;
        match loaded {
            Ok(()) => {
                self.status = PipelineStatus::Ready;
                tracing::info!(model = %self.model.name, "pipeline loaded");
                Ok(())
            }
            Err(e) => {
                self.status = PipelineStatus::Error;
                Err(e)
            }
        }
    }

    async fn unload(&mut self) -> Result<()> {
        self.models.lock().await.unload_all();
        self.status = PipelineStatus::Unloaded;
        tracing::info!(model = %self.model.name, "pipeline unloaded");
        Ok(())
    }

    async fn run(
        &self,
        prompt: PromptOptions,
        options: SchedulerOptions,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<PixelTensor> {
        let options = self.resolve_options(&options);
        self.run_inner(&prompt, &options, progress.as_ref(), &cancel, None).await
    }

    async fn run_batch<'a>(
        &'a self,
        prompt: PromptOptions,
        options: SchedulerOptions,
        batch: BatchOptions,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<BatchStream<'a>> {
        let base = self.resolve_options(&options);
        self.validate(&prompt, &base)?;
        let entries = generate_batch(&base, &batch);
        tracing::info!(entries = entries.len(), batch_type = ?batch.batch_type, "starting batch run");

        let stream = try_stream! {
            for (index, entry) in entries.into_iter().enumerate() {
                let entry = resolve_seed(&entry);
                let pixels = self
                    .run_inner(&prompt, &entry, progress.as_ref(), &cancel, Some(index))
                    .await?;
                yield BatchResult { options: entry, pixels };
            }
        };
        Ok(Box::pin(stream))
    }
}
