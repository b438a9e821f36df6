//! Stable Cascade: a two-phase pipeline. The prior UNet denoises a compact
//! 16-channel latent under DDPM; the decoder UNet then expands it guidance-free
//! in ten fixed steps before the VQGAN decodes to pixels.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use ndarray::{Array4, ArrayD};
use tokio::sync::Mutex;

use diffusionkit_core::{
    tensor, BatchOptions, CancellationToken, DiffuserType, DiffusionError, DiffusionProgress,
    MemoryMode, ProgressCallback, PromptOptions, Result, SchedulerOptions, SchedulerType,
    StableDiffusionModelSet,
};
use diffusionkit_runtime_api::{
    BatchResult, BatchStream, Pipeline, PipelineCaps, PipelineStatus, PixelTensor,
};

use super::{resolve_seed, SubModels};
use crate::batch::generate_batch;
use crate::diffusers::{apply_guidance, decode_latents, double_batch};
use crate::prompt::{PromptEmbeddings, PromptEncoder};
use crate::schedulers::create_scheduler;
use crate::session::{InputValue, OnnxInferenceParameters, OnnxModelSession};

/// Spatial divisor of the prior latent; hand-chosen by the model authors.
const RESOLUTION_MULTIPLE: f32 = 42.67;
const PRIOR_LATENT_CHANNELS: usize = 16;
const DECODER_LATENT_CHANNELS: usize = 4;
const DECODER_SPATIAL_FACTOR: usize = 4;
const DECODER_INFERENCE_STEPS: usize = 10;
/// Width of the (zeroed) image-embedding input the prior expects.
const IMAGE_EMBED_DIM: usize = 768;

pub struct StableCascadePipeline {
    model: StableDiffusionModelSet,
    models: Arc<Mutex<SubModels>>,
    status: PipelineStatus,
    encoder: PromptEncoder,
}

impl StableCascadePipeline {
    pub fn new(model: StableDiffusionModelSet) -> Self {
        let models = SubModels::from_model_set(&model);
        let encoder = PromptEncoder::new(model.tokenizer_limit, model.pad_token_id);
        Self {
            model,
            models: Arc::new(Mutex::new(models)),
            status: PipelineStatus::Unloaded,
            encoder,
        }
    }

    /// Prior latent height/width for a pixel resolution.
    pub(crate) fn prior_latent_size(height: usize, width: usize) -> (usize, usize) {
        (
            (height as f32 / RESOLUTION_MULTIPLE).ceil() as usize,
            (width as f32 / RESOLUTION_MULTIPLE).ceil() as usize,
        )
    }

    fn validate(&self, prompt: &PromptOptions, options: &SchedulerOptions) -> Result<()> {
        prompt.validate()?;
        options.validate()?;
        if prompt.diffuser_type != DiffuserType::TextToImage {
            return Err(DiffusionError::UnsupportedDiffuser(prompt.diffuser_type));
        }
        if !self.model.supports_scheduler(options.scheduler_type) {
            return Err(DiffusionError::UnsupportedScheduler(options.scheduler_type));
        }
        Ok(())
    }

    /// Both phases, against an exclusive borrow of the sub-model set.
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

        models.tokenizer.load()?;
        models.text_encoder.load()?;
        let embeddings = self
            .encoder
            .encode(
                &models.tokenizer,
                &models.text_encoder,
                &prompt.prompt,
                &prompt.negative_prompt,
                options.is_guidance_enabled(),
            )
            .await?;
        if embeddings.pooled_prompt_embeds.is_none() {
            return Err(DiffusionError::InvalidOptions(
                "the text encoder does not produce the pooled output the prior needs".to_string(),
            ));
        }
        if minimum {
            models.tokenizer.unload();
            models.text_encoder.unload();
        }

        models.unet.load()?;
        let prior_latents = self
            .prior_phase(models, options, &embeddings, progress, cancel, batch_index)
            .await?;
        if minimum {
            models.unet.unload();
        }

        cancel.check()?;
        match models.unet2.as_mut() {
            Some(unet2) => unet2.load()?,
            None => {
                return Err(DiffusionError::InvalidOptions(
                    "model set has no decoder UNet".to_string(),
                ))
            }
        }
        let decoder_latents = self
            .decoder_phase(models, options, &embeddings, prior_latents, progress, cancel, batch_index)
            .await?;
        if minimum {
            if let Some(unet2) = models.unet2.as_mut() {
                unet2.unload();
            }
        }

        cancel.check()?;
        models.vae_decoder.load()?;
        let pixels =
            decode_latents(&models.vae_decoder, self.model.scale_factor, decoder_latents).await?;
        if minimum {
            models.vae_decoder.unload();
        }

        let dim = pixels.dim();
        if dim.0 != 1 || dim.1 != 3 {
            return Err(DiffusionError::shape("[1, 3, H, W]", format!("{dim:?}")));
        }
        Ok(pixels)
    }

    async fn prior_phase(
        &self,
        models: &SubModels,
        options: &SchedulerOptions,
        embeddings: &PromptEmbeddings,
        progress: Option<&ProgressCallback>,
        cancel: &CancellationToken,
        batch_index: Option<usize>,
    ) -> Result<Array4<f32>> {
        let prior_options =
            SchedulerOptions { scheduler_type: SchedulerType::Ddpm, ..options.clone() };
        let guidance = prior_options.is_guidance_enabled();
        let (latent_height, latent_width) =
            Self::prior_latent_size(prior_options.height, prior_options.width);

        let mut scheduler = create_scheduler(&prior_options);
        let sigma = scheduler.init_noise_sigma();
        let mut latents = scheduler
            .create_random_sample([1, PRIOR_LATENT_CHANNELS, latent_height, latent_width], sigma);

        let pooled = pooled_conditioning(embeddings, guidance)?;
        let batch = if guidance { 2 } else { 1 };
        let image_embeds = ArrayD::zeros(vec![batch, 1, IMAGE_EMBED_DIM]);

        let timesteps = scheduler.timesteps().to_vec();
        let total = timesteps.len();
        tracing::debug!(steps = total, latent_height, latent_width, "cascade prior phase");

        for (step_index, &timestep) in timesteps.iter().enumerate() {
            cancel.check()?;
            let input = if guidance { double_batch(&latents) } else { latents.clone() };
            let scaled = scheduler.scale_input(input, timestep);

            let noise_pred = evaluate_unet(
                &models.unet,
                scaled,
                timestep,
                vec![
                    InputValue::Float(embeddings.prompt_embeds.clone()),
                    InputValue::Float(pooled.clone()),
                    InputValue::Float(image_embeds.clone()),
                ],
            )
            .await?;
            let noise_pred = if guidance {
                apply_guidance(&noise_pred, prior_options.guidance_scale)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, latents)?.prev_sample;
            diffusionkit_core::progress::report_progress(
                progress,
                DiffusionProgress {
                    step: step_index + 1,
                    total,
                    latent: Some(latents.clone()),
                    batch_index,
                },
            );
        }

        Ok(latents)
    }

    #[allow(clippy::too_many_arguments)]
    async fn decoder_phase(
        &self,
        models: &SubModels,
        options: &SchedulerOptions,
        embeddings: &PromptEmbeddings,
        prior_latents: Array4<f32>,
        progress: Option<&ProgressCallback>,
        cancel: &CancellationToken,
        batch_index: Option<usize>,
    ) -> Result<Array4<f32>> {
        let unet2 = models
            .unet2
            .as_ref()
            .ok_or_else(|| DiffusionError::InvalidOptions("model set has no decoder UNet".to_string()))?;

        // The decoder always runs guidance-free over a short fixed schedule.
        let decoder_options = SchedulerOptions {
            scheduler_type: SchedulerType::Ddpm,
            inference_steps: DECODER_INFERENCE_STEPS,
            guidance_scale: 0.0,
            ..options.clone()
        };
        let mut scheduler = create_scheduler(&decoder_options);
        let sigma = scheduler.init_noise_sigma();
        let mut latents = scheduler.create_random_sample(
            [
                1,
                DECODER_LATENT_CHANNELS,
                decoder_options.height / DECODER_SPATIAL_FACTOR,
                decoder_options.width / DECODER_SPATIAL_FACTOR,
            ],
            sigma,
        );

        let pooled = embeddings
            .pooled_prompt_embeds
            .clone()
            .ok_or_else(|| DiffusionError::InvalidOptions("missing pooled prompt embedding".to_string()))?;
        let effnet = prior_latents.into_dyn();

        let timesteps = scheduler.timesteps().to_vec();
        let total = timesteps.len();
        tracing::debug!(steps = total, "cascade decoder phase");

        for (step_index, &timestep) in timesteps.iter().enumerate() {
            cancel.check()?;
            let scaled = scheduler.scale_input(latents.clone(), timestep);
            let noise_pred = evaluate_unet(
                unet2,
                scaled,
                timestep,
                vec![InputValue::Float(pooled.clone()), InputValue::Float(effnet.clone())],
            )
            .await?;
            latents = scheduler.step(&noise_pred, timestep, latents)?.prev_sample;
            diffusionkit_core::progress::report_progress(
                progress,
                DiffusionProgress {
                    step: step_index + 1,
                    total,
                    latent: Some(latents.clone()),
                    batch_index,
                },
            );
        }

        Ok(latents)
    }

    async fn run_inner(
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

/// Guidance-batched pooled conditioning: `concat(negative, positive)`.
fn pooled_conditioning(embeddings: &PromptEmbeddings, guidance: bool) -> Result<ArrayD<f32>> {
    let pooled = embeddings
        .pooled_prompt_embeds
        .as_ref()
        .ok_or_else(|| DiffusionError::InvalidOptions("missing pooled prompt embedding".to_string()))?;
    if !guidance {
        return Ok(pooled.clone());
    }
    match embeddings.negative_pooled.as_ref() {
        Some(negative) => tensor::concat_batch(negative, pooled),
        None => tensor::concat_batch(&ArrayD::zeros(pooled.shape().to_vec()), pooled),
    }
}

/// One UNet evaluation with phase-specific conditioning inputs.
async fn evaluate_unet(
    unet: &OnnxModelSession,
    sample: Array4<f32>,
    timestep: i64,
    conditioning: Vec<InputValue>,
) -> Result<Array4<f32>> {
    let timestep_tensor = ArrayD::from_shape_vec(vec![1], vec![timestep])
        .map_err(|e| DiffusionError::inference("unet", e))?;
    let mut params = OnnxInferenceParameters::new()
        .add_input_tensor(sample.into_dyn())
        .add_input(InputValue::Int64(timestep_tensor));
    for value in conditioning {
        params = params.add_input(value);
    }
    let mut outputs = unet.run_async(params).await?;
    if outputs.is_empty() {
        return Err(DiffusionError::inference("unet", "no output tensor"));
    }
    outputs
        .remove(0)
        .into_float()?
        .into_dimensionality::<ndarray::Ix4>()
        .map_err(|e| DiffusionError::shape("[B, C, H, W]", e.to_string()))
}

#[async_trait]
impl Pipeline for StableCascadePipeline {
    fn caps(&self) -> PipelineCaps {
        PipelineCaps {
            diffusers: vec![DiffuserType::TextToImage],
            schedulers: self.model.schedulers.clone(),
            two_stage: true,
        }
    }

    fn status(&self) -> PipelineStatus {
        self.status
    }

    async fn load(&mut self) -> Result<()> {
        self.status = PipelineStatus::Loading;
        tracing::info!(model = %self.model.name, "loading cascade pipeline");
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
        Ok(())
    }

    async fn run(
        &self,
        prompt: PromptOptions,
        options: SchedulerOptions,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<PixelTensor> {
        let options = resolve_seed(&options);
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
        let base = resolve_seed(&options);
        self.validate(&prompt, &base)?;
        let entries = generate_batch(&base, &batch);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn model_set() -> StableDiffusionModelSet {
        serde_json::from_str(
            r#"{
                "name": "stable-cascade",
                "pipeline_type": "StableCascade",
                "scale_factor": 0.3764,
                "tokenizer": {"path": "models/tokenizer.onnx"},
                "text_encoder": {"path": "models/text_encoder.onnx"},
                "unet": {"path": "models/prior_unet.onnx"},
                "unet2": {"path": "models/decoder_unet.onnx"},
                "vae_decoder": {"path": "models/vqgan.onnx"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn prior_latent_size_uses_the_hand_chosen_divisor() {
        // 1024 / 42.67 = 23.998.. -> 24
        assert_eq!(StableCascadePipeline::prior_latent_size(1024, 1024), (24, 24));
        // 512 / 42.67 = 11.999.. -> 12
        assert_eq!(StableCascadePipeline::prior_latent_size(512, 512), (12, 12));
        // 1536 / 42.67 = 35.99.. -> 36 ; 768 / 42.67 = 17.998.. -> 18
        assert_eq!(StableCascadePipeline::prior_latent_size(1536, 768), (36, 18));
    }

    #[test]
    fn caps_are_two_stage_text_to_image() {
        let pipeline = StableCascadePipeline::new(model_set());
        let caps = pipeline.caps();
        assert!(caps.two_stage);
        assert_eq!(caps.diffusers, vec![DiffuserType::TextToImage]);
    }

    #[test]
    fn image_diffusers_are_rejected() {
        let pipeline = StableCascadePipeline::new(model_set());
        let prompt = PromptOptions {
            diffuser_type: DiffuserType::ImageToImage,
            input_image: Some(diffusionkit_core::InputImage::Tensor(
                ndarray::Array4::zeros((1, 3, 512, 512)),
            )),
            ..Default::default()
        };
        let err = pipeline.validate(&prompt, &SchedulerOptions::default()).unwrap_err();
        assert!(matches!(err, DiffusionError::UnsupportedDiffuser(_)));
    }

    #[test]
    fn pooled_conditioning_doubles_for_guidance() {
        let embeddings = PromptEmbeddings {
            prompt_embeds: ArrayD::zeros(vec![2, 77, 1280]),
            pooled_prompt_embeds: Some(ArrayD::from_elem(vec![1, 1280], 1.0)),
            negative_pooled: Some(ArrayD::from_elem(vec![1, 1280], -1.0)),
        };
        let pooled = pooled_conditioning(&embeddings, true).unwrap();
        assert_eq!(pooled.shape(), &[2, 1280]);
        assert_eq!(pooled[[0, 0]], -1.0);
        assert_eq!(pooled[[1, 0]], 1.0);
    }

    #[test]
    fn pooled_conditioning_zero_fills_missing_negative() {
        let embeddings = PromptEmbeddings {
            prompt_embeds: ArrayD::zeros(vec![2, 77, 1280]),
            pooled_prompt_embeds: Some(ArrayD::from_elem(vec![1, 1280], 1.0)),
            negative_pooled: None,
        };
        let pooled = pooled_conditioning(&embeddings, true).unwrap();
        assert_eq!(pooled[[0, 0]], 0.0);
        assert_eq!(pooled[[1, 0]], 1.0);
    }
}
