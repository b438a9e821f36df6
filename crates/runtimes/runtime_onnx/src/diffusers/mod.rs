//! Diffuser variants: the per-task control loops driving latent denoising.
//!
//! Every variant shares the same outer structure (prepare latents, iterate
//! the scheduler's timesteps through the UNet, hand the final latent back for
//! decoding) and differs only in latent preparation, extra UNet inputs, and
//! per-step post-processing. The shared loop lives in [`Diffuser::diffuse`].

mod controlnet;
mod image_to_image;
mod inpaint;
mod inpaint_legacy;
mod text_to_image;
mod video;

pub(crate) use controlnet::{ControlNetDiffuser, ControlNetImageDiffuser};
pub(crate) use image_to_image::ImageToImageDiffuser;
pub(crate) use inpaint::InpaintDiffuser;
pub(crate) use inpaint_legacy::InpaintLegacyDiffuser;
pub(crate) use text_to_image::TextToImageDiffuser;
pub(crate) use video::VideoDiffuser;

use async_trait::async_trait;
use ndarray::{concatenate, Array4, ArrayD, Axis, Ix4};

use diffusionkit_core::tensor;
use diffusionkit_core::{
    CancellationToken, DiffuserType, DiffusionError, DiffusionProgress, ImageNormalizeMode,
    InputImage, ProgressCallback, PromptOptions, Result, SchedulerOptions, StableDiffusionModelSet,
};

use crate::pipelines::SubModels;
use crate::prompt::PromptEmbeddings;
use crate::schedulers::Scheduler;
use crate::session::{InputValue, OnnxInferenceParameters, OnnxModelSession};

/// Latent channel count of the Stable Diffusion VAE.
pub(crate) const LATENT_CHANNELS: usize = 4;
/// Spatial ratio between pixel space and latent space.
pub(crate) const LATENT_FACTOR: usize = 8;

/// Everything one generation needs, borrowed for its duration.
pub(crate) struct DiffusionContext<'a> {
    pub model: &'a StableDiffusionModelSet,
    pub models: &'a SubModels,
    pub prompt: &'a PromptOptions,
    /// Seed already resolved; never 0 here.
    pub options: &'a SchedulerOptions,
    pub embeddings: &'a PromptEmbeddings,
    pub progress: Option<&'a ProgressCallback>,
    pub batch_index: Option<usize>,
    pub cancel: &'a CancellationToken,
    /// InstaFlow's distilled velocity term, applied after the scheduler step.
    pub distilled_velocity: bool,
}

impl DiffusionContext<'_> {
    pub fn latent_shape(&self) -> [usize; 4] {
        [
            1,
            LATENT_CHANNELS,
            self.options.height / LATENT_FACTOR,
            self.options.width / LATENT_FACTOR,
        ]
    }
}

/// One per-task denoising loop. Implementations hold whatever per-run state
/// their `prepare_latents` produces.
#[async_trait]
pub(crate) trait Diffuser: Send + Sync {
    fn kind(&self) -> DiffuserType;

    /// The timesteps this run iterates; image-to-image variants truncate to a
    /// strength-scaled suffix.
    fn select_timesteps(&self, scheduler: &dyn Scheduler, _options: &SchedulerOptions) -> Vec<i64> {
        scheduler.timesteps().to_vec()
    }

    async fn prepare_latents(
        &mut self,
        ctx: &DiffusionContext<'_>,
        scheduler: &mut dyn Scheduler,
        timesteps: &[i64],
    ) -> Result<Array4<f32>>;

    /// Extra UNet inputs appended after sample/timestep/embeddings
    /// (ControlNet hooks in here).
    async fn build_extras(
        &self,
        _ctx: &DiffusionContext<'_>,
        _scaled_latent: &Array4<f32>,
        _timestep: i64,
    ) -> Result<Vec<InputValue>> {
        Ok(Vec::new())
    }

    /// Rewrites the scaled latent before it reaches the UNet (full inpaint
    /// concatenates mask channels here).
    fn augment_latent_input(
        &self,
        _ctx: &DiffusionContext<'_>,
        scaled: Array4<f32>,
    ) -> Result<Array4<f32>> {
        Ok(scaled)
    }

    /// Adjusts the latent after a scheduler step (legacy inpaint blending).
    fn post_step(
        &self,
        _ctx: &DiffusionContext<'_>,
        _scheduler: &mut dyn Scheduler,
        _timestep: i64,
        latents: Array4<f32>,
    ) -> Result<Array4<f32>> {
        Ok(latents)
    }

    /// Runs the denoising loop to the final latent. Decode happens at the
    /// pipeline level so memory-residency can unload the UNet first.
    async fn diffuse(
        &mut self,
        ctx: &DiffusionContext<'_>,
        scheduler: &mut dyn Scheduler,
    ) -> Result<Array4<f32>> {
        let timesteps = self.select_timesteps(scheduler, ctx.options);
        let total = timesteps.len();
        let guidance = ctx.options.is_guidance_enabled();
        let mut latents = self.prepare_latents(ctx, scheduler, &timesteps).await?;

        tracing::debug!(
            diffuser = ?self.kind(),
            steps = total,
            guidance,
            seed = ctx.options.seed,
            "starting denoising loop"
        );

        for (step_index, &timestep) in timesteps.iter().enumerate() {
            ctx.cancel.check()?;

            let input = if guidance { double_batch(&latents) } else { latents.clone() };
            let scaled = scheduler.scale_input(input, timestep);
            let extras = self.build_extras(ctx, &scaled, timestep).await?;
            let unet_input = self.augment_latent_input(ctx, scaled)?;

            let noise_pred = predict_noise(ctx, unet_input, timestep, extras).await?;
            let noise_pred = if guidance {
                apply_guidance(&noise_pred, ctx.options.guidance_scale)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, latents)?.prev_sample;
            if ctx.distilled_velocity {
                let weight = 1.0 / total as f32;
                latents = latents + noise_pred.mapv(|v| v * weight);
            }
            latents = self.post_step(ctx, scheduler, timestep, latents)?;

            diffusionkit_core::progress::report_progress(
                ctx.progress,
                DiffusionProgress {
                    step: step_index + 1,
                    total,
                    latent: Some(latents.clone()),
                    batch_index: ctx.batch_index,
                },
            );
        }

        Ok(latents)
    }
}

/// Builds the diffuser selected by the prompt options.
pub(crate) fn create_diffuser(prompt: &PromptOptions) -> Result<Box<dyn Diffuser>> {
    let diffuser: Box<dyn Diffuser> = match prompt.diffuser_type {
        DiffuserType::TextToImage => Box::new(TextToImageDiffuser::default()),
        DiffuserType::ImageToImage => Box::new(ImageToImageDiffuser::default()),
        DiffuserType::ImageInpaint => Box::new(InpaintDiffuser::default()),
        DiffuserType::ImageInpaintLegacy => Box::new(InpaintLegacyDiffuser::default()),
        DiffuserType::ControlNet => Box::new(ControlNetDiffuser::default()),
        DiffuserType::ControlNetImage => Box::new(ControlNetImageDiffuser::default()),
        DiffuserType::VideoToVideo => {
            return Err(DiffusionError::InvalidOptions(
                "VideoToVideo runs through the video adapter, one frame at a time".to_string(),
            ))
        }
    };
    Ok(diffuser)
}

pub(crate) fn double_batch(latent: &Array4<f32>) -> Array4<f32> {
    concatenate![Axis(0), latent.view(), latent.view()]
}

/// Splits the doubled batch and extrapolates `neg + w * (pos - neg)`.
pub(crate) fn apply_guidance(noise_pred: &Array4<f32>, scale: f32) -> Result<Array4<f32>> {
    let dynamic = noise_pred.clone().into_dyn();
    let (neg, pos) = tensor::chunk2(&dynamic)?;
    let combined = tensor::guidance_combine(&neg, &pos, scale)?;
    combined
        .into_dimensionality::<Ix4>()
        .map_err(|e| DiffusionError::shape("[1, C, H, W]", e.to_string()))
}

/// One UNet evaluation: sample, timestep, embeddings, then any extras.
pub(crate) async fn predict_noise(
    ctx: &DiffusionContext<'_>,
    latent_input: Array4<f32>,
    timestep: i64,
    extras: Vec<InputValue>,
) -> Result<Array4<f32>> {
    let timestep_tensor = ArrayD::from_shape_vec(vec![1], vec![timestep])
        .map_err(|e| DiffusionError::inference("unet", e))?;
    let mut params = OnnxInferenceParameters::new()
        .add_input_tensor(latent_input.into_dyn())
        .add_input(InputValue::Int64(timestep_tensor))
        .add_input_tensor(ctx.embeddings.prompt_embeds.clone());
    for extra in extras {
        params = params.add_input(extra);
    }

    let mut outputs = ctx.models.unet.run_async(params).await?;
    if outputs.is_empty() {
        return Err(DiffusionError::inference("unet", "no output tensor"));
    }
    outputs
        .remove(0)
        .into_float()?
        .into_dimensionality::<Ix4>()
        .map_err(|e| DiffusionError::shape("[B, C, H, W]", e.to_string()))
}

/// Encodes a conditioning image into a scaled VAE latent.
pub(crate) async fn encode_image_latents(
    vae_encoder: &OnnxModelSession,
    scale_factor: f32,
    image: &InputImage,
    height: usize,
    width: usize,
) -> Result<Array4<f32>> {
    let pixels = image.get_image_tensor(height, width, ImageNormalizeMode::MinusOneToOne)?;
    let params = OnnxInferenceParameters::new().add_input_tensor(pixels.into_dyn());
    let mut outputs = vae_encoder.run_async(params).await?;
    if outputs.is_empty() {
        return Err(DiffusionError::inference("vae-encoder", "no output tensor"));
    }
    let latents = outputs
        .remove(0)
        .into_float()?
        .into_dimensionality::<Ix4>()
        .map_err(|e| DiffusionError::shape("[1, C, H/8, W/8]", e.to_string()))?;
    Ok(latents.mapv(|v| v * scale_factor))
}

/// Decodes a final latent into a `[1, 3, H, W]` pixel tensor in [0, 1].
pub(crate) async fn decode_latents(
    vae_decoder: &OnnxModelSession,
    scale_factor: f32,
    latents: Array4<f32>,
) -> Result<Array4<f32>> {
    let scaled = latents.mapv(|v| v / scale_factor);
    let params = OnnxInferenceParameters::new().add_input_tensor(scaled.into_dyn());
    let mut outputs = vae_decoder.run_async(params).await?;
    if outputs.is_empty() {
        return Err(DiffusionError::inference("vae-decoder", "no output tensor"));
    }
    let image = outputs.remove(0).into_float()?;
    let normalized = tensor::normalize_minus_one_to_one(&image);
    normalized
        .into_dimensionality::<Ix4>()
        .map_err(|e| DiffusionError::shape("[1, 3, H, W]", e.to_string()))
}

/// Resizes a mask image to the given resolution, one channel, values in [0, 1].
pub(crate) fn resize_mask_channel(
    mask: &InputImage,
    height: usize,
    width: usize,
) -> Result<Array4<f32>> {
    let pixels = mask.get_image_tensor(height, width, ImageNormalizeMode::ZeroToOne)?;
    let mut single = Array4::<f32>::zeros((1, 1, height, width));
    for y in 0..height {
        for x in 0..width {
            // Average the channels; masks are effectively grayscale.
            let value =
                (pixels[[0, 0, y, x]] + pixels[[0, 1, y, x]] + pixels[[0, 2, y, x]]) / 3.0;
            single[[0, 0, y, x]] = value;
        }
    }
    Ok(single)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_batch_duplicates_along_axis_zero() {
        let latent = Array4::from_elem((1, 4, 2, 2), 1.5);
        let doubled = double_batch(&latent);
        assert_eq!(doubled.dim(), (2, 4, 2, 2));
        assert_eq!(doubled[[0, 0, 0, 0]], doubled[[1, 0, 0, 0]]);
    }

    #[test]
    fn apply_guidance_extrapolates() {
        let mut batch = Array4::zeros((2, 1, 1, 1));
        batch[[0, 0, 0, 0]] = 1.0; // negative
        batch[[1, 0, 0, 0]] = 2.0; // positive
        let combined = apply_guidance(&batch, 7.5).unwrap();
        assert_eq!(combined.dim(), (1, 1, 1, 1));
        assert_eq!(combined[[0, 0, 0, 0]], 1.0 + 7.5 * 1.0);
    }

    #[test]
    fn apply_guidance_requires_doubled_batch() {
        let single = Array4::<f32>::zeros((1, 1, 1, 1));
        assert!(apply_guidance(&single, 7.5).is_err());
    }

    #[test]
    fn mask_resize_produces_single_channel() {
        let mask = InputImage::Tensor(Array4::from_elem((1, 3, 8, 8), 1.0));
        let latent_mask = resize_mask_channel(&mask, 8, 8).unwrap();
        assert_eq!(latent_mask.dim(), (1, 1, 8, 8));
        assert_eq!(latent_mask[[0, 0, 4, 4]], 1.0);
    }

    #[test]
    fn video_frames_are_rejected_by_the_factory() {
        let prompt = PromptOptions {
            diffuser_type: DiffuserType::VideoToVideo,
            ..Default::default()
        };
        assert!(create_diffuser(&prompt).is_err());
    }
}
