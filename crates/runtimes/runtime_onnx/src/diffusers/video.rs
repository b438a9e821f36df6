//! Video adapter: drives the image-to-image diffuser once per decoded frame.
//!
//! The seed either stays fixed across frames or advances by one per frame for
//! some temporal variation; latent blending between frames is left to callers
//! that need stronger coherence.

use ndarray::{concatenate, Array4, Axis};

use diffusionkit_core::{
    CancellationToken, DiffuserType, DiffusionError, ProgressCallback, PromptOptions, Result,
    SchedulerOptions, StableDiffusionModelSet,
};

use super::image_to_image::ImageToImageDiffuser;
use super::{decode_latents, DiffusionContext, Diffuser};
use crate::pipelines::SubModels;
use crate::prompt::PromptEmbeddings;
use crate::schedulers::create_scheduler;

#[derive(Debug, Default)]
pub(crate) struct VideoDiffuser;

impl VideoDiffuser {
    /// Diffuses every frame and stacks the decoded results along the batch
    /// axis: `[frames, 3, H, W]`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn diffuse_frames(
        &self,
        model: &StableDiffusionModelSet,
        models: &SubModels,
        prompt: &PromptOptions,
        options: &SchedulerOptions,
        embeddings: &PromptEmbeddings,
        progress: Option<&ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<Array4<f32>> {
        let video = prompt
            .input_video
            .as_ref()
            .ok_or_else(|| DiffusionError::InvalidOptions("missing input video".to_string()))?;
        if video.is_empty() {
            return Err(DiffusionError::InvalidOptions("input video has no frames".to_string()));
        }

        let mut decoded_frames: Vec<Array4<f32>> = Vec::with_capacity(video.len());
        for (frame_index, frame) in video.frames.iter().enumerate() {
            cancel.check()?;

            let frame_seed = frame_seed(options.seed, frame_index, video.fixed_seed);
            let frame_options = SchedulerOptions { seed: frame_seed, ..options.clone() };
            let frame_prompt = PromptOptions {
                diffuser_type: DiffuserType::ImageToImage,
                input_image: Some(frame.clone()),
                input_video: None,
                ..prompt.clone()
            };

            tracing::debug!(frame = frame_index, seed = frame_seed, "diffusing video frame");

            let ctx = DiffusionContext {
                model,
                models,
                prompt: &frame_prompt,
                options: &frame_options,
                embeddings,
                progress,
                batch_index: Some(frame_index),
                cancel,
                distilled_velocity: false,
            };
            let mut scheduler = create_scheduler(&frame_options);
            let mut diffuser = ImageToImageDiffuser::default();
            let latents = diffuser.diffuse(&ctx, scheduler.as_mut()).await?;

            cancel.check()?;
            let pixels = decode_latents(&models.vae_decoder, model.scale_factor, latents).await?;
            decoded_frames.push(pixels);
        }

        let views: Vec<_> = decoded_frames.iter().map(|f| f.view()).collect();
        concatenate(Axis(0), &views)
            .map_err(|e| DiffusionError::shape("[frames, 3, H, W]", e.to_string()))
    }
}

/// Fixed seed reuses the run seed for every frame; otherwise each frame
/// advances it by one.
fn frame_seed(base: u64, frame_index: usize, fixed: bool) -> u64 {
    if fixed {
        base
    } else {
        base.wrapping_add(frame_index as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_seed_advances_per_frame() {
        assert_eq!(frame_seed(42, 0, false), 42);
        assert_eq!(frame_seed(42, 3, false), 45);
    }

    #[test]
    fn fixed_seed_is_constant() {
        assert_eq!(frame_seed(42, 3, true), 42);
        assert_eq!(frame_seed(42, 7, true), 42);
    }

    #[test]
    fn seed_jitter_wraps_instead_of_overflowing() {
        assert_eq!(frame_seed(u64::MAX, 1, false), 0);
    }
}
