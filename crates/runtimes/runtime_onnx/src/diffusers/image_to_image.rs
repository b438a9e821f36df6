//! Image-to-image: start from the VAE-encoded input image, noised to the
//! strength-scaled start timestep, and iterate only the remaining schedule.

use async_trait::async_trait;
use ndarray::Array4;

use diffusionkit_core::{DiffuserType, DiffusionError, Result, SchedulerOptions};

use super::{encode_image_latents, DiffusionContext, Diffuser};
use crate::schedulers::Scheduler;

/// Index of the first timestep an image-to-image run iterates:
/// `steps - (steps * strength)`.
pub(crate) fn start_step(options: &SchedulerOptions) -> usize {
    let steps = options.inference_steps;
    steps - ((steps as f32 * options.strength) as usize).min(steps)
}

/// The strength-truncated suffix of the schedule.
pub(crate) fn strength_timesteps(scheduler: &dyn Scheduler, options: &SchedulerOptions) -> Vec<i64> {
    scheduler.timesteps()[start_step(options)..].to_vec()
}

/// Encodes the conditioning image into a clean, scaled VAE latent.
pub(crate) async fn encode_clean_latents(ctx: &DiffusionContext<'_>) -> Result<Array4<f32>> {
    let image = ctx
        .prompt
        .input_image
        .as_ref()
        .ok_or_else(|| DiffusionError::InvalidOptions("missing input image".to_string()))?;
    let vae_encoder = ctx
        .models
        .vae_encoder
        .as_ref()
        .ok_or_else(|| DiffusionError::InvalidOptions("model set has no VAE encoder".to_string()))?;

    encode_image_latents(
        vae_encoder,
        ctx.model.scale_factor,
        image,
        ctx.options.height,
        ctx.options.width,
    )
    .await
}

/// Noises a clean latent to the first timestep of the truncated schedule.
pub(crate) fn noise_to_start(
    ctx: &DiffusionContext<'_>,
    scheduler: &mut dyn Scheduler,
    clean: &Array4<f32>,
    timesteps: &[i64],
) -> Result<Array4<f32>> {
    let start_timestep = timesteps
        .first()
        .copied()
        .ok_or_else(|| DiffusionError::InvalidOptions("empty timestep schedule".to_string()))?;
    let noise = scheduler.create_random_sample(ctx.latent_shape(), 1.0);
    Ok(scheduler.add_noise(clean, &noise, start_timestep))
}

/// Encodes the conditioning image and noises it to the first timestep.
pub(crate) async fn prepare_image_latents(
    ctx: &DiffusionContext<'_>,
    scheduler: &mut dyn Scheduler,
    timesteps: &[i64],
) -> Result<Array4<f32>> {
    let clean = encode_clean_latents(ctx).await?;
    noise_to_start(ctx, scheduler, &clean, timesteps)
}

#[derive(Debug, Default)]
pub(crate) struct ImageToImageDiffuser;

#[async_trait]
impl Diffuser for ImageToImageDiffuser {
    fn kind(&self) -> DiffuserType {
        DiffuserType::ImageToImage
    }

    fn select_timesteps(&self, scheduler: &dyn Scheduler, options: &SchedulerOptions) -> Vec<i64> {
        strength_timesteps(scheduler, options)
    }

    async fn prepare_latents(
        &mut self,
        ctx: &DiffusionContext<'_>,
        scheduler: &mut dyn Scheduler,
        timesteps: &[i64],
    ) -> Result<Array4<f32>> {
        prepare_image_latents(ctx, scheduler, timesteps).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::create_scheduler;
    use diffusionkit_core::SchedulerType;

    fn options(steps: usize, strength: f32) -> SchedulerOptions {
        SchedulerOptions {
            scheduler_type: SchedulerType::Euler,
            inference_steps: steps,
            strength,
            seed: 7,
            ..Default::default()
        }
    }

    #[test]
    fn start_step_scales_with_strength() {
        assert_eq!(start_step(&options(30, 0.8)), 6);
        assert_eq!(start_step(&options(30, 1.0)), 0);
        assert_eq!(start_step(&options(30, 0.5)), 15);
    }

    #[test]
    fn truncated_schedule_has_strength_scaled_length() {
        let opts = options(30, 0.8);
        let scheduler = create_scheduler(&opts);
        let ts = strength_timesteps(scheduler.as_ref(), &opts);
        assert_eq!(ts.len(), 24);
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn full_strength_keeps_the_whole_schedule() {
        let opts = options(30, 1.0);
        let scheduler = create_scheduler(&opts);
        let ts = strength_timesteps(scheduler.as_ref(), &opts);
        assert_eq!(ts, scheduler.timesteps());
    }
}
