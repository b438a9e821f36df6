//! Full inpaint: a 9-channel UNet consumes latent, mask, and masked-image
//! latent together over the complete timestep list. No mid-step blending.

use async_trait::async_trait;
use ndarray::{concatenate, Array4, Axis};

use diffusionkit_core::{DiffuserType, DiffusionError, ImageNormalizeMode, Result};

use super::{
    encode_image_latents, resize_mask_channel, DiffusionContext, Diffuser, LATENT_FACTOR,
};
use crate::schedulers::Scheduler;

#[derive(Debug, Default)]
pub(crate) struct InpaintDiffuser {
    mask_latent: Option<Array4<f32>>,
    masked_image_latents: Option<Array4<f32>>,
}

#[async_trait]
impl Diffuser for InpaintDiffuser {
    fn kind(&self) -> DiffuserType {
        DiffuserType::ImageInpaint
    }

    async fn prepare_latents(
        &mut self,
        ctx: &DiffusionContext<'_>,
        scheduler: &mut dyn Scheduler,
        _timesteps: &[i64],
    ) -> Result<Array4<f32>> {
        let image = ctx
            .prompt
            .input_image
            .as_ref()
            .ok_or_else(|| DiffusionError::InvalidOptions("missing input image".to_string()))?;
        let mask_image = ctx
            .prompt
            .input_mask
            .as_ref()
            .ok_or_else(|| DiffusionError::InvalidOptions("missing inpaint mask".to_string()))?;
        let vae_encoder = ctx.models.vae_encoder.as_ref().ok_or_else(|| {
            DiffusionError::InvalidOptions("model set has no VAE encoder".to_string())
        })?;

        let height = ctx.options.height;
        let width = ctx.options.width;

        // Zero out the repaint region before encoding.
        let pixels = image.get_image_tensor(height, width, ImageNormalizeMode::MinusOneToOne)?;
        let pixel_mask = resize_mask_channel(mask_image, height, width)?;
        let mut masked = pixels;
        for c in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    masked[[0, c, y, x]] *= 1.0 - pixel_mask[[0, 0, y, x]];
                }
            }
        }

        self.masked_image_latents = Some(
            encode_image_latents(
                vae_encoder,
                ctx.model.scale_factor,
                &diffusionkit_core::InputImage::Tensor(masked),
                height,
                width,
            )
            .await?,
        );
        self.mask_latent = Some(resize_mask_channel(
            mask_image,
            height / LATENT_FACTOR,
            width / LATENT_FACTOR,
        )?);

        let sigma = scheduler.init_noise_sigma();
        Ok(scheduler.create_random_sample(ctx.latent_shape(), sigma))
    }

    fn augment_latent_input(
        &self,
        _ctx: &DiffusionContext<'_>,
        scaled: Array4<f32>,
    ) -> Result<Array4<f32>> {
        let mask = self
            .mask_latent
            .as_ref()
            .ok_or_else(|| DiffusionError::InvalidOptions("mask was not prepared".to_string()))?;
        let masked_latents = self.masked_image_latents.as_ref().ok_or_else(|| {
            DiffusionError::InvalidOptions("masked image latents were not prepared".to_string())
        })?;

        let batch = scaled.dim().0;
        let mask_views: Vec<_> = (0..batch).map(|_| mask.view()).collect();
        let masked_views: Vec<_> = (0..batch).map(|_| masked_latents.view()).collect();
        let mask_batch = concatenate(Axis(0), &mask_views)
            .map_err(|e| DiffusionError::shape("[B, 1, H/8, W/8]", e.to_string()))?;
        let masked_batch = concatenate(Axis(0), &masked_views)
            .map_err(|e| DiffusionError::shape("[B, 4, H/8, W/8]", e.to_string()))?;

        // latent || mask || masked_latent -> 9 channels
        concatenate(Axis(1), &[scaled.view(), mask_batch.view(), masked_batch.view()])
            .map_err(|e| DiffusionError::shape("[B, 9, H/8, W/8]", e.to_string()))
    }
}
