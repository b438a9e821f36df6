//! Text-to-image: random gaussian latents over the full timestep list.

use async_trait::async_trait;
use ndarray::Array4;

use diffusionkit_core::{DiffuserType, Result};

use super::{DiffusionContext, Diffuser};
use crate::schedulers::Scheduler;

#[derive(Debug, Default)]
pub(crate) struct TextToImageDiffuser;

#[async_trait]
impl Diffuser for TextToImageDiffuser {
    fn kind(&self) -> DiffuserType {
        DiffuserType::TextToImage
    }

    async fn prepare_latents(
        &mut self,
        ctx: &DiffusionContext<'_>,
        scheduler: &mut dyn Scheduler,
        _timesteps: &[i64],
    ) -> Result<Array4<f32>> {
        let sigma = scheduler.init_noise_sigma();
        Ok(scheduler.create_random_sample(ctx.latent_shape(), sigma))
    }
}
