//! ControlNet diffusers: the ControlNet session runs alongside the UNet each
//! step and its outputs feed the UNet as additional residual inputs.

use async_trait::async_trait;
use ndarray::{Array4, ArrayD};

use diffusionkit_core::{DiffuserType, DiffusionError, ImageNormalizeMode, Result, SchedulerOptions};

use super::image_to_image::{prepare_image_latents, strength_timesteps};
use super::{double_batch, DiffusionContext, Diffuser};
use crate::schedulers::Scheduler;
use crate::session::{InputValue, OnnxInferenceParameters};

/// ControlNet graphs with a fifth input take the conditioning scale as a
/// float64 scalar.
const CONTROLNET_BASE_INPUTS: usize = 4;

#[derive(Debug, Default)]
pub(crate) struct ControlNetDiffuser {
    control_image: Option<Array4<f32>>,
}

#[derive(Debug, Default)]
pub(crate) struct ControlNetImageDiffuser {
    inner: ControlNetDiffuser,
}

/// Loads the control hint at pixel resolution, batched for guidance.
fn prepare_control_image(ctx: &DiffusionContext<'_>) -> Result<Array4<f32>> {
    let image = ctx
        .prompt
        .input_control_image
        .as_ref()
        .ok_or_else(|| DiffusionError::InvalidOptions("missing control image".to_string()))?;
    let tensor =
        image.get_image_tensor(ctx.options.height, ctx.options.width, ImageNormalizeMode::ZeroToOne)?;
    if ctx.options.is_guidance_enabled() {
        Ok(double_batch(&tensor))
    } else {
        Ok(tensor)
    }
}

/// Runs the ControlNet session and returns its outputs as UNet extras.
async fn controlnet_extras(
    ctx: &DiffusionContext<'_>,
    control_image: &Array4<f32>,
    scaled_latent: &Array4<f32>,
    timestep: i64,
) -> Result<Vec<InputValue>> {
    let controlnet = ctx
        .models
        .controlnet
        .as_ref()
        .ok_or_else(|| DiffusionError::InvalidOptions("model set has no ControlNet".to_string()))?;

    let timestep_tensor = ArrayD::from_shape_vec(vec![1], vec![timestep])
        .map_err(|e| DiffusionError::inference("controlnet", e))?;
    let mut params = OnnxInferenceParameters::new()
        .add_input_tensor(scaled_latent.clone().into_dyn())
        .add_input(InputValue::Int64(timestep_tensor))
        .add_input_tensor(ctx.embeddings.prompt_embeds.clone())
        .add_input_tensor(control_image.clone().into_dyn());

    if controlnet.metadata()?.inputs.len() > CONTROLNET_BASE_INPUTS {
        let scale = ArrayD::from_shape_vec(vec![1], vec![ctx.options.conditioning_scale as f64])
            .map_err(|e| DiffusionError::inference("controlnet", e))?;
        params = params.add_input(InputValue::Double(scale));
    }

    let outputs = controlnet.run_async(params).await?;
    outputs
        .into_iter()
        .map(|output| Ok(InputValue::Float(output.into_float()?)))
        .collect()
}

#[async_trait]
impl Diffuser for ControlNetDiffuser {
    fn kind(&self) -> DiffuserType {
        DiffuserType::ControlNet
    }

    async fn prepare_latents(
        &mut self,
        ctx: &DiffusionContext<'_>,
        scheduler: &mut dyn Scheduler,
        _timesteps: &[i64],
    ) -> Result<Array4<f32>> {
        self.control_image = Some(prepare_control_image(ctx)?);
        let sigma = scheduler.init_noise_sigma();
        Ok(scheduler.create_random_sample(ctx.latent_shape(), sigma))
    }

    async fn build_extras(
        &self,
        ctx: &DiffusionContext<'_>,
        scaled_latent: &Array4<f32>,
        timestep: i64,
    ) -> Result<Vec<InputValue>> {
        let control_image = self
            .control_image
            .as_ref()
            .ok_or_else(|| DiffusionError::InvalidOptions("control image was not prepared".to_string()))?;
        controlnet_extras(ctx, control_image, scaled_latent, timestep).await
    }
}

#[async_trait]
impl Diffuser for ControlNetImageDiffuser {
    fn kind(&self) -> DiffuserType {
        DiffuserType::ControlNetImage
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
        self.inner.control_image = Some(prepare_control_image(ctx)?);
        prepare_image_latents(ctx, scheduler, timesteps).await
    }

    async fn build_extras(
        &self,
        ctx: &DiffusionContext<'_>,
        scaled_latent: &Array4<f32>,
        timestep: i64,
    ) -> Result<Vec<InputValue>> {
        self.inner.build_extras(ctx, scaled_latent, timestep).await
    }
}
