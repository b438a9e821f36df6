//! User-facing option types.
//!
//! `PromptOptions` carries intent (what to draw, which task), while
//! `SchedulerOptions` carries the numeric recipe. Both are plain value types:
//! batch expansion and option updates always construct fresh copies instead of
//! mutating shared state.

use serde::{Deserialize, Serialize};

use crate::image::{InputImage, VideoFrames};

/// The per-task control loop driving latent denoising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffuserType {
    TextToImage,
    ImageToImage,
    ImageInpaint,
    ImageInpaintLegacy,
    ControlNet,
    ControlNetImage,
    VideoToVideo,
}

impl DiffuserType {
    /// Diffusers that require an input image to condition on.
    pub fn requires_input_image(&self) -> bool {
        matches!(
            self,
            Self::ImageToImage | Self::ImageInpaint | Self::ImageInpaintLegacy | Self::ControlNetImage
        )
    }

    pub fn requires_control_image(&self) -> bool {
        matches!(self, Self::ControlNet | Self::ControlNetImage)
    }
}

/// Discrete reverse-diffusion solver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerType {
    Lms,
    Euler,
    EulerAncestral,
    Ddpm,
    Ddim,
    Kdpm2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    #[default]
    ScaledLinear,
    SquaredCosCapV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    #[default]
    Epsilon,
    VPrediction,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    #[default]
    Linspace,
    Leading,
    Trailing,
}

/// Governs when sub-models are unloaded during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemoryMode {
    /// Sub-models stay loaded between runs.
    #[default]
    Maximum,
    /// Each sub-model is unloaded right after its last use in a run.
    Minimum,
}

/// User intent for one generation.
#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub prompt: String,
    pub negative_prompt: String,
    pub diffuser_type: DiffuserType,
    pub input_image: Option<InputImage>,
    pub input_mask: Option<InputImage>,
    pub input_control_image: Option<InputImage>,
    pub input_video: Option<VideoFrames>,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            diffuser_type: DiffuserType::TextToImage,
            input_image: None,
            input_mask: None,
            input_control_image: None,
            input_video: None,
        }
    }
}

impl PromptOptions {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), ..Default::default() }
    }

    /// Image-conditioned diffusers need an input image, ControlNet diffusers a
    /// control image, video diffusers a frame source.
    pub fn validate(&self) -> crate::error::Result<()> {
        let diffuser = self.diffuser_type;
        if diffuser.requires_input_image() && self.input_image.is_none() {
            return Err(crate::error::DiffusionError::InvalidOptions(format!(
                "{diffuser:?} requires an input image"
            )));
        }
        if diffuser.requires_control_image() && self.input_control_image.is_none() {
            return Err(crate::error::DiffusionError::InvalidOptions(format!(
                "{diffuser:?} requires a control image"
            )));
        }
        if diffuser == DiffuserType::VideoToVideo && self.input_video.is_none() {
            return Err(crate::error::DiffusionError::InvalidOptions(
                "VideoToVideo requires an input video".to_string(),
            ));
        }
        Ok(())
    }
}

/// The numeric recipe for one generation. Immutable: updates replace the whole
/// value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// 0 means "pick a random seed when the run starts".
    pub seed: u64,
    pub inference_steps: usize,
    /// Values above 1 enable classifier-free guidance.
    pub guidance_scale: f32,
    /// Noise level for image-to-image, in (0, 1].
    pub strength: f32,
    pub height: usize,
    pub width: usize,
    pub scheduler_type: SchedulerType,
    pub train_timesteps: usize,
    pub beta_start: f32,
    pub beta_end: f32,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    pub timestep_spacing: TimestepSpacing,
    pub steps_offset: usize,
    /// ControlNet hint weight.
    pub conditioning_scale: f32,
    pub original_inference_steps: usize,
    pub trained_betas: Option<Vec<f32>>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            inference_steps: 30,
            guidance_scale: 7.5,
            strength: 0.6,
            height: 512,
            width: 512,
            scheduler_type: SchedulerType::Lms,
            train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: TimestepSpacing::Linspace,
            steps_offset: 0,
            conditioning_scale: 1.0,
            original_inference_steps: 50,
            trained_betas: None,
        }
    }
}

impl SchedulerOptions {
    pub fn is_guidance_enabled(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.inference_steps == 0 {
            return Err(crate::error::DiffusionError::InvalidOptions(
                "inference_steps must be at least 1".to_string(),
            ));
        }
        // The schedule cannot space more inference steps than the model was
        // trained with and still keep a strictly descending timestep list.
        if self.inference_steps > self.train_timesteps {
            return Err(crate::error::DiffusionError::InvalidOptions(format!(
                "inference_steps ({}) cannot exceed train_timesteps ({})",
                self.inference_steps, self.train_timesteps
            )));
        }
        if self.height % 8 != 0 || self.width % 8 != 0 {
            return Err(crate::error::DiffusionError::InvalidOptions(format!(
                "width ({}) and height ({}) must be multiples of 8",
                self.width, self.height
            )));
        }
        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(crate::error::DiffusionError::InvalidOptions(format!(
                "strength must be in (0, 1], got {}",
                self.strength
            )));
        }
        Ok(())
    }
}

/// Which single axis a batch run varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOptionType {
    Seed,
    Step,
    Guidance,
    Strength,
}

/// Expansion recipe: one scheduler config becomes a list along one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    pub batch_type: BatchOptionType,
    pub count: usize,
    pub value_from: f32,
    pub value_to: f32,
    pub increment: f32,
}
