//! Model-set configuration surface.
//!
//! A [`StableDiffusionModelSet`] enumerates the ONNX graph files making up one
//! deployable model, plus the handful of constants (tokenizer limit, latent
//! scale factor, sample size) that differ between model families. Hosts load
//! it from JSON; nothing here reads environment variables or CLI flags.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DiffusionError, Result};
use crate::options::{DiffuserType, MemoryMode, SchedulerType};

/// Which pipeline shell drives this model set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineType {
    StableDiffusion,
    InstaFlow,
    LatentConsistency,
    StableCascade,
}

/// Execution placement hint for one ONNX session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionProviderHint {
    #[default]
    Cpu,
    Cuda,
    DirectMl,
}

/// File path and placement for one sub-model graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubModelConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub provider: ExecutionProviderHint,
}

impl SubModelConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), provider: ExecutionProviderHint::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StableDiffusionModelSet {
    pub name: String,
    pub pipeline_type: PipelineType,

    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Latent scale applied after VAE encode and inverted before decode.
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f32,
    #[serde(default = "default_tokenizer_limit")]
    pub tokenizer_limit: usize,
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: i64,
    #[serde(default)]
    pub memory_mode: MemoryMode,

    #[serde(default = "default_diffusers")]
    pub diffusers: Vec<DiffuserType>,
    #[serde(default = "default_schedulers")]
    pub schedulers: Vec<SchedulerType>,

    pub tokenizer: SubModelConfig,
    #[serde(default)]
    pub tokenizer2: Option<SubModelConfig>,
    pub text_encoder: SubModelConfig,
    #[serde(default)]
    pub text_encoder2: Option<SubModelConfig>,
    pub unet: SubModelConfig,
    /// Second UNet for two-phase pipelines (Stable Cascade decoder).
    #[serde(default)]
    pub unet2: Option<SubModelConfig>,
    pub vae_decoder: SubModelConfig,
    #[serde(default)]
    pub vae_encoder: Option<SubModelConfig>,
    #[serde(default)]
    pub controlnet: Option<SubModelConfig>,
}

fn default_sample_size() -> usize {
    512
}

fn default_scale_factor() -> f32 {
    0.18215
}

fn default_tokenizer_limit() -> usize {
    77
}

fn default_pad_token_id() -> i64 {
    49407
}

fn default_diffusers() -> Vec<DiffuserType> {
    vec![DiffuserType::TextToImage]
}

fn default_schedulers() -> Vec<SchedulerType> {
    vec![
        SchedulerType::Lms,
        SchedulerType::Euler,
        SchedulerType::EulerAncestral,
        SchedulerType::Ddpm,
        SchedulerType::Ddim,
        SchedulerType::Kdpm2,
    ]
}

impl StableDiffusionModelSet {
    /// Loads a model set description from a JSON file.
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| DiffusionError::model_load(path.display().to_string(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| DiffusionError::model_load(path.display().to_string(), e))
    }

    pub fn supports_diffuser(&self, diffuser: DiffuserType) -> bool {
        // VideoToVideo rides on the image-to-image loop, per-frame.
        let effective = match diffuser {
            DiffuserType::VideoToVideo => DiffuserType::ImageToImage,
            other => other,
        };
        self.diffusers.contains(&diffuser) || self.diffusers.contains(&effective)
    }

    pub fn supports_scheduler(&self, scheduler: SchedulerType) -> bool {
        self.schedulers.contains(&scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "name": "sd15-onnx",
            "pipeline_type": "StableDiffusion",
            "diffusers": ["TextToImage", "ImageToImage"],
            "tokenizer": { "path": "models/cliptokenizer.onnx" },
            "text_encoder": { "path": "models/text_encoder.onnx" },
            "unet": { "path": "models/unet.onnx", "provider": "cuda" },
            "vae_decoder": { "path": "models/vae_decoder.onnx" }
        }"#
    }

    #[test]
    fn deserializes_with_defaults() {
        let set: StableDiffusionModelSet = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(set.sample_size, 512);
        assert_eq!(set.tokenizer_limit, 77);
        assert_eq!(set.pad_token_id, 49407);
        assert!((set.scale_factor - 0.18215).abs() < 1e-6);
        assert_eq!(set.unet.provider, ExecutionProviderHint::Cuda);
        assert_eq!(set.memory_mode, MemoryMode::Maximum);
        assert!(set.vae_encoder.is_none());
    }

    #[test]
    fn video_rides_on_image_to_image() {
        let set: StableDiffusionModelSet = serde_json::from_str(minimal_json()).unwrap();
        assert!(set.supports_diffuser(DiffuserType::VideoToVideo));
        assert!(!set.supports_diffuser(DiffuserType::ControlNet));
    }

    #[test]
    fn all_schedulers_supported_by_default() {
        let set: StableDiffusionModelSet = serde_json::from_str(minimal_json()).unwrap();
        assert!(set.supports_scheduler(SchedulerType::Kdpm2));
        assert_eq!(set.schedulers.len(), 6);
    }
}
