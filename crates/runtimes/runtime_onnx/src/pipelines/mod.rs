//! Pipeline shells: sub-model lifecycle, option validation, diffuser and
//! scheduler selection, batch runs, memory-residency policy.

mod instaflow;
mod latent_consistency;
mod stable_cascade;
mod stable_diffusion;

pub use instaflow::InstaFlowPipeline;
pub use latent_consistency::LatentConsistencyPipeline;
pub use stable_cascade::StableCascadePipeline;
pub use stable_diffusion::StableDiffusionPipeline;

use rand::Rng;

use diffusionkit_core::{PipelineType, Result, SchedulerOptions, StableDiffusionModelSet};
use diffusionkit_runtime_api::Pipeline;

use crate::session::OnnxModelSession;

/// Builds the pipeline shell declared by the model set.
pub fn create_pipeline(model: StableDiffusionModelSet) -> Box<dyn Pipeline> {
    match model.pipeline_type {
        PipelineType::StableDiffusion => Box::new(StableDiffusionPipeline::new(model)),
        PipelineType::InstaFlow => Box::new(InstaFlowPipeline::new(model)),
        PipelineType::LatentConsistency => Box::new(LatentConsistencyPipeline::new(model)),
        PipelineType::StableCascade => Box::new(StableCascadePipeline::new(model)),
    }
}

/// The atomic set of sub-model handles owned by one pipeline instance.
pub(crate) struct SubModels {
    pub tokenizer: OnnxModelSession,
    pub tokenizer2: Option<OnnxModelSession>,
    pub text_encoder: OnnxModelSession,
    pub text_encoder2: Option<OnnxModelSession>,
    pub unet: OnnxModelSession,
    pub unet2: Option<OnnxModelSession>,
    pub vae_decoder: OnnxModelSession,
    pub vae_encoder: Option<OnnxModelSession>,
    pub controlnet: Option<OnnxModelSession>,
}

impl SubModels {
    pub fn from_model_set(model: &StableDiffusionModelSet) -> Self {
        Self {
            tokenizer: OnnxModelSession::new("tokenizer", model.tokenizer.clone()),
            tokenizer2: model
                .tokenizer2
                .clone()
                .map(|c| OnnxModelSession::new("tokenizer2", c)),
            text_encoder: OnnxModelSession::new("text-encoder", model.text_encoder.clone()),
            text_encoder2: model
                .text_encoder2
                .clone()
                .map(|c| OnnxModelSession::new("text-encoder2", c)),
            unet: OnnxModelSession::new("unet", model.unet.clone()),
            unet2: model.unet2.clone().map(|c| OnnxModelSession::new("unet2", c)),
            vae_decoder: OnnxModelSession::new("vae-decoder", model.vae_decoder.clone()),
            vae_encoder: model
                .vae_encoder
                .clone()
                .map(|c| OnnxModelSession::new("vae-encoder", c)),
            controlnet: model
                .controlnet
                .clone()
                .map(|c| OnnxModelSession::new("controlnet", c)),
        }
    }

    fn handles_mut(&mut self) -> Vec<&mut OnnxModelSession> {
        let mut handles = vec![&mut self.tokenizer, &mut self.text_encoder, &mut self.unet, &mut self.vae_decoder];
        handles.extend(self.tokenizer2.as_mut());
        handles.extend(self.text_encoder2.as_mut());
        handles.extend(self.unet2.as_mut());
        handles.extend(self.vae_encoder.as_mut());
        handles.extend(self.controlnet.as_mut());
        handles
    }

    fn handles(&self) -> Vec<&OnnxModelSession> {
        let mut handles = vec![&self.tokenizer, &self.text_encoder, &self.unet, &self.vae_decoder];
        handles.extend(self.tokenizer2.as_ref());
        handles.extend(self.text_encoder2.as_ref());
        handles.extend(self.unet2.as_ref());
        handles.extend(self.vae_encoder.as_ref());
        handles.extend(self.controlnet.as_ref());
        handles
    }

    /// Loads the whole set; on any failure everything loaded so far is
    /// unloaded again so the set stays atomic.
    pub fn load_all(&mut self) -> Result<()> {
        let mut failure = None;
        for handle in self.handles_mut() {
            if let Err(e) = handle.load() {
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            self.unload_all();
            return Err(e);
        }
        Ok(())
    }

    pub fn unload_all(&mut self) {
        for handle in self.handles_mut() {
            handle.unload();
        }
    }

    pub fn all_unloaded(&self) -> bool {
        self.handles().iter().all(|h| !h.is_loaded())
    }
}

/// A fresh nonzero seed for runs that asked for a random one.
pub(crate) fn random_seed() -> u64 {
    let mut rng = rand::thread_rng();
    let mut seed: u64 = rng.gen();
    while seed == 0 {
        seed = rng.gen();
    }
    seed
}

/// Seed 0 means "pick one now"; the resolved value is recorded in results.
pub(crate) fn resolve_seed(options: &SchedulerOptions) -> SchedulerOptions {
    if options.seed == 0 {
        let seed = random_seed();
        tracing::debug!(seed, "resolved random seed");
        SchedulerOptions { seed, ..options.clone() }
    } else {
        options.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_set() -> StableDiffusionModelSet {
        serde_json::from_str(
            r#"{
                "name": "sd15",
                "pipeline_type": "StableDiffusion",
                "tokenizer": {"path": "models/tokenizer.onnx"},
                "text_encoder": {"path": "models/text_encoder.onnx"},
                "unet": {"path": "models/unet.onnx"},
                "vae_decoder": {"path": "models/vae_decoder.onnx"},
                "vae_encoder": {"path": "models/vae_encoder.onnx"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn submodels_start_unloaded() {
        let models = SubModels::from_model_set(&model_set());
        assert!(models.all_unloaded());
        assert_eq!(models.handles().len(), 5);
    }

    #[test]
    fn resolve_seed_replaces_zero_only() {
        let zero = SchedulerOptions { seed: 0, ..Default::default() };
        let resolved = resolve_seed(&zero);
        assert_ne!(resolved.seed, 0);

        let fixed = SchedulerOptions { seed: 42, ..Default::default() };
        assert_eq!(resolve_seed(&fixed).seed, 42);
    }

    #[test]
    fn random_seeds_are_distinct() {
        let a = random_seed();
        let b = random_seed();
        // Collision probability is negligible.
        assert_ne!(a, b);
    }
}
