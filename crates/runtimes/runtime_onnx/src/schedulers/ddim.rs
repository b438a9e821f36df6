//! DDIM solver: deterministic eta = 0 stepping.

use ndarray::Array4;

use diffusionkit_core::{PredictionType, Result, SchedulerOptions};

use super::{Scheduler, SchedulerCommon, StepResult};

pub struct DdimScheduler {
    common: SchedulerCommon,
}

impl DdimScheduler {
    pub fn new(options: &SchedulerOptions) -> Self {
        Self { common: SchedulerCommon::new(options) }
    }

    fn previous_timestep(&self, timestep: i64) -> i64 {
        timestep
            - (self.common.options.train_timesteps / self.common.options.inference_steps) as i64
    }

    /// The epsilon consistent with the clean-sample estimate.
    fn pred_epsilon(
        &self,
        sample: &Array4<f32>,
        model_output: &Array4<f32>,
        pred_original: &Array4<f32>,
        alpha_prod_t: f32,
    ) -> Array4<f32> {
        let beta_prod_t = 1.0 - alpha_prod_t;
        match self.common.options.prediction_type {
            PredictionType::Epsilon => model_output.clone(),
            PredictionType::VPrediction => {
                sample.mapv(|v| v * beta_prod_t.sqrt()) + model_output.mapv(|v| v * alpha_prod_t.sqrt())
            }
            PredictionType::Sample => {
                (sample - &pred_original.mapv(|v| v * alpha_prod_t.sqrt()))
                    .mapv(|v| v / beta_prod_t.sqrt())
            }
        }
    }
}

impl Scheduler for DdimScheduler {
    fn timesteps(&self) -> &[i64] {
        &self.common.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    fn scale_input(&mut self, latent: Array4<f32>, _timestep: i64) -> Array4<f32> {
        latent
    }

    fn step(
        &mut self,
        noise_pred: &Array4<f32>,
        timestep: i64,
        latent: Array4<f32>,
    ) -> Result<StepResult> {
        self.common.index_of(timestep)?;
        let prev_timestep = self.previous_timestep(timestep);

        let alpha_prod_t = self.common.alpha_cumprod(timestep);
        let alpha_prod_prev =
            if prev_timestep >= 0 { self.common.alpha_cumprod(prev_timestep) } else { 1.0 };

        let pred_original = self.common.pred_original_alpha(&latent, noise_pred, timestep);
        let pred_epsilon = self.pred_epsilon(&latent, noise_pred, &pred_original, alpha_prod_t);

        let direction = pred_epsilon.mapv(|v| v * (1.0 - alpha_prod_prev).sqrt());
        let prev_sample = pred_original.mapv(|v| v * alpha_prod_prev.sqrt()) + direction;

        Ok(StepResult { prev_sample, pred_original_sample: Some(pred_original) })
    }

    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Array4<f32> {
        self.common.randn(shape).mapv(|v| v * sigma)
    }

    fn add_noise(&mut self, clean: &Array4<f32>, noise: &Array4<f32>, timestep: i64) -> Array4<f32> {
        self.common.add_noise_alpha(clean, noise, timestep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffusionkit_core::SchedulerType;

    fn scheduler(steps: usize) -> DdimScheduler {
        DdimScheduler::new(&SchedulerOptions {
            scheduler_type: SchedulerType::Ddim,
            inference_steps: steps,
            seed: 42,
            ..Default::default()
        })
    }

    #[test]
    fn step_is_deterministic() {
        let mut a = scheduler(10);
        let mut b = DdimScheduler::new(&SchedulerOptions {
            scheduler_type: SchedulerType::Ddim,
            inference_steps: 10,
            seed: 1234,
            ..Default::default()
        });
        let t = a.timesteps()[3];
        let latent = Array4::from_elem((1, 4, 8, 8), 0.4);
        let noise_pred = Array4::from_elem((1, 4, 8, 8), 0.2);
        let ra = a.step(&noise_pred, t, latent.clone()).unwrap();
        let rb = b.step(&noise_pred, t, latent).unwrap();
        assert_eq!(ra.prev_sample, rb.prev_sample);
    }

    #[test]
    fn zero_noise_prediction_contracts_toward_sample() {
        // With eps = 0 the update is pred_original * sqrt(acp_prev), and
        // pred_original = sample / sqrt(acp_t); the trajectory stays parallel
        // to the sample.
        let mut sched = scheduler(10);
        let t = sched.timesteps()[0];
        let latent = Array4::from_elem((1, 4, 8, 8), 1.0);
        let zeros = Array4::zeros((1, 4, 8, 8));
        let result = sched.step(&zeros, t, latent).unwrap();
        let acp_t = sched.common.alpha_cumprod(t);
        let acp_prev = sched.common.alpha_cumprod(sched.previous_timestep(t));
        let expected = (acp_prev / acp_t).sqrt();
        assert!((result.prev_sample[[0, 0, 0, 0]] - expected).abs() < 1e-4);
    }

    #[test]
    fn final_step_lands_on_denoised_estimate() {
        // prev_timestep < 0 means acp_prev = 1: the output is exactly the
        // clean-sample estimate.
        let mut sched = scheduler(10);
        let t = *sched.timesteps().last().unwrap();
        let latent = Array4::from_elem((1, 4, 8, 8), 0.8);
        let noise_pred = Array4::from_elem((1, 4, 8, 8), 0.3);
        let result = sched.step(&noise_pred, t, latent).unwrap();
        let pred = result.pred_original_sample.unwrap();
        let diff = (&result.prev_sample - &pred).mapv(f32::abs).sum();
        assert!(diff < 1e-4);
    }
}
