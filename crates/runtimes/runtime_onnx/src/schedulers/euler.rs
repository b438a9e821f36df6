//! Euler discrete solver: first-order ODE step in sigma space.

use ndarray::Array4;

use diffusionkit_core::{Result, SchedulerOptions, TimestepSpacing};

use super::{Scheduler, SchedulerCommon, StepResult};

pub struct EulerScheduler {
    common: SchedulerCommon,
    sigmas: Vec<f32>,
    init_noise_sigma: f32,
}

impl EulerScheduler {
    pub fn new(options: &SchedulerOptions) -> Self {
        let common = SchedulerCommon::new(options);
        let sigmas = common.step_sigmas();
        let init_noise_sigma = init_sigma(options, &sigmas);
        Self { common, sigmas, init_noise_sigma }
    }
}

/// Max sigma for linspace/trailing spacing, `sqrt(max^2 + 1)` for leading.
pub(super) fn init_sigma(options: &SchedulerOptions, sigmas: &[f32]) -> f32 {
    let max = sigmas.iter().cloned().fold(0.0f32, f32::max);
    match options.timestep_spacing {
        TimestepSpacing::Linspace | TimestepSpacing::Trailing => max,
        TimestepSpacing::Leading => (max * max + 1.0).sqrt(),
    }
}

impl Scheduler for EulerScheduler {
    fn timesteps(&self) -> &[i64] {
        &self.common.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        self.init_noise_sigma
    }

    fn scale_input(&mut self, latent: Array4<f32>, timestep: i64) -> Array4<f32> {
        let sigma = self.common.sigma(timestep);
        let scale = (sigma * sigma + 1.0).sqrt();
        latent.mapv(|v| v / scale)
    }

    fn step(
        &mut self,
        noise_pred: &Array4<f32>,
        timestep: i64,
        latent: Array4<f32>,
    ) -> Result<StepResult> {
        let index = self.common.index_of(timestep)?;
        let sigma = self.sigmas[index];
        let sigma_next = self.sigmas[index + 1];

        let pred_original = self.common.pred_original_sigma(&latent, noise_pred, sigma);
        let derivative = (&latent - &pred_original).mapv(|v| v / sigma);
        let dt = sigma_next - sigma;
        let prev_sample = &latent + &derivative.mapv(|v| v * dt);

        Ok(StepResult { prev_sample, pred_original_sample: Some(pred_original) })
    }

    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Array4<f32> {
        self.common.randn(shape).mapv(|v| v * sigma)
    }

    fn add_noise(&mut self, clean: &Array4<f32>, noise: &Array4<f32>, timestep: i64) -> Array4<f32> {
        self.common.add_noise_sigma(clean, noise, timestep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffusionkit_core::SchedulerType;

    fn scheduler(steps: usize, seed: u64) -> EulerScheduler {
        EulerScheduler::new(&SchedulerOptions {
            scheduler_type: SchedulerType::Euler,
            inference_steps: steps,
            seed,
            ..Default::default()
        })
    }

    #[test]
    fn init_noise_sigma_is_max_sigma_for_linspace() {
        let sched = scheduler(30, 42);
        let max = sched.sigmas.iter().cloned().fold(0.0f32, f32::max);
        assert_eq!(sched.init_noise_sigma(), max);
        // SD v1 sigma_max is about 14.6
        assert!((max - 14.6).abs() < 0.1);
    }

    #[test]
    fn scale_input_divides_by_sigma_norm() {
        let mut sched = scheduler(30, 42);
        let t = sched.timesteps()[0];
        let sigma = sched.common.sigma(t);
        let latent = Array4::from_elem((1, 4, 8, 8), 2.0);
        let scaled = sched.scale_input(latent, t);
        let expected = 2.0 / (sigma * sigma + 1.0).sqrt();
        assert!((scaled[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn step_moves_toward_denoised_sample() {
        let mut sched = scheduler(10, 42);
        let t = sched.timesteps()[0];
        let latent = sched.create_random_sample([1, 4, 8, 8], sched.init_noise_sigma());
        let noise_pred = Array4::from_elem((1, 4, 8, 8), 0.1);
        let result = sched.step(&noise_pred, t, latent.clone()).unwrap();
        assert_eq!(result.prev_sample.dim(), latent.dim());
        assert!(result.pred_original_sample.is_some());
        assert_ne!(result.prev_sample, latent);
    }

    #[test]
    fn step_rejects_unknown_timestep() {
        let mut sched = scheduler(10, 42);
        let latent = Array4::zeros((1, 4, 8, 8));
        assert!(sched.step(&latent.clone(), 12345, latent).is_err());
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        let mut a = scheduler(10, 7);
        let mut b = scheduler(10, 7);
        assert_eq!(
            a.create_random_sample([1, 4, 8, 8], 1.0),
            b.create_random_sample([1, 4, 8, 8], 1.0)
        );
    }
}
