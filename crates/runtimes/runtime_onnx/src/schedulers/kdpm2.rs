//! KDPM2 solver: two-evaluation midpoint stepping.
//!
//! Consecutive `step` calls alternate between a first-order probe toward the
//! log-space midpoint sigma and the completing second-order update; the probe
//! state is cached in between.

use ndarray::Array4;

use diffusionkit_core::{Result, SchedulerOptions};

use super::{euler, Scheduler, SchedulerCommon, StepResult};

pub struct Kdpm2Scheduler {
    common: SchedulerCommon,
    sigmas: Vec<f32>,
    /// Log-space midpoint of the two-interval span each call pair covers.
    sigmas_interpol: Vec<f32>,
    init_noise_sigma: f32,
    /// Pre-probe sample and its schedule index, cached across the call pair.
    first_order: Option<(Array4<f32>, usize)>,
}

impl Kdpm2Scheduler {
    pub fn new(options: &SchedulerOptions) -> Self {
        let common = SchedulerCommon::new(options);
        let sigmas = common.step_sigmas();
        // A call pair probes from sigmas[i] and completes at sigmas[i + 2],
        // so the midpoint spans two listed intervals. The trailing unpaired
        // probe (odd step counts) degenerates to a plain step toward zero.
        let last = sigmas.len() - 1;
        let sigmas_interpol: Vec<f32> = (0..last)
            .map(|i| (sigmas[i] * sigmas[(i + 2).min(last)]).max(0.0).sqrt())
            .collect();
        let init_noise_sigma = euler::init_sigma(options, &sigmas);
        Self { common, sigmas, sigmas_interpol, init_noise_sigma, first_order: None }
    }

    /// The sigma level the pair completes at: two intervals past the probe.
    fn completion_sigma(&self, probe_index: usize) -> f32 {
        self.sigmas[(probe_index + 2).min(self.sigmas.len() - 1)]
    }

    /// Sigma the UNet input should be conditioned on for this call.
    fn input_sigma(&self, index: usize) -> f32 {
        match &self.first_order {
            Some((_, probe_index)) if index == probe_index + 1 => self.sigmas_interpol[*probe_index],
            _ => self.sigmas[index],
        }
    }
}

impl Scheduler for Kdpm2Scheduler {
    fn timesteps(&self) -> &[i64] {
        &self.common.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        self.init_noise_sigma
    }

    fn scale_input(&mut self, latent: Array4<f32>, timestep: i64) -> Array4<f32> {
        let sigma = match self.common.index_of(timestep) {
            Ok(index) => self.input_sigma(index),
            Err(_) => self.common.sigma(timestep),
        };
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

        match self.first_order.take() {
            Some((sample, probe_index)) if index == probe_index + 1 => {
                // Second order: evaluate at the midpoint, step the cached
                // sample across both intervals of the pair.
                let sigma_interpol = self.sigmas_interpol[probe_index];
                let pred_original =
                    self.common.pred_original_sigma(&latent, noise_pred, sigma_interpol);
                let derivative = if sigma_interpol > 0.0 {
                    (&latent - &pred_original).mapv(|v| v / sigma_interpol)
                } else {
                    Array4::zeros(latent.dim())
                };
                let dt = self.completion_sigma(probe_index) - self.sigmas[probe_index];
                let prev_sample = &sample + &derivative.mapv(|v| v * dt);
                Ok(StepResult { prev_sample, pred_original_sample: Some(pred_original) })
            }
            _ => {
                // First order: probe toward the midpoint and cache the sample.
                let sigma = self.sigmas[index];
                let sigma_interpol = self.sigmas_interpol[index];
                let pred_original = self.common.pred_original_sigma(&latent, noise_pred, sigma);
                let derivative = (&latent - &pred_original).mapv(|v| v / sigma);
                let dt = sigma_interpol - sigma;
                let prev_sample = &latent + &derivative.mapv(|v| v * dt);
                self.first_order = Some((latent, index));
                Ok(StepResult { prev_sample, pred_original_sample: Some(pred_original) })
            }
        }
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

    fn scheduler(steps: usize) -> Kdpm2Scheduler {
        Kdpm2Scheduler::new(&SchedulerOptions {
            scheduler_type: SchedulerType::Kdpm2,
            inference_steps: steps,
            seed: 42,
            ..Default::default()
        })
    }

    #[test]
    fn midpoints_sit_inside_their_span() {
        let sched = scheduler(10);
        let last = sched.sigmas.len() - 1;
        for i in 0..last {
            let m = sched.sigmas_interpol[i];
            let lo = sched.sigmas[(i + 2).min(last)];
            assert!(m <= sched.sigmas[i] && m >= lo, "midpoint {i}");
        }
    }

    #[test]
    fn call_pair_completes_two_intervals() {
        let mut sched = scheduler(10);
        let timesteps = sched.timesteps().to_vec();
        let noise_pred = Array4::from_elem((1, 4, 8, 8), 0.0);
        let latent = Array4::from_elem((1, 4, 8, 8), 1.0);

        // With a zero noise prediction (epsilon), pred_original == sample, so
        // every derivative is zero and the latent passes through unchanged;
        // the pair must still consume exactly two timesteps.
        let probe = sched.step(&noise_pred, timesteps[0], latent.clone()).unwrap();
        let done = sched.step(&noise_pred, timesteps[1], probe.prev_sample).unwrap();
        assert_eq!(done.prev_sample, latent);
        assert!(sched.first_order.is_none());
    }

    #[test]
    fn step_pair_alternates_orders() {
        let mut sched = scheduler(10);
        let timesteps = sched.timesteps().to_vec();
        let noise_pred = Array4::from_elem((1, 4, 8, 8), 0.1);
        let latent = Array4::from_elem((1, 4, 8, 8), 1.0);

        assert!(sched.first_order.is_none());
        let probe = sched.step(&noise_pred, timesteps[0], latent).unwrap();
        assert!(sched.first_order.is_some());
        let _ = sched.step(&noise_pred, timesteps[1], probe.prev_sample).unwrap();
        assert!(sched.first_order.is_none());
    }

    #[test]
    fn probe_scale_uses_midpoint_sigma() {
        let mut sched = scheduler(10);
        let timesteps = sched.timesteps().to_vec();
        let noise_pred = Array4::from_elem((1, 4, 8, 8), 0.1);
        let latent = Array4::from_elem((1, 4, 8, 8), 1.0);
        let probe = sched.step(&noise_pred, timesteps[0], latent).unwrap();

        let scaled = sched.scale_input(probe.prev_sample.clone(), timesteps[1]);
        let m = sched.sigmas_interpol[0];
        let expected = probe.prev_sample[[0, 0, 0, 0]] / (m * m + 1.0).sqrt();
        assert!((scaled[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn timestep_list_length_matches_inference_steps() {
        let sched = scheduler(30);
        assert_eq!(sched.timesteps().len(), 30);
    }
}
