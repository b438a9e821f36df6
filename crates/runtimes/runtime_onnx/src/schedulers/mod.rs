//! Discrete reverse-diffusion solvers.
//!
//! Every scheduler is created fresh per generation from the run's
//! `SchedulerOptions`, owns its timestep schedule and solver state, and is
//! dropped when the generation ends. All variants share the precomputed beta
//! table and cumulative alpha products; they differ in how one denoising step
//! turns a noise prediction into the previous latent.

mod ddim;
mod ddpm;
mod euler;
mod euler_ancestral;
mod kdpm2;
mod lms;

pub use ddim::DdimScheduler;
pub use ddpm::DdpmScheduler;
pub use euler::EulerScheduler;
pub use euler_ancestral::EulerAncestralScheduler;
pub use kdpm2::Kdpm2Scheduler;
pub use lms::LmsScheduler;

use ndarray::Array4;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use diffusionkit_core::{
    BetaSchedule, DiffusionError, PredictionType, Result, SchedulerOptions, SchedulerType,
    TimestepSpacing,
};

/// Output of one solver step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub prev_sample: Array4<f32>,
    /// The solver's estimate of the fully denoised latent, when it computes one.
    pub pred_original_sample: Option<Array4<f32>>,
}

/// The contract every solver implements.
pub trait Scheduler: Send {
    /// Strictly descending integer timestep indices, one per inference step.
    fn timesteps(&self) -> &[i64];

    /// Standard deviation the initial gaussian latent is scaled by.
    fn init_noise_sigma(&self) -> f32;

    /// Rescales a UNet input latent for the given timestep.
    fn scale_input(&mut self, latent: Array4<f32>, timestep: i64) -> Array4<f32>;

    /// Advances the latent one step against the noise prediction.
    fn step(&mut self, noise_pred: &Array4<f32>, timestep: i64, latent: Array4<f32>)
        -> Result<StepResult>;

    /// Draws a seeded gaussian sample scaled by `sigma`.
    fn create_random_sample(&mut self, shape: [usize; 4], sigma: f32) -> Array4<f32>;

    /// Noises a clean latent to the level of `timestep` (image-to-image start).
    fn add_noise(&mut self, clean: &Array4<f32>, noise: &Array4<f32>, timestep: i64)
        -> Array4<f32>;
}

/// Builds the solver selected by `options.scheduler_type`.
pub fn create_scheduler(options: &SchedulerOptions) -> Box<dyn Scheduler> {
    match options.scheduler_type {
        SchedulerType::Lms => Box::new(LmsScheduler::new(options)),
        SchedulerType::Euler => Box::new(EulerScheduler::new(options)),
        SchedulerType::EulerAncestral => Box::new(EulerAncestralScheduler::new(options)),
        SchedulerType::Ddpm => Box::new(DdpmScheduler::new(options)),
        SchedulerType::Ddim => Box::new(DdimScheduler::new(options)),
        SchedulerType::Kdpm2 => Box::new(Kdpm2Scheduler::new(options)),
    }
}

/// State shared by every solver: beta table, cumulative alphas, the spaced
/// timestep schedule, and the seeded noise source.
pub(crate) struct SchedulerCommon {
    pub options: SchedulerOptions,
    pub alphas_cumprod: Vec<f32>,
    pub timesteps: Vec<i64>,
    rng: ChaCha8Rng,
}

impl SchedulerCommon {
    pub fn new(options: &SchedulerOptions) -> Self {
        let betas = beta_table(options);
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumprod = 1.0f32;
        for beta in &betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }
        let timesteps = spaced_timesteps(options);
        Self {
            options: options.clone(),
            alphas_cumprod,
            timesteps,
            rng: ChaCha8Rng::seed_from_u64(options.seed),
        }
    }

    /// Position of `timestep` within the schedule.
    pub fn index_of(&self, timestep: i64) -> Result<usize> {
        self.timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or_else(|| DiffusionError::InvalidOptions(format!("timestep {timestep} is not in the schedule")))
    }

    pub fn alpha_cumprod(&self, timestep: i64) -> f32 {
        self.alphas_cumprod[timestep.clamp(0, self.alphas_cumprod.len() as i64 - 1) as usize]
    }

    /// Noise sigma of one train timestep: `sqrt((1 - acp) / acp)`.
    pub fn sigma(&self, timestep: i64) -> f32 {
        let acp = self.alpha_cumprod(timestep);
        ((1.0 - acp) / acp).sqrt()
    }

    /// Sigma of each scheduled timestep, descending, with a trailing 0.
    pub fn step_sigmas(&self) -> Vec<f32> {
        let mut sigmas: Vec<f32> = self.timesteps.iter().map(|&t| self.sigma(t)).collect();
        sigmas.push(0.0);
        sigmas
    }

    pub fn randn(&mut self, shape: [usize; 4]) -> Array4<f32> {
        let len = shape.iter().product();
        let data: Vec<f32> = (0..len).map(|_| StandardNormal.sample(&mut self.rng)).collect();
        Array4::from_shape_vec(shape, data).expect("shape product matches data length")
    }

    /// Variance-preserving forward noising: `sqrt(acp)*clean + sqrt(1-acp)*noise`.
    pub fn add_noise_alpha(&self, clean: &Array4<f32>, noise: &Array4<f32>, timestep: i64) -> Array4<f32> {
        let acp = self.alpha_cumprod(timestep);
        let sqrt_acp = acp.sqrt();
        let sqrt_one_minus = (1.0 - acp).sqrt();
        clean.mapv(|v| v * sqrt_acp) + noise.mapv(|v| v * sqrt_one_minus)
    }

    /// Sigma-space forward noising: `clean + noise * sigma(t)`.
    pub fn add_noise_sigma(&self, clean: &Array4<f32>, noise: &Array4<f32>, timestep: i64) -> Array4<f32> {
        let sigma = self.sigma(timestep);
        clean + &noise.mapv(|v| v * sigma)
    }

    /// The solver's estimate of the clean latent in alpha space.
    pub fn pred_original_alpha(
        &self,
        sample: &Array4<f32>,
        model_output: &Array4<f32>,
        timestep: i64,
    ) -> Array4<f32> {
        let acp = self.alpha_cumprod(timestep);
        let beta_prod = 1.0 - acp;
        match self.options.prediction_type {
            PredictionType::Epsilon => {
                (sample - &model_output.mapv(|v| v * beta_prod.sqrt())).mapv(|v| v / acp.sqrt())
            }
            PredictionType::VPrediction => {
                sample.mapv(|v| v * acp.sqrt()) - model_output.mapv(|v| v * beta_prod.sqrt())
            }
            PredictionType::Sample => model_output.clone(),
        }
    }

    /// The solver's estimate of the clean latent in sigma space.
    pub fn pred_original_sigma(
        &self,
        sample: &Array4<f32>,
        model_output: &Array4<f32>,
        sigma: f32,
    ) -> Array4<f32> {
        match self.options.prediction_type {
            PredictionType::Epsilon => sample - &model_output.mapv(|v| v * sigma),
            PredictionType::VPrediction => {
                let denom = sigma * sigma + 1.0;
                model_output.mapv(|v| v * (-sigma / denom.sqrt())) + sample.mapv(|v| v / denom)
            }
            PredictionType::Sample => model_output.clone(),
        }
    }
}

/// Beta table per `beta_schedule`, or the trained table verbatim.
fn beta_table(options: &SchedulerOptions) -> Vec<f32> {
    if let Some(trained) = &options.trained_betas {
        return trained.clone();
    }
    let n = options.train_timesteps;
    match options.beta_schedule {
        BetaSchedule::Linear => linspace(options.beta_start, options.beta_end, n),
        BetaSchedule::ScaledLinear => linspace(options.beta_start.sqrt(), options.beta_end.sqrt(), n)
            .into_iter()
            .map(|v| v * v)
            .collect(),
        BetaSchedule::SquaredCosCapV2 => {
            let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
            (0..n)
                .map(|i| {
                    let t1 = i as f64 / n as f64;
                    let t2 = (i + 1) as f64 / n as f64;
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999) as f32
                })
                .collect()
        }
    }
}

fn linspace(start: f32, end: f32, n: usize) -> Vec<f32> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) as f64 / (n - 1) as f64;
    (0..n).map(|i| (start as f64 + step * i as f64) as f32).collect()
}

/// Integer timestep schedule, descending, per `timestep_spacing`.
fn spaced_timesteps(options: &SchedulerOptions) -> Vec<i64> {
    let train = options.train_timesteps as i64;
    let steps = options.inference_steps;
    let mut timesteps: Vec<i64> = match options.timestep_spacing {
        TimestepSpacing::Linspace => {
            if steps == 1 {
                vec![0]
            } else {
                let stride = (train - 1) as f64 / (steps - 1) as f64;
                (0..steps).map(|i| (stride * i as f64).round() as i64).collect()
            }
        }
        TimestepSpacing::Leading => {
            let step_ratio = train / steps as i64;
            (0..steps)
                .map(|i| i as i64 * step_ratio + options.steps_offset as i64)
                .collect()
        }
        TimestepSpacing::Trailing => {
            let step_ratio = train as f64 / steps as f64;
            let mut ts: Vec<i64> = (1..=steps)
                .map(|i| (i as f64 * step_ratio).round() as i64 - 1)
                .collect();
            ts.dedup();
            ts
        }
    };
    timesteps.sort_unstable();
    timesteps.reverse();
    timesteps
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffusionkit_core::SchedulerOptions;

    fn options(scheduler: SchedulerType, steps: usize, seed: u64) -> SchedulerOptions {
        SchedulerOptions {
            scheduler_type: scheduler,
            inference_steps: steps,
            seed,
            ..Default::default()
        }
    }

    #[test]
    fn beta_table_scaled_linear_endpoints() {
        let opts = SchedulerOptions::default();
        let betas = beta_table(&opts);
        assert_eq!(betas.len(), 1000);
        assert!((betas[0] - 0.00085).abs() < 1e-7);
        assert!((betas[999] - 0.012).abs() < 1e-6);
    }

    #[test]
    fn beta_table_squaredcos_is_capped() {
        let opts = SchedulerOptions {
            beta_schedule: BetaSchedule::SquaredCosCapV2,
            ..Default::default()
        };
        let betas = beta_table(&opts);
        assert!(betas.iter().all(|&b| b > 0.0 && b <= 0.999));
    }

    #[test]
    fn trained_betas_pass_through() {
        let opts = SchedulerOptions {
            trained_betas: Some(vec![0.1, 0.2, 0.3]),
            ..Default::default()
        };
        assert_eq!(beta_table(&opts), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn linspace_timesteps_are_descending_and_exact() {
        let opts = options(SchedulerType::Lms, 30, 42);
        let ts = spaced_timesteps(&opts);
        assert_eq!(ts.len(), 30);
        assert_eq!(ts[0], 999);
        assert_eq!(ts[29], 0);
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn leading_timesteps_apply_offset() {
        let opts = SchedulerOptions {
            timestep_spacing: TimestepSpacing::Leading,
            inference_steps: 10,
            steps_offset: 1,
            ..Default::default()
        };
        let ts = spaced_timesteps(&opts);
        assert_eq!(ts.len(), 10);
        assert_eq!(ts[9], 1);
        assert_eq!(ts[0], 901);
    }

    #[test]
    fn trailing_timesteps_end_at_last_train_step() {
        let opts = SchedulerOptions {
            timestep_spacing: TimestepSpacing::Trailing,
            inference_steps: 10,
            ..Default::default()
        };
        let ts = spaced_timesteps(&opts);
        assert_eq!(ts[0], 999);
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn single_step_schedule() {
        let opts = options(SchedulerType::Euler, 1, 7);
        let ts = spaced_timesteps(&opts);
        assert_eq!(ts, vec![0]);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let opts = options(SchedulerType::Euler, 10, 42);
        let mut a = SchedulerCommon::new(&opts);
        let mut b = SchedulerCommon::new(&opts);
        assert_eq!(a.randn([1, 4, 8, 8]), b.randn([1, 4, 8, 8]));
    }

    #[test]
    fn different_seeds_sample_differently() {
        let mut a = SchedulerCommon::new(&options(SchedulerType::Euler, 10, 42));
        let mut b = SchedulerCommon::new(&options(SchedulerType::Euler, 10, 43));
        assert_ne!(a.randn([1, 4, 8, 8]), b.randn([1, 4, 8, 8]));
    }

    #[test]
    fn alphas_cumprod_monotone_decreasing() {
        let common = SchedulerCommon::new(&SchedulerOptions::default());
        assert!(common.alphas_cumprod.windows(2).all(|w| w[0] > w[1]));
        assert!(common.alphas_cumprod[0] < 1.0);
        assert!(common.alphas_cumprod[999] > 0.0);
    }

    #[test]
    fn sigma_grows_with_timestep() {
        let common = SchedulerCommon::new(&SchedulerOptions::default());
        assert!(common.sigma(999) > common.sigma(500));
        assert!(common.sigma(500) > common.sigma(0));
    }

    #[test]
    fn every_scheduler_satisfies_descending_exact_length() {
        for scheduler in [
            SchedulerType::Lms,
            SchedulerType::Euler,
            SchedulerType::EulerAncestral,
            SchedulerType::Ddpm,
            SchedulerType::Ddim,
            SchedulerType::Kdpm2,
        ] {
            let sched = create_scheduler(&options(scheduler, 20, 42));
            let ts = sched.timesteps();
            assert_eq!(ts.len(), 20, "{scheduler:?}");
            assert!(ts.windows(2).all(|w| w[0] > w[1]), "{scheduler:?}");
        }
    }
}
