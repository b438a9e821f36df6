//! Batch generation: expands one scheduler config into an ordered list with
//! exactly one field varied.

use rand::Rng;

use diffusionkit_core::{BatchOptionType, BatchOptions, SchedulerOptions};

/// Produces the per-entry scheduler configs for a batch run, in order.
pub fn generate_batch(options: &SchedulerOptions, batch: &BatchOptions) -> Vec<SchedulerOptions> {
    match batch.batch_type {
        BatchOptionType::Seed => {
            let mut rng = rand::thread_rng();
            (0..batch.count.max(1))
                .map(|_| {
                    let mut seed: u64 = rng.gen();
                    while seed == 0 {
                        seed = rng.gen();
                    }
                    SchedulerOptions { seed, ..options.clone() }
                })
                .collect()
        }
        BatchOptionType::Step => {
            let from = batch.value_from as usize;
            let to = batch.value_to as usize;
            let count = to.saturating_sub(from).max(1);
            (0..count)
                .map(|i| SchedulerOptions { inference_steps: (from + i).max(1), ..options.clone() })
                .collect()
        }
        BatchOptionType::Guidance => enumerate_range(batch)
            .into_iter()
            .map(|value| SchedulerOptions { guidance_scale: value, ..options.clone() })
            .collect(),
        BatchOptionType::Strength => enumerate_range(batch)
            .into_iter()
            .map(|value| SchedulerOptions { strength: value, ..options.clone() })
            .collect(),
    }
}

/// `max(1, ceil((to - from) / increment))` values stepping by `increment`.
fn enumerate_range(batch: &BatchOptions) -> Vec<f32> {
    let span = batch.value_to - batch.value_from;
    let count = if batch.increment > 0.0 && span > 0.0 {
        ((span / batch.increment).ceil() as usize).max(1)
    } else {
        1
    };
    (0..count).map(|i| batch.value_from + batch.increment * i as f32).collect()
}
