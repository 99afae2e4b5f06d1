use ndarray::prelude::*;

/// DDIM sampler configured the way Stable Diffusion v1 checkpoints ship:
/// scaled-linear betas, `steps_offset = 1`, and the final step landing on the
/// first training alpha instead of one.
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    step_ratio: usize,
}

impl DdimScheduler {
    pub const TRAIN_TIMESTEPS: usize = 1000;
    const BETA_START: f64 = 0.00085;
    const BETA_END: f64 = 0.012;
    const STEPS_OFFSET: usize = 1;

    pub fn new(inference_steps: usize) -> Self {
        let inference_steps = inference_steps.clamp(1, Self::TRAIN_TIMESTEPS);
        let n = Self::TRAIN_TIMESTEPS;
        let (start, end) = (Self::BETA_START.sqrt(), Self::BETA_END.sqrt());

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut product = 1.0;
        for i in 0..n {
            let beta = (start + (end - start) * i as f64 / (n - 1) as f64).powi(2);
            product *= 1.0 - beta;
            alphas_cumprod.push(product);
        }

        let step_ratio = n / inference_steps;
        let offset = if (inference_steps - 1) * step_ratio + Self::STEPS_OFFSET < n {
            Self::STEPS_OFFSET
        } else {
            0
        };
        let timesteps = (0..inference_steps)
            .rev()
            .map(|i| i * step_ratio + offset)
            .collect();

        Self {
            alphas_cumprod,
            timesteps,
            step_ratio,
        }
    }

    /// Timesteps to denoise at, highest first.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// DDIM starts from unit-variance noise.
    pub const fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    /// Deterministic (eta = 0) update from `timestep` to the previous one.
    pub fn step(
        &self,
        noise_pred: &Array4<f32>,
        timestep: usize,
        sample: &Array4<f32>,
    ) -> Array4<f32> {
        let alpha_t = self.alphas_cumprod[timestep.min(Self::TRAIN_TIMESTEPS - 1)];
        let alpha_prev = timestep
            .checked_sub(self.step_ratio)
            .map_or(self.alphas_cumprod[0], |prev| self.alphas_cumprod[prev]);

        let beta_t = 1.0 - alpha_t;
        let pred_original_scale = (1.0 / alpha_t.sqrt()) as f32;
        let noise_scale = (beta_t.sqrt() / alpha_t.sqrt()) as f32;
        let (a_prev, b_prev) = (alpha_prev.sqrt() as f32, (1.0 - alpha_prev).sqrt() as f32);

        let mut prev = Array4::<f32>::zeros(sample.raw_dim());
        azip!((out in &mut prev, &x in sample, &eps in noise_pred) {
            let pred_original = x * pred_original_scale - eps * noise_scale;
            *out = a_prev * pred_original + b_prev * eps;
        });
        prev
    }
}
