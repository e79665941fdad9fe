//! DPM-Solver++ multistep scheduler
//!
//! Works on sigma-scaled latents in the k-diffusion formulation: the model
//! input is `x / sqrt(sigma² + 1)` and the UNet predicts epsilon. With
//! Karras sigmas and `solver_order = 2` this is the "DPM++ 2M Karras"
//! sampler.

use anyhow::Result;
use candle_core::Tensor;

/// SD 1.x training noise schedule
const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;
const KARRAS_RHO: f64 = 7.0;

/// Sigmas of the scaled-linear training schedule, ascending with the timestep
pub fn training_sigmas() -> Vec<f64> {
    let (start, end) = (BETA_START.sqrt(), BETA_END.sqrt());
    let last = (TRAIN_TIMESTEPS - 1) as f64;
    let mut alpha_cumprod = 1.0;
    (0..TRAIN_TIMESTEPS)
        .map(|i| {
            let beta = (start + (end - start) * i as f64 / last).powi(2);
            alpha_cumprod *= 1.0 - beta;
            ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
        })
        .collect()
}

/// Noise levels from `sigma_max` down to `sigma_min`, spaced per Karras et al. (2022)
pub fn karras_sigmas(sigma_min: f64, sigma_max: f64, steps: usize) -> Vec<f64> {
    let min_inv_rho = sigma_min.powf(1.0 / KARRAS_RHO);
    let max_inv_rho = sigma_max.powf(1.0 / KARRAS_RHO);
    let denom = steps.saturating_sub(1).max(1) as f64;
    (0..steps)
        .map(|i| {
            let ramp = i as f64 / denom;
            (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(KARRAS_RHO)
        })
        .collect()
}

/// Fractional training timestep whose sigma matches `sigma`, by log-linear interpolation
fn sigma_to_timestep(sigma: f64, train_sigmas: &[f64]) -> f64 {
    let log_sigma = sigma.ln();
    let last = train_sigmas.len() - 1;
    let low = train_sigmas
        .iter()
        .rposition(|s| s.ln() <= log_sigma)
        .unwrap_or(0)
        .min(last - 1);
    let (low_log, high_log) = (train_sigmas[low].ln(), train_sigmas[low + 1].ln());
    let w = ((low_log - log_sigma) / (low_log - high_log)).clamp(0.0, 1.0);
    (1.0 - w) * low as f64 + w * (low + 1) as f64
}

/// Interpolated sigma at a fractional training timestep
fn timestep_to_sigma(timestep: f64, train_sigmas: &[f64]) -> f64 {
    let low = (timestep.floor() as usize).min(train_sigmas.len() - 1);
    let high = (low + 1).min(train_sigmas.len() - 1);
    let w = timestep - low as f64;
    (1.0 - w) * train_sigmas[low] + w * train_sigmas[high]
}

pub struct DpmSolverMultistep {
    timesteps: Vec<f64>,
    /// One sigma per timestep followed by a final 0.0
    sigmas: Vec<f64>,
    solver_order: usize,
    previous_denoised: Option<Tensor>,
}

impl DpmSolverMultistep {
    pub fn new(steps: usize, solver_order: usize, use_karras: bool) -> Result<Self> {
        if steps == 0 {
            anyhow::bail!("the scheduler needs at least one step");
        }
        if !(1..=2).contains(&solver_order) {
            anyhow::bail!("unsupported solver order {}", solver_order);
        }

        let train_sigmas = training_sigmas();
        let (timesteps, mut sigmas): (Vec<f64>, Vec<f64>) = if use_karras {
            let sigma_min = train_sigmas[0];
            let sigma_max = train_sigmas[TRAIN_TIMESTEPS - 1];
            karras_sigmas(sigma_min, sigma_max, steps)
                .into_iter()
                .map(|sigma| (sigma_to_timestep(sigma, &train_sigmas).round(), sigma))
                .unzip()
        } else {
            let last = (TRAIN_TIMESTEPS - 1) as f64;
            let denom = steps.saturating_sub(1).max(1) as f64;
            (0..steps)
                .map(|i| {
                    let t = last * (1.0 - i as f64 / denom);
                    (t.round(), timestep_to_sigma(t, &train_sigmas))
                })
                .unzip()
        };
        sigmas.push(0.0);

        Ok(Self {
            timesteps,
            sigmas,
            solver_order,
            previous_denoised: None,
        })
    }

    /// Timesteps to condition the UNet on, one per step
    pub fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Scale applied to unit-variance noise to get the initial latents
    pub fn init_noise_sigma(&self) -> f64 {
        self.sigmas[0]
    }

    pub fn scale_model_input(&self, sample: Tensor, step: usize) -> Result<Tensor> {
        let sigma = self.sigma(step)?;
        Ok((sample / (sigma.powi(2) + 1.0).sqrt())?)
    }

    /// Advance `sample` from step `step` to the next noise level
    pub fn step(&mut self, step: usize, noise_pred: &Tensor, sample: &Tensor) -> Result<Tensor> {
        let sigma = self.sigma(step)?;
        let sigma_next = self.sigmas[step + 1];
        let denoised = (sample - (noise_pred * sigma)?)?;

        let previous = self.previous_denoised.replace(denoised.clone());
        if sigma_next == 0.0 {
            return Ok(denoised);
        }

        let h = sigma.ln() - sigma_next.ln();
        let target = match previous {
            Some(previous) if self.solver_order == 2 && step > 0 => {
                let h_last = self.sigmas[step - 1].ln() - sigma.ln();
                let r = h_last / h;
                let c = 1.0 / (2.0 * r);
                ((&denoised * (1.0 + c))? - (previous * c)?)?
            }
            _ => denoised,
        };

        Ok(((sample * (sigma_next / sigma))? - (target * (-h).exp_m1())?)?)
    }

    fn sigma(&self, step: usize) -> Result<f64> {
        if step >= self.timesteps.len() {
            anyhow::bail!(
                "step {} is out of the {} step schedule",
                step,
                self.timesteps.len()
            );
        }
        Ok(self.sigmas[step])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn training_sigmas_match_sd_schedule() {
        let sigmas = training_sigmas();
        assert_eq!(sigmas.len(), 1000);
        assert!((sigmas[0] - 0.0292).abs() < 1e-3, "{}", sigmas[0]);
        assert!((sigmas[999] - 14.6146).abs() < 1e-2, "{}", sigmas[999]);
        assert!(sigmas.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn karras_schedule_spans_training_range() {
        let scheduler = DpmSolverMultistep::new(20, 2, true).unwrap();
        let sigmas = scheduler.sigmas();
        let train = training_sigmas();

        assert_eq!(scheduler.timesteps().len(), 20);
        assert_eq!(sigmas.len(), 21);
        assert!((sigmas[0] - train[999]).abs() < 1e-9);
        assert!((sigmas[19] - train[0]).abs() < 1e-9);
        assert_eq!(sigmas[20], 0.0);
        assert!(sigmas.windows(2).all(|w| w[0] > w[1]));

        let timesteps = scheduler.timesteps();
        assert_eq!(timesteps[0], 999.0);
        assert_eq!(timesteps[19], 0.0);
        assert!(timesteps.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(scheduler.init_noise_sigma(), sigmas[0]);
    }

    #[test]
    fn linear_schedule_runs_from_last_timestep_to_zero() {
        let scheduler = DpmSolverMultistep::new(10, 2, false).unwrap();
        assert_eq!(scheduler.timesteps()[0], 999.0);
        assert_eq!(scheduler.timesteps()[9], 0.0);
        assert_eq!(scheduler.sigmas().len(), 11);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        assert!(DpmSolverMultistep::new(0, 2, true).is_err());
        assert!(DpmSolverMultistep::new(20, 3, true).is_err());
    }

    #[test]
    fn zero_noise_prediction_keeps_sample() {
        let mut scheduler = DpmSolverMultistep::new(5, 2, true).unwrap();
        let sample = Tensor::new(&[1.5f32, -0.5, 2.0], &Device::Cpu).unwrap();
        let zero = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();

        let mut x = sample.clone();
        for step in 0..5 {
            x = scheduler.step(step, &zero, &x).unwrap();
        }
        for (a, b) in values(&x).iter().zip(values(&sample)) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn final_step_returns_denoised_sample() {
        let mut scheduler = DpmSolverMultistep::new(1, 2, true).unwrap();
        let sigma = scheduler.sigmas()[0];
        let sample = Tensor::new(&[3.0f32, 1.0], &Device::Cpu).unwrap();
        let noise = Tensor::new(&[0.1f32, -0.2], &Device::Cpu).unwrap();

        let x = scheduler.step(0, &noise, &sample).unwrap();
        let expected = [3.0 - 0.1 * sigma, 1.0 + 0.2 * sigma];
        for (a, b) in values(&x).iter().zip(expected) {
            assert!((*a as f64 - b).abs() < 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn model_input_is_scaled_by_sigma() {
        let scheduler = DpmSolverMultistep::new(20, 2, true).unwrap();
        let sigma = scheduler.sigmas()[3];
        let input = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        let scaled = values(&scheduler.scale_model_input(input, 3).unwrap());
        let expected = 1.0 / (sigma * sigma + 1.0).sqrt();
        assert!((scaled[0] as f64 - expected).abs() < 1e-6);

        let past_end = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        assert!(scheduler.scale_model_input(past_end, 20).is_err());
    }
}
