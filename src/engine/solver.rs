//! Multistep exponential-integrator ODE solver (DPM-Solver++ 2M, data
//! prediction).
//!
//! The base noise schedule is the "scaled linear" one used by Stable
//! Diffusion: `sqrt(beta)` is linearly spaced between two endpoints over
//! `T` diffusion timesteps, and the solver works on its cumulative
//! log-signal curve. [`DpmSolver::prepare`] reduces that curve to the
//! requested number of sampling steps; [`DpmSolver::update`] then advances
//! the latent once per step from the denoiser's noise estimate.
//!
//! Coefficients are kept in `f64`; tensors are `f32`.

use tracing::{debug, trace};

use crate::error::DiffusionError;

/// The only step count the schedule is currently validated for.
pub const SUPPORTED_STEPS: usize = 20;

/// Per-step coefficients for a prepared step count. Every array has
/// `steps + 1` entries.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Sampling times, from `1.0` down to `1/T`.
    pub ts: Vec<f64>,
    /// Timestep values fed to the time-embedding stage: `(t - 1/T) * 1000`.
    pub model_ts: Vec<f32>,
    pub lambdas: Vec<f64>,
    pub alphas: Vec<f64>,
    pub sigmas: Vec<f64>,
    /// `expm1(-(lambda[i] - lambda[i-1]))`; `phis[0]` is infinite.
    pub phis: Vec<f64>,
    /// Inverse doubled step-size ratio; `i2rs[0]` and `i2rs[1]` are infinite.
    pub i2rs: Vec<f64>,
}

impl Schedule {
    /// Number of solver steps (one fewer than the number of sampling times).
    pub fn steps(&self) -> usize {
        self.ts.len() - 1
    }
}

/// DPM-Solver++ state: the base schedule, the prepared reduction, and the
/// previous step's data prediction.
#[derive(Debug, Clone)]
pub struct DpmSolver {
    total_timesteps: usize,
    all_t: Vec<f64>,
    all_log_alpha: Vec<f64>,
    schedule: Option<Schedule>,
    prev: Option<Vec<f32>>,
}

/// `n` evenly spaced values from `start` to `end` inclusive.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

fn lerp(x: f64, x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
    (y2 - y1) / (x2 - x1) * (x - x1) + y1
}

impl DpmSolver {
    /// Build the base schedule over `timesteps` diffusion steps with
    /// `beta` running from `beta_start` to `beta_end`.
    pub fn new(timesteps: usize, beta_start: f64, beta_end: f64) -> Result<Self, DiffusionError> {
        if timesteps < 2 {
            return Err(DiffusionError::invalid_argument(
                "solver",
                format!("at least 2 diffusion timesteps are required, got {}", timesteps),
            ));
        }
        if !(0.0 < beta_start && beta_start <= beta_end && beta_end < 1.0) {
            return Err(DiffusionError::invalid_argument(
                "solver",
                format!("invalid beta range [{}, {}]", beta_start, beta_end),
            ));
        }

        let t = timesteps as f64;
        let all_t: Vec<f64> = (1..=timesteps).map(|i| i as f64 / t).collect();

        let mut cumulative = 1.0f64;
        let all_log_alpha = linspace(beta_start.sqrt(), beta_end.sqrt(), timesteps)
            .into_iter()
            .map(|b| {
                cumulative *= 1.0 - b * b;
                0.5 * cumulative.ln()
            })
            .collect();

        debug!(timesteps, beta_start, beta_end, "Built base noise schedule");
        Ok(Self {
            total_timesteps: timesteps,
            all_t,
            all_log_alpha,
            schedule: None,
            prev: None,
        })
    }

    pub fn total_timesteps(&self) -> usize {
        self.total_timesteps
    }

    /// The prepared schedule, if [`prepare`](Self::prepare) has succeeded.
    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    /// Prepared step count, if any.
    pub fn steps(&self) -> Option<usize> {
        self.schedule.as_ref().map(Schedule::steps)
    }

    /// Whether the next update has a previous data prediction to use.
    pub fn has_history(&self) -> bool {
        self.prev.is_some()
    }

    /// Rebuild the reduced schedule for `steps` sampling steps and clear the
    /// previous prediction.
    pub fn prepare(&mut self, steps: usize) -> Result<&Schedule, DiffusionError> {
        if steps != SUPPORTED_STEPS {
            return Err(DiffusionError::invalid_argument(
                "prepare",
                format!(
                    "unsupported step count: {} (only {} is supported)",
                    steps, SUPPORTED_STEPS
                ),
            ));
        }

        let t = self.total_timesteps as f64;
        let ts = linspace(1.0, 1.0 / t, steps + 1);
        let n = ts.len();
        let mut model_ts = Vec::with_capacity(n);
        let mut lambdas: Vec<f64> = Vec::with_capacity(n);
        let mut alphas = Vec::with_capacity(n);
        let mut sigmas = Vec::with_capacity(n);
        let mut phis = Vec::with_capacity(n);
        let mut i2rs = Vec::with_capacity(n);

        // `ts` is decreasing, so one pointer walks the ascending base curve.
        let mut hint = self.all_t.len() - 1;
        for (i, &time) in ts.iter().enumerate() {
            while hint > 1 && self.all_t[hint - 1] > time {
                hint -= 1;
            }
            let la = lerp(
                time,
                self.all_t[hint - 1],
                self.all_log_alpha[hint - 1],
                self.all_t[hint],
                self.all_log_alpha[hint],
            );
            let one_minus = 1.0 - (2.0 * la).exp();
            let lambda = la - 0.5 * one_minus.ln();

            model_ts.push(((time - 1.0 / t) * 1000.0) as f32);
            alphas.push(la.exp());
            sigmas.push(one_minus.sqrt());
            phis.push(if i >= 1 {
                (-(lambda - lambdas[i - 1])).exp_m1()
            } else {
                f64::INFINITY
            });
            i2rs.push(if i >= 2 {
                1.0 / (2.0 * ((lambdas[i - 1] - lambdas[i - 2]) / (lambda - lambdas[i - 1])))
            } else {
                f64::INFINITY
            });
            lambdas.push(lambda);
        }

        debug!(steps, "Solver schedule prepared");
        self.prev = None;
        Ok(self.schedule.insert(Schedule {
            ts,
            model_ts,
            lambdas,
            alphas,
            sigmas,
            phis,
            i2rs,
        }))
    }

    /// Forget the previous data prediction; the next update is first order.
    pub fn reset(&mut self) {
        self.prev = None;
    }

    /// Advance `x` by one step given the noise estimate for `step`.
    ///
    /// `noise` is overwritten with the data-space prediction, which is also
    /// kept for the next step's second-order correction. The first step, or
    /// any step without a previous prediction, is first order.
    pub fn update(&mut self, step: usize, x: &mut [f32], noise: &mut [f32]) -> Result<(), DiffusionError> {
        let s = self.schedule.as_ref().ok_or_else(|| {
            DiffusionError::invalid_argument("update", "solver schedule has not been prepared")
        })?;
        if step + 1 >= s.ts.len() {
            return Err(DiffusionError::invalid_argument(
                "update",
                format!("step {} is outside the prepared schedule of {} steps", step, s.steps()),
            ));
        }
        if x.len() != noise.len() {
            return Err(DiffusionError::invalid_argument(
                "update",
                format!("latent has {} elements, noise estimate has {}", x.len(), noise.len()),
            ));
        }

        let (sigma, alpha) = (s.sigmas[step], s.alphas[step]);
        for (n, &xv) in noise.iter_mut().zip(x.iter()) {
            *n = ((xv as f64 - sigma * *n as f64) / alpha) as f32;
        }

        let ratio = s.sigmas[step + 1] / sigma;
        let a_phi = s.alphas[step + 1] * s.phis[step + 1];
        match self.prev.as_deref() {
            Some(prev) if step > 0 => {
                if prev.len() != x.len() {
                    return Err(DiffusionError::internal(
                        "update",
                        format!("previous prediction has {} elements, latent has {}", prev.len(), x.len()),
                    ));
                }
                let i2r = s.i2rs[step + 1];
                trace!(step, order = 2, "Solver update");
                for ((xv, &d), &p) in x.iter_mut().zip(noise.iter()).zip(prev) {
                    *xv = (*xv as f64 * ratio + a_phi * i2r * p as f64
                        - a_phi * (1.0 + i2r) * d as f64) as f32;
                }
            }
            _ => {
                trace!(step, order = 1, "Solver update");
                for (xv, &d) in x.iter_mut().zip(noise.iter()) {
                    *xv = (*xv as f64 * ratio - a_phi * d as f64) as f32;
                }
            }
        }

        match &mut self.prev {
            Some(prev) if prev.len() == noise.len() => prev.copy_from_slice(noise),
            _ => self.prev = Some(noise.to_vec()),
        }
        Ok(())
    }
}
