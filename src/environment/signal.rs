//! Declared observation laws.
//!
//! A [`SignalModel`] is the public part of an environment: the distribution
//! of signals and outcomes conditional on each latent state. Agents receive a
//! copy at creation and use it to score how well their belief predicts what
//! they observe next. The realized latent state is never part of it.

use nalgebra::DVector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Observation, Outcome, PrivateSignal};

/// Floor on per-state log-likelihoods relative to the best state.
const LOG_LIKELIHOOD_FLOOR: f64 = -30.0;

/// Conditional law of observations given the latent state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case", tag = "kind"))]
pub enum SignalModel {
    /// Private signal equals the state with probability `accuracy`, otherwise
    /// one of the other states uniformly.
    Discrete { num_states: usize, accuracy: f64 },
    /// Brownian payoffs with drift plus Poisson jumps, and a public
    /// background signal.
    Experimentation {
        drift_rates: Vec<f64>,
        jump_rates: Vec<f64>,
        jump_sizes: Vec<f64>,
        diffusion_sigma: f64,
        background_informativeness: f64,
        time_step: f64,
    },
}

impl SignalModel {
    pub fn num_states(&self) -> usize {
        match self {
            SignalModel::Discrete { num_states, .. } => *num_states,
            SignalModel::Experimentation { drift_rates, .. } => drift_rates.len(),
        }
    }

    /// Probability that a discrete signal points at a specific wrong state.
    pub fn off_signal_probability(&self) -> Option<f64> {
        match self {
            SignalModel::Discrete {
                num_states,
                accuracy,
            } if *num_states > 1 => Some((1.0 - accuracy) / (*num_states - 1) as f64),
            _ => None,
        }
    }

    /// Smallest KL divergence, per step, between the private-signal laws of
    /// two distinct states.
    ///
    /// For the experimentation game the private signal is the background
    /// plus the agent's own outcome at full allocation. Pairs separated
    /// perfectly (infinite divergence) are skipped; `None` when no pair is
    /// left.
    pub fn min_divergence(&self) -> Option<f64> {
        let n = self.num_states();
        let mut best: Option<f64> = None;
        for a in 0..n {
            for b in (0..n).filter(|b| *b != a) {
                let kl = self.divergence(a, b);
                if kl.is_finite() {
                    best = Some(best.map_or(kl, |m| m.min(kl)));
                }
            }
        }
        best
    }

    /// KL divergence from the signal law of state `b` to that of state `a`.
    fn divergence(&self, a: usize, b: usize) -> f64 {
        match self {
            SignalModel::Discrete {
                num_states,
                accuracy,
            } => {
                let off = (1.0 - accuracy) / (*num_states - 1) as f64;
                if off <= 0.0 {
                    return f64::INFINITY;
                }
                (accuracy - off) * (accuracy / off).ln()
            }
            SignalModel::Experimentation {
                drift_rates,
                jump_rates,
                diffusion_sigma,
                background_informativeness,
                time_step,
                ..
            } => {
                let dt = *time_step;
                let gap = drift_rates[a] - drift_rates[b];
                let variance = (diffusion_sigma * diffusion_sigma).max(1e-12);
                let background = (background_informativeness * gap).powi(2) * dt / (2.0 * variance);
                let own = gap * gap * dt / (2.0 * variance);
                background + own + poisson_divergence(jump_rates[a] * dt, jump_rates[b] * dt)
            }
        }
    }

    /// Log-likelihood of `obs` under each state.
    pub fn log_likelihood(&self, obs: &Observation) -> DVector<f64> {
        let n = self.num_states();
        match (self, &obs.signal) {
            (
                SignalModel::Discrete {
                    num_states,
                    accuracy,
                },
                PrivateSignal::State(signal),
            ) => {
                let off = if *num_states > 1 {
                    (1.0 - accuracy) / (*num_states - 1) as f64
                } else {
                    1.0
                };
                DVector::from_fn(n, |s, _| {
                    if s == *signal {
                        accuracy.ln()
                    } else {
                        off.ln()
                    }
                })
            }
            (
                SignalModel::Experimentation {
                    drift_rates,
                    jump_rates,
                    diffusion_sigma,
                    background_informativeness,
                    time_step,
                    ..
                },
                PrivateSignal::Experiment { background, own },
            ) => {
                let dt = *time_step;
                let sigma = *diffusion_sigma;
                DVector::from_fn(n, |s, _| {
                    let mut ll = gaussian_log_density(
                        *background,
                        background_informativeness * drift_rates[s] * dt,
                        sigma * sigma * dt,
                    );
                    let outcomes = std::iter::once(own)
                        .chain(obs.neighbors.iter().filter_map(|nb| nb.outcome.as_ref()));
                    for outcome in outcomes {
                        ll += outcome_log_likelihood(
                            outcome,
                            drift_rates[s],
                            jump_rates[s],
                            sigma,
                            dt,
                        );
                    }
                    ll
                })
            }
            _ => DVector::zeros(n),
        }
    }

    /// Likelihood of `obs` under each state, scaled so the largest entry is 1.
    pub fn likelihood(&self, obs: &Observation) -> DVector<f64> {
        let ll = self.log_likelihood(obs);
        if ll.is_empty() {
            return ll;
        }
        let max = ll.max();
        if !max.is_finite() {
            return DVector::from_element(ll.len(), 1.0);
        }
        ll.map(|x| (x - max).max(LOG_LIKELIHOOD_FLOOR).exp())
    }
}

fn gaussian_log_density(x: f64, mean: f64, variance: f64) -> f64 {
    let var = variance.max(1e-12);
    -0.5 * ((x - mean).powi(2) / var + var.ln() + (2.0 * std::f64::consts::PI).ln())
}

fn poisson_divergence(rate: f64, other: f64) -> f64 {
    match (rate > 0.0, other > 0.0) {
        (false, _) => other,
        (true, false) => f64::INFINITY,
        (true, true) => rate * (rate / other).ln() - rate + other,
    }
}

fn poisson_log_pmf(k: u32, rate: f64) -> f64 {
    if rate <= 0.0 {
        return if k == 0 { 0.0 } else { LOG_LIKELIHOOD_FLOOR * 10.0 };
    }
    let log_factorial: f64 = (1..=k).map(|i| (i as f64).ln()).sum();
    k as f64 * rate.ln() - rate - log_factorial
}

/// Log-likelihood of one agent's risky-arm outcome under a state's drift and
/// jump rate. Agents that allocated nothing reveal nothing.
fn outcome_log_likelihood(outcome: &Outcome, drift: f64, jump_rate: f64, sigma: f64, dt: f64) -> f64 {
    let alloc = outcome.allocation;
    if alloc <= 0.0 {
        return 0.0;
    }
    gaussian_log_density(outcome.diffusion, alloc * drift * dt, sigma * sigma * alloc * dt)
        + poisson_log_pmf(outcome.jumps, alloc * jump_rate * dt)
}
