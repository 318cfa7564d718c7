//! Entropy temperature α, fixed or adapted toward a target entropy.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Module, Result};
use crate::nn::check_finite_scalar;
use crate::types::AgentId;

const LOG_ALPHA_MIN: f64 = -20.0;
const LOG_ALPHA_MAX: f64 = 5.0;

/// Temperature of the soft policy objective.
///
/// In adaptive mode `log α` follows the gradient of
/// `J(log α) = log α · (H - H̄)`: it shrinks while the policy is more random
/// than the target entropy `H̄` and grows while it is more deterministic.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Temperature {
    log_alpha: f64,
    pub target_entropy: f64,
    pub adaptive: bool,
    lr: f64,
    // Adam moments for the single parameter.
    m: f64,
    v: f64,
    t: i32,
}

impl Temperature {
    pub fn new(initial: f64, target_entropy: f64, adaptive: bool, lr: f64) -> Self {
        Self {
            log_alpha: initial.max(1e-8).ln(),
            target_entropy,
            adaptive,
            lr,
            m: 0.0,
            v: 0.0,
            t: 0,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.log_alpha.exp()
    }

    /// Proposes the next temperature for a batch with mean policy entropy
    /// `entropy`; returns the loss and the proposal. Fixed temperatures
    /// propose no change.
    pub fn propose(&self, entropy: f64, agent: AgentId) -> Result<(f64, TemperatureStep)> {
        check_finite_scalar(entropy, agent, Module::Temperature, "policy entropy")?;
        let grad = entropy - self.target_entropy;
        let loss = self.log_alpha * grad;
        if !self.adaptive {
            return Ok((
                loss,
                TemperatureStep {
                    log_alpha: self.log_alpha,
                    m: self.m,
                    v: self.v,
                    t: self.t,
                },
            ));
        }
        let (beta1, beta2, eps): (f64, f64, f64) = (0.9, 0.999, 1e-8);
        let t = self.t + 1;
        let m = beta1 * self.m + (1.0 - beta1) * grad;
        let v = beta2 * self.v + (1.0 - beta2) * grad * grad;
        let m_hat = m / (1.0 - beta1.powi(t));
        let v_hat = v / (1.0 - beta2.powi(t));
        let log_alpha =
            (self.log_alpha - self.lr * m_hat / (v_hat.sqrt() + eps)).clamp(LOG_ALPHA_MIN, LOG_ALPHA_MAX);
        check_finite_scalar(log_alpha, agent, Module::Temperature, "log alpha")?;
        Ok((loss, TemperatureStep { log_alpha, m, v, t }))
    }

    pub fn commit(&mut self, step: TemperatureStep) {
        self.log_alpha = step.log_alpha;
        self.m = step.m;
        self.v = step.v;
        self.t = step.t;
    }
}

/// Pending temperature update.
#[derive(Debug, Clone, Copy)]
pub struct TemperatureStep {
    log_alpha: f64,
    m: f64,
    v: f64,
    t: i32,
}
