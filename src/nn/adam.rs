//! Adam optimizer over flat parameter vectors.

use nalgebra::DVector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Adam with optional global-norm gradient clipping.
///
/// [`Adam::step`] does not touch the parameters in place: it returns the
/// updated vector so the caller decides whether to commit it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub max_grad_norm: Option<f64>,
    m: DVector<f64>,
    v: DVector<f64>,
    t: u64,
}

impl Adam {
    pub fn new(num_parameters: usize, lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: None,
            m: DVector::zeros(num_parameters),
            v: DVector::zeros(num_parameters),
            t: 0,
        }
    }

    pub fn with_max_grad_norm(mut self, max_norm: f64) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    /// Number of steps taken so far.
    pub fn steps(&self) -> u64 {
        self.t
    }

    /// Computes the parameters after one Adam step.
    ///
    /// Moment estimates are advanced only when the returned vector is used;
    /// pass the result to [`Adam::commit`] together with the new parameters,
    /// or drop both to abandon the step.
    pub fn step(&self, params: &DVector<f64>, grads: &DVector<f64>) -> AdamStep {
        let mut g = grads.clone();
        if let Some(max_norm) = self.max_grad_norm {
            let norm = g.norm();
            if norm > max_norm && norm > 0.0 {
                g *= max_norm / norm;
            }
        }
        let t = self.t + 1;
        let m = &self.m * self.beta1 + &g * (1.0 - self.beta1);
        let v = &self.v * self.beta2 + g.map(|x| x * x) * (1.0 - self.beta2);
        let bc1 = 1.0 - self.beta1.powi(t as i32);
        let bc2 = 1.0 - self.beta2.powi(t as i32);
        let update = m.zip_map(&v, |mi, vi| {
            let m_hat = mi / bc1;
            let v_hat = vi / bc2;
            m_hat / (v_hat.sqrt() + self.eps)
        });
        AdamStep {
            params: params - update * self.lr,
            m,
            v,
            t,
        }
    }

    /// Adopts the moment estimates of a step whose parameters were committed.
    pub fn commit(&mut self, step: AdamStep) -> DVector<f64> {
        self.m = step.m;
        self.v = step.v;
        self.t = step.t;
        step.params
    }
}

/// Result of [`Adam::step`]: new parameters plus pending optimizer state.
#[derive(Debug, Clone)]
pub struct AdamStep {
    pub params: DVector<f64>,
    m: DVector<f64>,
    v: DVector<f64>,
    t: u64,
}

impl AdamStep {
    pub fn is_finite(&self) -> bool {
        self.params.iter().all(|x| x.is_finite())
    }
}
