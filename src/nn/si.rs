//! Synaptic Intelligence: per-parameter importance from the path integral
//! of the loss along the optimization trajectory.

use nalgebra::DVector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Importance-weighted quadratic anchor for one parameter vector.
///
/// During training, [`SynapticIntelligence::record`] accumulates
/// `-g ⊙ Δθ` for each committed step. [`SynapticIntelligence::consolidate`]
/// folds the running total into the importance `Ω` and moves the anchor to
/// the current parameters. The penalty `c Σ Ω (θ - θ*)²` then resists drift
/// away from what mattered for earlier tasks.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SynapticIntelligence {
    pub strength: f64,
    pub damping: f64,
    importance: DVector<f64>,
    anchor: DVector<f64>,
    path: DVector<f64>,
    consolidations: u32,
}

impl SynapticIntelligence {
    pub fn new(params: &DVector<f64>, strength: f64, damping: f64) -> Self {
        Self {
            strength,
            damping,
            importance: DVector::zeros(params.len()),
            anchor: params.clone(),
            path: DVector::zeros(params.len()),
            consolidations: 0,
        }
    }

    pub fn consolidations(&self) -> u32 {
        self.consolidations
    }

    /// Penalty value at `params`.
    pub fn penalty(&self, params: &DVector<f64>) -> f64 {
        let diff = params - &self.anchor;
        self.strength * self.importance.dot(&diff.component_mul(&diff))
    }

    /// Gradient of [`SynapticIntelligence::penalty`] at `params`.
    pub fn penalty_gradient(&self, params: &DVector<f64>) -> DVector<f64> {
        (params - &self.anchor).component_mul(&self.importance) * (2.0 * self.strength)
    }

    /// Adds one committed step's contribution to the path integral.
    pub fn record(&mut self, grads: &DVector<f64>, before: &DVector<f64>, after: &DVector<f64>) {
        let delta = after - before;
        self.path -= grads.component_mul(&delta);
    }

    /// Folds the path integral into the importance and re-anchors at `params`.
    pub fn consolidate(&mut self, params: &DVector<f64>) {
        let drift = params - &self.anchor;
        for i in 0..self.importance.len() {
            let contribution = self.path[i] / (drift[i] * drift[i] + self.damping);
            if contribution.is_finite() {
                self.importance[i] += contribution.max(0.0);
            }
        }
        self.anchor = params.clone();
        self.path.fill(0.0);
        self.consolidations += 1;
    }
}
