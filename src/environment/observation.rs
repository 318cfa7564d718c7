//! Observation encoding for belief formation.
//!
//! Turns an [`Observation`] into a fixed-length feature vector with every
//! entry in `[-1, 1]`, which keeps the belief recurrence bounded no matter
//! how long the history grows.
//!
//! Layout for the social-learning game (`S` states, `C` action classes):
//!
//! ```text
//! [signal one-hot (S)] ++ [neighbor action histogram (C)] ++ [own last action one-hot (C)]
//! ```
//!
//! Layout for the experimentation game:
//!
//! ```text
//! [background z, own z, own jump, own allocation, neighbor z, neighbor jump, neighbor allocation]
//! ```
//!
//! where each `z` is `tanh` of half the standardized Brownian increment
//! relative to the midpoint of the drift rates.

use nalgebra::{DMatrix, DVector};

use super::signal::SignalModel;
use super::{Observation, Outcome, PrivateSignal};
use crate::types::{Action, ActionSpace};

/// Number of features in the experimentation layout.
const EXPERIMENT_FEATURES: usize = 7;

/// Evidence weight per unit of standardized payoff news.
const PAYOFF_EVIDENCE: f64 = 3.0;

/// Encodes observations into bounded feature vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationEncoder {
    model: SignalModel,
    action_space: ActionSpace,
}

impl ObservationEncoder {
    pub fn new(model: SignalModel, action_space: ActionSpace) -> Self {
        Self {
            model,
            action_space,
        }
    }

    pub fn signal_model(&self) -> &SignalModel {
        &self.model
    }

    pub fn action_space(&self) -> ActionSpace {
        self.action_space
    }

    pub fn num_states(&self) -> usize {
        self.model.num_states()
    }

    /// Length of encoded vectors.
    pub fn input_dim(&self) -> usize {
        match &self.model {
            SignalModel::Discrete { num_states, .. } => {
                num_states + 2 * self.action_space.num_classes()
            }
            SignalModel::Experimentation { .. } => EXPERIMENT_FEATURES,
        }
    }

    /// Encodes `obs`; `own_action` is the agent's previous action, if any.
    pub fn encode(&self, obs: &Observation, own_action: Option<&Action>) -> DVector<f64> {
        match (&self.model, &obs.signal) {
            (SignalModel::Discrete { num_states, .. }, PrivateSignal::State(signal)) => {
                let classes = self.action_space.num_classes();
                let mut x = DVector::zeros(num_states + 2 * classes);
                if *signal < *num_states {
                    x[*signal] = 1.0;
                }
                if !obs.neighbors.is_empty() {
                    let share = 1.0 / obs.neighbors.len() as f64;
                    for nb in &obs.neighbors {
                        x[num_states + self.action_space.class_of(&nb.action)] += share;
                    }
                }
                if let Some(action) = own_action {
                    x[num_states + classes + self.action_space.class_of(action)] = 1.0;
                }
                x
            }
            (
                SignalModel::Experimentation {
                    drift_rates,
                    diffusion_sigma,
                    background_informativeness,
                    time_step,
                    ..
                },
                PrivateSignal::Experiment { background, own },
            ) => {
                let mid = midpoint(drift_rates);
                let dt = *time_step;
                let sigma = *diffusion_sigma;
                let bg = (background - background_informativeness * mid * dt) / (sigma * dt.sqrt());
                let z = |o: &Outcome| -> f64 {
                    if o.allocation <= 0.0 {
                        return 0.0;
                    }
                    let scale = sigma * (o.allocation * dt).sqrt();
                    squash((o.diffusion - o.allocation * mid * dt) / scale)
                };
                let jumped = |o: &Outcome| if o.jumps > 0 { 1.0 } else { 0.0 };

                let outcomes: Vec<Outcome> =
                    obs.neighbors.iter().filter_map(|nb| nb.outcome).collect();
                let active: Vec<Outcome> = outcomes
                    .iter()
                    .copied()
                    .filter(|o| o.allocation > 0.0)
                    .collect();
                let (nb_z, nb_jump) = if active.is_empty() {
                    (0.0, 0.0)
                } else {
                    let k = active.len() as f64;
                    (
                        active.iter().map(|o| z(o)).sum::<f64>() / k,
                        active.iter().map(|o| jumped(o)).fold(0.0, f64::max),
                    )
                };
                let nb_alloc = if outcomes.is_empty() {
                    0.0
                } else {
                    outcomes.iter().map(|o| o.allocation).sum::<f64>() / outcomes.len() as f64
                };
                DVector::from_vec(vec![
                    squash(bg),
                    z(own),
                    jumped(own),
                    own.allocation.clamp(0.0, 1.0),
                    nb_z,
                    nb_jump,
                    nb_alloc.clamp(0.0, 1.0),
                ])
            }
            _ => DVector::zeros(self.input_dim()),
        }
    }

    /// Initial evidence weights (`num_states × input_dim`) for a belief
    /// readout.
    ///
    /// Row `s` scores how strongly each feature points at state `s` under the
    /// declared law. Starting the readout here makes fresh agents behave like
    /// approximate Bayesian learners before any gradient step.
    pub fn evidence_prior(&self) -> DMatrix<f64> {
        let n = self.num_states();
        let d = self.input_dim();
        let mut w = DMatrix::zeros(n, d);
        match &self.model {
            SignalModel::Discrete {
                num_states,
                accuracy,
            } => {
                let off = self.model.off_signal_probability().unwrap_or(0.5);
                let kappa = (accuracy / off.max(1e-6)).ln().clamp(0.0, 10.0);
                let classes = self.action_space.num_classes();
                for s in 0..n {
                    w[(s, s)] = kappa;
                    if s < classes {
                        w[(s, num_states + s)] = 0.5 * kappa;
                    }
                }
            }
            SignalModel::Experimentation {
                drift_rates,
                jump_rates,
                diffusion_sigma,
                background_informativeness,
                time_step,
                ..
            } => {
                let drift = centered(drift_rates);
                let jumps = centered(jump_rates);
                let range = span(drift_rates);
                let snr = (background_informativeness * range * time_step.sqrt()
                    / diffusion_sigma)
                    .abs()
                    .min(1.0);
                for s in 0..n {
                    w[(s, 0)] = PAYOFF_EVIDENCE * snr * drift[s];
                    w[(s, 1)] = PAYOFF_EVIDENCE * drift[s];
                    w[(s, 2)] = PAYOFF_EVIDENCE * jumps[s];
                    w[(s, 4)] = PAYOFF_EVIDENCE * drift[s];
                    w[(s, 5)] = PAYOFF_EVIDENCE * jumps[s];
                }
            }
        }
        w
    }
}

fn squash(z: f64) -> f64 {
    if z.is_finite() {
        (0.5 * z).tanh()
    } else {
        0.0
    }
}

fn midpoint(values: &[f64]) -> f64 {
    let (lo, hi) = bounds(values);
    0.5 * (lo + hi)
}

fn span(values: &[f64]) -> f64 {
    let (lo, hi) = bounds(values);
    hi - lo
}

fn bounds(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        })
}

/// Maps each value to `[-1, 1]` relative to the midpoint of the range; all
/// zeros when the values coincide.
fn centered(values: &[f64]) -> Vec<f64> {
    let half = 0.5 * span(values);
    let mid = midpoint(values);
    values
        .iter()
        .map(|v| if half > 0.0 { (v - mid) / half } else { 0.0 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::NeighborSignal;

    fn discrete_encoder() -> ObservationEncoder {
        ObservationEncoder::new(
            SignalModel::Discrete {
                num_states: 3,
                accuracy: 0.8,
            },
            ActionSpace::Discrete { n: 3 },
        )
    }

    #[test]
    fn discrete_layout() {
        let enc = discrete_encoder();
        let obs = Observation {
            agent: 0,
            time_step: 2,
            signal: PrivateSignal::State(1),
            neighbors: vec![
                NeighborSignal {
                    agent: 1,
                    action: Action::Discrete(2),
                    outcome: None,
                },
                NeighborSignal {
                    agent: 2,
                    action: Action::Discrete(2),
                    outcome: None,
                },
            ],
        };
        let x = enc.encode(&obs, Some(&Action::Discrete(0)));
        assert_eq!(enc.input_dim(), 9);
        assert_eq!(
            x.as_slice(),
            &[0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0]
        );
    }

    #[test]
    fn discrete_prior_favours_signalled_state() {
        let enc = discrete_encoder();
        let w = enc.evidence_prior();
        assert_eq!(w.shape(), (3, 9));
        assert!((w[(2, 2)] - 8.0_f64.ln()).abs() < 1e-12);
        assert_eq!(w[(0, 2)], 0.0);
    }

    #[test]
    fn experiment_features_are_bounded_and_signed() {
        let enc = ObservationEncoder::new(
            SignalModel::Experimentation {
                drift_rates: vec![0.0, 1.0],
                jump_rates: vec![0.0, 0.1],
                jump_sizes: vec![1.0, 1.0],
                diffusion_sigma: 0.1,
                background_informativeness: 0.001,
                time_step: 1.0,
            },
            ActionSpace::Allocation { bins: 5 },
        );
        let good = Observation {
            agent: 0,
            time_step: 1,
            signal: PrivateSignal::Experiment {
                background: 1e6,
                own: Outcome {
                    allocation: 1.0,
                    diffusion: 1.0,
                    jumps: 3,
                },
            },
            neighbors: vec![],
        };
        let x = enc.encode(&good, None);
        assert_eq!(x.len(), enc.input_dim());
        assert!(x.iter().all(|v| v.abs() <= 1.0));
        assert!(x[1] > 0.9);
        assert_eq!(x[2], 1.0);

        let w = enc.evidence_prior();
        // good state (1) gains from positive payoff news, bad state loses
        assert!(w[(1, 1)] > 0.0 && w[(0, 1)] < 0.0);
        assert!(w[(1, 0)].abs() < w[(1, 1)].abs());
    }
}
