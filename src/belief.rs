//! Belief formation.
//!
//! Each agent compresses its recent private history into a belief over the
//! latent state in two stages:
//!
//! 1. A multi-timescale linear recurrence over encoded observations. For
//!    each decay `ρ_k` the agent keeps the discounted window sum
//!    `S_k = Σ_{i<K} ρ_k^i x_{t-i}`, updated in O(1) per step as
//!    `S_k ← ρ_k S_k + x_t - ρ_k^K x_{t-K}` and normalized by
//!    `Σ_{i<K} ρ_k^i`. Inputs lie in `[-1, 1]`, so every trace does too.
//! 2. A learned softmax readout from the stacked traces to a distribution
//!    over states, trained to predict the agent's next private observation
//!    under the declared signal law.
//!
//! The recurrence has no learned parameters, so the trace stored in an
//! experience record stays valid after readout updates.

use std::collections::VecDeque;

use nalgebra::{DMatrix, DVector};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::environment::ObservationEncoder;
use crate::error::{Module, Result};
use crate::nn::{
    check_finite, check_finite_scalar, entropy, softmax, Adam, Linear, Parameters,
    SynapticIntelligence,
};
use crate::types::AgentId;

/// Distribution over latent states.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Belief {
    pub probs: DVector<f64>,
}

impl Belief {
    /// Uniform belief over `num_states` states.
    pub fn uniform(num_states: usize) -> Self {
        Self {
            probs: DVector::from_element(num_states, 1.0 / num_states.max(1) as f64),
        }
    }

    /// Most likely state.
    pub fn argmax(&self) -> usize {
        self.probs.argmax().0
    }

    /// Probability assigned to `state` (0 for unknown states).
    pub fn prob(&self, state: usize) -> f64 {
        self.probs.get(state).copied().unwrap_or(0.0)
    }

    /// 1 when the most likely state is `state`, else 0.
    pub fn accuracy(&self, state: usize) -> f64 {
        if !self.probs.is_empty() && self.argmax() == state {
            1.0
        } else {
            0.0
        }
    }

    pub fn entropy(&self) -> f64 {
        entropy(&self.probs)
    }

    pub fn num_states(&self) -> usize {
        self.probs.len()
    }
}

/// Recurrence state: one discounted window sum per timescale, stacked.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BeliefState {
    sums: DVector<f64>,
    steps: u64,
}

impl BeliefState {
    /// Number of observations absorbed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

/// One training sample for the readout: the trace when the belief was held
/// and the per-state likelihood of the observation that followed.
#[derive(Debug, Clone, Copy)]
pub struct BeliefSample<'a> {
    pub state: &'a BeliefState,
    pub next_likelihood: &'a DVector<f64>,
}

/// Per-agent belief encoder.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BeliefEncoder {
    decays: Vec<f64>,
    window: usize,
    input_dim: usize,
    /// `Σ_{i<K} ρ_k^i` per timescale.
    norms: Vec<f64>,
    /// `ρ_k^K` per timescale.
    tails: Vec<f64>,
    readout: Linear,
    optimizer: Adam,
    si: Option<SynapticIntelligence>,
}

impl BeliefEncoder {
    /// Creates an encoder whose readout starts at the observation encoder's
    /// evidence prior on every timescale.
    pub fn new(
        observations: &ObservationEncoder,
        decays: &[f64],
        window: usize,
        lr: f64,
        max_grad_norm: f64,
    ) -> Self {
        let input_dim = observations.input_dim();
        let num_states = observations.num_states();
        let prior = observations.evidence_prior();
        let k = decays.len();
        let mut weight = DMatrix::zeros(num_states, k * input_dim);
        for block in 0..k {
            weight
                .view_mut((0, block * input_dim), (num_states, input_dim))
                .copy_from(&prior);
        }
        let readout = Linear {
            weight,
            bias: DVector::zeros(num_states),
        };
        let optimizer =
            Adam::new(readout.num_parameters(), lr).with_max_grad_norm(max_grad_norm);
        Self {
            decays: decays.to_vec(),
            window,
            input_dim,
            norms: decays
                .iter()
                .map(|r| (0..window).map(|i| r.powi(i as i32)).sum())
                .collect(),
            tails: decays.iter().map(|r| r.powi(window as i32)).collect(),
            readout,
            optimizer,
            si: None,
        }
    }

    /// Enables synaptic-intelligence consolidation on the readout.
    pub fn with_synaptic_intelligence(mut self, strength: f64, damping: f64) -> Self {
        self.si = Some(SynapticIntelligence::new(
            &self.readout.flat(),
            strength,
            damping,
        ));
        self
    }

    pub fn num_states(&self) -> usize {
        self.readout.output_dim()
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Length of the history window `K`.
    pub fn window(&self) -> usize {
        self.window
    }

    /// State before any observation: all traces at zero.
    pub fn initial_state(&self) -> BeliefState {
        BeliefState {
            sums: DVector::zeros(self.decays.len() * self.input_dim),
            steps: 0,
        }
    }

    /// Absorbs `x`. `dropped` is the observation leaving the K-step window,
    /// if the window was already full.
    pub fn advance(
        &self,
        state: &BeliefState,
        x: &DVector<f64>,
        dropped: Option<&DVector<f64>>,
    ) -> BeliefState {
        let d = self.input_dim;
        let mut sums = state.sums.clone();
        for (k, rho) in self.decays.iter().enumerate() {
            let mut block = sums.rows_mut(k * d, d);
            block *= *rho;
            block += x;
            if let Some(old) = dropped {
                block -= old * self.tails[k];
            }
        }
        BeliefState {
            sums,
            steps: state.steps + 1,
        }
    }

    /// Recomputes the state from a full window, oldest observation first.
    ///
    /// Only the last `K` entries contribute; the result agrees with repeated
    /// [`BeliefEncoder::advance`] up to rounding.
    pub fn encode_history<'a, I>(&self, history: I) -> BeliefState
    where
        I: IntoIterator<Item = &'a DVector<f64>>,
    {
        let mut window: VecDeque<&DVector<f64>> = VecDeque::with_capacity(self.window + 1);
        let mut state = self.initial_state();
        for x in history {
            let dropped = if window.len() == self.window {
                window.pop_front()
            } else {
                None
            };
            state = self.advance(&state, x, dropped);
            window.push_back(x);
        }
        state
    }

    /// Normalized traces fed to the readout.
    pub fn features(&self, state: &BeliefState) -> DVector<f64> {
        let d = self.input_dim;
        let mut out = state.sums.clone();
        for (k, norm) in self.norms.iter().enumerate() {
            out.rows_mut(k * d, d).apply(|v| *v = (*v / norm).clamp(-1.0, 1.0));
        }
        out
    }

    pub fn belief(&self, state: &BeliefState) -> Belief {
        Belief {
            probs: softmax(&self.readout.forward(&self.features(state))),
        }
    }

    /// Mean negative log predictive likelihood of `batch` and its gradient.
    fn loss_and_grad(&self, batch: &[BeliefSample<'_>]) -> (f64, Linear) {
        let mut grads = self.readout.zeros_like();
        let mut loss = 0.0;
        let scale = 1.0 / batch.len().max(1) as f64;
        for sample in batch {
            let features = self.features(sample.state);
            let probs = softmax(&self.readout.forward(&features));
            let joint = probs.component_mul(sample.next_likelihood);
            let evidence = joint.sum().max(1e-300);
            loss -= evidence.ln() * scale;
            // d(-ln Σ b L)/d logits = b - posterior
            let grad_logits = (probs - joint / evidence) * scale;
            self.readout.backward(&features, &grad_logits, &mut grads);
        }
        (loss, grads)
    }

    /// Mean predictive loss, without updating.
    pub fn loss(&self, batch: &[BeliefSample<'_>]) -> f64 {
        self.loss_and_grad(batch).0
    }

    /// One Adam step on the readout. Parameters change only if the loss,
    /// gradient and resulting parameters are all finite.
    pub fn update(&mut self, batch: &[BeliefSample<'_>], agent: AgentId) -> Result<f64> {
        if batch.is_empty() {
            return Ok(0.0);
        }
        let (mut loss, grads) = self.loss_and_grad(batch);
        let params = self.readout.flat();
        let mut grad = grads.flat();
        if let Some(si) = &self.si {
            loss += si.penalty(&params);
            grad += si.penalty_gradient(&params);
        }
        check_finite_scalar(loss, agent, Module::Belief, "predictive loss")?;
        check_finite(&grad, agent, Module::Belief, "readout gradient")?;
        let step = self.optimizer.step(&params, &grad);
        check_finite(&step.params, agent, Module::Belief, "readout parameters")?;
        let next = self.optimizer.commit(step);
        if let Some(si) = &mut self.si {
            si.record(&grad, &params, &next);
        }
        self.readout.load_flat(&next);
        Ok(loss)
    }

    /// Consolidates synaptic importance at the current readout.
    pub fn consolidate(&mut self) {
        let params = self.readout.flat();
        if let Some(si) = &mut self.si {
            si.consolidate(&params);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Observation, PrivateSignal, SignalModel};
    use crate::types::ActionSpace;

    #[test]
    fn accuracy_is_argmax_agreement() {
        let belief = Belief {
            probs: DVector::from_vec(vec![0.45, 0.35, 0.20]),
        };
        assert_eq!(belief.accuracy(0), 1.0);
        assert_eq!(belief.accuracy(1), 0.0);
        assert!((belief.prob(0) - 0.45).abs() < 1e-12);

        let belief = Belief {
            probs: DVector::from_vec(vec![0.34, 0.33, 0.33]),
        };
        assert_eq!(belief.accuracy(0), 1.0);
        assert_eq!(belief.accuracy(2), 0.0);
        assert_eq!(Belief::uniform(0).accuracy(0), 0.0);
    }

    fn encoders() -> (ObservationEncoder, BeliefEncoder) {
        let obs = ObservationEncoder::new(
            SignalModel::Discrete {
                num_states: 3,
                accuracy: 0.8,
            },
            ActionSpace::Discrete { n: 3 },
        );
        let belief = BeliefEncoder::new(&obs, &[0.5, 0.9, 0.98], 16, 1e-2, 1.0);
        (obs, belief)
    }

    fn signal(obs: &ObservationEncoder, s: usize) -> DVector<f64> {
        obs.encode(
            &Observation {
                agent: 0,
                time_step: 0,
                signal: PrivateSignal::State(s),
                neighbors: vec![],
            },
            None,
        )
    }

    fn run(belief: &BeliefEncoder, xs: &[DVector<f64>]) -> Vec<BeliefState> {
        let mut window: VecDeque<&DVector<f64>> = VecDeque::new();
        let mut state = belief.initial_state();
        let mut out = Vec::new();
        for x in xs {
            let dropped = if window.len() == belief.window() {
                window.pop_front()
            } else {
                None
            };
            state = belief.advance(&state, x, dropped);
            window.push_back(x);
            out.push(state.clone());
        }
        out
    }

    #[test]
    fn starts_uniform() {
        let (_, belief) = encoders();
        let b = belief.belief(&belief.initial_state());
        assert!(b.probs.iter().all(|p| (p - 1.0 / 3.0).abs() < 1e-12));
    }

    #[test]
    fn consistent_signals_concentrate_belief() {
        let (obs, belief) = encoders();
        let xs: Vec<_> = (0..30).map(|_| signal(&obs, 2)).collect();
        let states = run(&belief, &xs);
        let b = belief.belief(states.last().unwrap());
        assert_eq!(b.argmax(), 2);
        assert!(b.prob(2) > 0.9);
    }

    #[test]
    fn update_is_causal() {
        let (obs, belief) = encoders();
        let a: Vec<_> = [0, 1, 2, 0, 0, 1].iter().map(|&s| signal(&obs, s)).collect();
        let mut b = a.clone();
        b[4] = signal(&obs, 2);
        b[5] = signal(&obs, 2);
        let sa = run(&belief, &a);
        let sb = run(&belief, &b);
        assert_eq!(sa[..4], sb[..4]);
        assert_ne!(sa[4], sb[4]);
    }

    #[test]
    fn order_matters() {
        let (obs, belief) = encoders();
        let a: Vec<_> = [0, 0, 1].iter().map(|&s| signal(&obs, s)).collect();
        let b: Vec<_> = [1, 0, 0].iter().map(|&s| signal(&obs, s)).collect();
        assert_ne!(
            belief.belief(run(&belief, &a).last().unwrap()),
            belief.belief(run(&belief, &b).last().unwrap())
        );
    }

    #[test]
    fn long_histories_stay_bounded_and_recomputable() {
        let (obs, belief) = encoders();
        let xs: Vec<_> = (0..5000).map(|t| signal(&obs, (t * 7 + t / 3) % 3)).collect();
        let incremental = run(&belief, &xs);
        let last = incremental.last().unwrap();
        let features = belief.features(last);
        assert!(features.iter().all(|v| v.abs() <= 1.0));

        let recomputed = belief.encode_history(&xs[xs.len() - belief.window()..]);
        let diff = (belief.features(&recomputed) - features).amax();
        assert!(diff < 1e-9, "drift {}", diff);
    }

    #[test]
    fn readout_update_reduces_predictive_loss() {
        let (obs, mut belief) = encoders();
        // Uninformative history, but the next signal is always state 1.
        let state = belief.initial_state();
        let model = obs.signal_model().clone();
        let next = model.likelihood(&Observation {
            agent: 0,
            time_step: 1,
            signal: PrivateSignal::State(1),
            neighbors: vec![],
        });
        let batch = vec![
            BeliefSample {
                state: &state,
                next_likelihood: &next,
            };
            8
        ];
        let before = belief.loss(&batch);
        for _ in 0..50 {
            belief.update(&batch, 0).unwrap();
        }
        assert!(belief.loss(&batch) < before);
        assert_eq!(belief.belief(&state).argmax(), 1);
    }

    #[test]
    fn readout_gradient_matches_finite_difference() {
        let (obs, belief) = encoders();
        let xs: Vec<_> = [0, 2, 2, 1].iter().map(|&s| signal(&obs, s)).collect();
        let state = run(&belief, &xs).pop().unwrap();
        let next = DVector::from_vec(vec![0.125, 1.0, 0.125]);
        let batch = [BeliefSample {
            state: &state,
            next_likelihood: &next,
        }];
        let (loss, grads) = belief.loss_and_grad(&batch);
        let g = grads.flat();
        let flat = belief.readout.flat();
        let eps = 1e-6;
        for i in (0..flat.len()).step_by(7) {
            let mut shifted = belief.clone();
            let mut p = flat.clone();
            p[i] += eps;
            shifted.readout.load_flat(&p);
            let fd = (shifted.loss(&batch) - loss) / eps;
            assert!((fd - g[i]).abs() < 1e-4, "param {}", i);
        }
    }
}
