//! Twin soft Q-networks with Polyak-averaged targets.

use nalgebra::DVector;
use rand::Rng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Module, Result};
use crate::nn::adam::AdamStep;
use crate::nn::{check_finite, check_finite_scalar, soft_update, Activation, Adam, Mlp, Parameters};
use crate::types::AgentId;

/// One regression target: critic input, output index and TD target.
#[derive(Debug, Clone)]
pub struct CriticTarget {
    pub input: DVector<f64>,
    pub index: usize,
    pub target: f64,
}

/// A pending critic step, committed together with the actor step.
#[derive(Debug, Clone)]
pub struct CriticStep {
    pub loss: f64,
    pub grad: DVector<f64>,
}

/// Two independent Q-networks and their slow-moving targets.
///
/// Discrete policies use one output per action; allocation policies take
/// the action as the last input and have a single output.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TwinCritic {
    nets: Vec<Mlp>,
    targets: Vec<Mlp>,
    optimizer: Adam,
}

impl TwinCritic {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        output_dim: usize,
        hidden_dim: usize,
        lr: f64,
        max_grad_norm: f64,
        rng: &mut R,
    ) -> Self {
        let nets: Vec<Mlp> = (0..2)
            .map(|_| {
                Mlp::new(
                    &[input_dim, hidden_dim, hidden_dim, output_dim],
                    Activation::Relu,
                    rng,
                )
            })
            .collect();
        let optimizer = Adam::new(nets.num_parameters(), lr).with_max_grad_norm(max_grad_norm);
        Self {
            targets: nets.clone(),
            nets,
            optimizer,
        }
    }

    /// Element-wise minimum of the two online networks.
    pub fn min_q(&self, input: &DVector<f64>) -> DVector<f64> {
        self.nets[0].forward(input).inf(&self.nets[1].forward(input))
    }

    /// Element-wise minimum of the two target networks.
    pub fn target_min_q(&self, input: &DVector<f64>) -> DVector<f64> {
        self.targets[0]
            .forward(input)
            .inf(&self.targets[1].forward(input))
    }

    /// Minimum scalar Q of the online networks and its gradient with
    /// respect to the input. Used by allocation actors.
    pub fn min_q_with_input_grad(&self, input: &DVector<f64>) -> (f64, DVector<f64>) {
        let (q0, trace0) = self.nets[0].forward_traced(input);
        let (q1, trace1) = self.nets[1].forward_traced(input);
        let (net, trace, q) = if q0[0] <= q1[0] {
            (&self.nets[0], trace0, q0[0])
        } else {
            (&self.nets[1], trace1, q1[0])
        };
        let mut scratch = net.zeros_like();
        let grad = net.backward(&trace, &DVector::from_element(1, 1.0), &mut scratch);
        (q, grad)
    }

    /// Mean squared TD error of both networks and its gradient.
    pub fn regression_step(&self, targets: &[CriticTarget], agent: AgentId) -> Result<CriticStep> {
        let mut grads: Vec<Mlp> = self.nets.iter().map(Mlp::zeros_like).collect();
        let scale = 1.0 / targets.len().max(1) as f64;
        let mut loss = 0.0;
        for t in targets {
            for (net, g) in self.nets.iter().zip(grads.iter_mut()) {
                let (q, trace) = net.forward_traced(&t.input);
                let err = q[t.index] - t.target;
                loss += 0.5 * err * err * scale;
                let mut grad_out = DVector::zeros(q.len());
                grad_out[t.index] = err * scale;
                net.backward(&trace, &grad_out, g);
            }
        }
        let grad = grads.flat();
        check_finite_scalar(loss, agent, Module::Critic, "TD loss")?;
        check_finite(&grad, agent, Module::Critic, "gradient")?;
        Ok(CriticStep { loss, grad })
    }

    /// Proposes new parameters for `step` without committing them.
    pub fn propose(&self, step: &CriticStep, agent: AgentId) -> Result<AdamStep> {
        let proposal = self.optimizer.step(&self.nets.flat(), &step.grad);
        check_finite(&proposal.params, agent, Module::Critic, "parameters")?;
        Ok(proposal)
    }

    /// Commits a proposal and moves the targets toward the new parameters.
    pub fn commit(&mut self, proposal: AdamStep, tau: f64) {
        let next = self.optimizer.commit(proposal);
        self.nets.load_flat(&next);
        for (target, net) in self.targets.iter_mut().zip(&self.nets) {
            soft_update(target, net, tau);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn regression_fits_constant_targets() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut critic = TwinCritic::new(2, 3, 16, 1e-2, 10.0, &mut rng);
        let input = DVector::from_vec(vec![0.5, -0.5]);
        let targets: Vec<_> = (0..3)
            .map(|i| CriticTarget {
                input: input.clone(),
                index: i,
                target: i as f64,
            })
            .collect();
        for _ in 0..500 {
            let step = critic.regression_step(&targets, 0).unwrap();
            let proposal = critic.propose(&step, 0).unwrap();
            critic.commit(proposal, 0.05);
        }
        let q = critic.min_q(&input);
        for i in 0..3 {
            assert!((q[i] - i as f64).abs() < 0.05, "q[{}] = {}", i, q[i]);
        }
        // targets trail the online networks
        let t = critic.target_min_q(&input);
        assert!((t[2] - 2.0).abs() < 0.5);
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(1);
        let critic = TwinCritic::new(3, 1, 8, 1e-3, 1.0, &mut rng);
        let x = DVector::from_vec(vec![0.2, -0.3, 0.6]);
        let (q, g) = critic.min_q_with_input_grad(&x);
        assert_eq!(q, critic.min_q(&x)[0]);
        let eps = 1e-6;
        for i in 0..3 {
            let mut xp = x.clone();
            xp[i] += eps;
            let fd = (critic.min_q(&xp)[0] - q) / eps;
            assert!((fd - g[i]).abs() < 1e-4);
        }
    }
}
