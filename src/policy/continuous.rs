//! Soft actor-critic over allocations in `[0, 1]`.
//!
//! The actor outputs the mean and log standard deviation of a Gaussian over
//! an unbounded pre-activation `u`; the allocation is `(tanh u + 1) / 2`.
//! Log-probabilities include the change-of-variables correction for both the
//! `tanh` squash and the affine map onto the unit interval.

use std::f64::consts::PI;

use nalgebra::DVector;
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::critic::{CriticTarget, TwinCritic};
use super::temperature::Temperature;
use super::{ActionMode, Criterion, Decision, SacLosses, SacSample};
use crate::config::AgentConfig;
use crate::error::{Module, Result};
use crate::nn::{
    check_finite, check_finite_scalar, concat, Activation, Adam, Mlp, Parameters,
    SynapticIntelligence,
};
use crate::types::{Action, ActionSpace, AgentId};

const LOG_STD_MIN: f64 = -5.0;
const LOG_STD_MAX: f64 = 2.0;
const SQUASH_EPS: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContinuousSac {
    bins: usize,
    actor: Mlp,
    actor_optimizer: Adam,
    critic: TwinCritic,
    temperature: Temperature,
    criterion: Criterion,
    tau: f64,
    si: Option<SynapticIntelligence>,
}

/// A reparameterized draw: `u = μ + σ ε`, `t = tanh u`.
#[derive(Debug, Clone, Copy)]
struct Squashed {
    t: f64,
    allocation: f64,
    log_prob: f64,
}

fn squash(mean: f64, log_std: f64, noise: f64) -> Squashed {
    let u = mean + log_std.exp() * noise;
    let t = u.tanh();
    let log_prob = -0.5 * noise * noise - log_std - 0.5 * (2.0 * PI).ln()
        - (1.0 - t * t + SQUASH_EPS).ln()
        - 0.5f64.ln();
    Squashed {
        t,
        allocation: (0.5 * (t + 1.0)).clamp(0.0, 1.0),
        log_prob,
    }
}

fn critic_input(state: &DVector<f64>, allocation: f64) -> DVector<f64> {
    concat(&[state, &DVector::from_element(1, allocation)])
}

struct ActorPass {
    exploitation: f64,
    exploration: f64,
    entropy: f64,
    grad: DVector<f64>,
}

impl ContinuousSac {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        config: &AgentConfig,
        target_entropy: f64,
        rng: &mut R,
    ) -> Self {
        let hidden = config.hidden_dim;
        let mut actor = Mlp::new(&[input_dim, hidden, hidden, 2], Activation::Tanh, rng);
        actor.scale_output_layer(0.01);
        let actor_optimizer =
            Adam::new(actor.num_parameters(), config.actor_lr).with_max_grad_norm(config.max_grad_norm);
        let critic = TwinCritic::new(
            input_dim + 1,
            1,
            hidden,
            config.critic_lr,
            config.max_grad_norm,
            rng,
        );
        let si = config
            .use_si
            .then(|| SynapticIntelligence::new(&actor.flat(), config.si_importance, config.si_damping));
        Self {
            bins: config.allocation_bins,
            actor_optimizer,
            critic,
            temperature: Temperature::new(
                config.temperature,
                target_entropy,
                config.adaptive_temperature,
                config.temperature_lr,
            ),
            criterion: Criterion::from_config(config),
            tau: config.tau,
            si,
            actor,
        }
    }

    pub fn action_space(&self) -> ActionSpace {
        ActionSpace::Allocation { bins: self.bins }
    }

    pub fn alpha(&self) -> f64 {
        self.temperature.alpha()
    }

    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    /// Mean, clamped log-std and whether the clamp was active.
    fn head(&self, input: &DVector<f64>) -> (f64, f64, bool) {
        let out = self.actor.forward(input);
        let log_std = out[1].clamp(LOG_STD_MIN, LOG_STD_MAX);
        (out[0], log_std, log_std != out[1])
    }

    /// Mean and standard deviation of the pre-squash Gaussian.
    pub fn gaussian(&self, input: &DVector<f64>) -> (f64, f64) {
        let (mean, log_std, _) = self.head(input);
        (mean, log_std.exp())
    }

    pub fn decide(&self, input: &DVector<f64>, mode: ActionMode, rng: &mut dyn RngCore) -> Decision {
        let (mean, log_std, _) = self.head(input);
        let noise = match mode {
            ActionMode::Explore => rng.sample(StandardNormal),
            ActionMode::Exploit => 0.0,
        };
        let allocation = squash(mean, log_std, noise).allocation;
        Decision {
            action: Action::Allocation(allocation),
            probs: None,
            allocation: Some(allocation),
        }
    }

    /// Actor objective `E[α log π(a|s) - min Q(s, a)]` for fixed noise draws,
    /// one per state, and its gradient through the reparameterization.
    fn actor_pass(&self, states: &[&DVector<f64>], noise: &[f64], alpha: f64) -> ActorPass {
        let mut grads = self.actor.zeros_like();
        let scale = 1.0 / states.len().max(1) as f64;
        let (mut exploitation, mut exploration, mut entropy) = (0.0, 0.0, 0.0);
        for (state, &eps) in states.iter().zip(noise) {
            let (out, trace) = self.actor.forward_traced(state);
            let log_std = out[1].clamp(LOG_STD_MIN, LOG_STD_MAX);
            let clamped = log_std != out[1];
            let draw = squash(out[0], log_std, eps);
            let (q, input_grad) = self.critic.min_q_with_input_grad(&critic_input(state, draw.allocation));
            let dq_da = input_grad[input_grad.len() - 1];
            exploitation -= q * scale;
            exploration += alpha * draw.log_prob * scale;
            entropy -= draw.log_prob * scale;

            let one_minus = 1.0 - draw.t * draw.t;
            let dl_du = alpha * 2.0 * draw.t * one_minus / (one_minus + SQUASH_EPS)
                - dq_da * 0.5 * one_minus;
            let dl_dlog_std = if clamped {
                0.0
            } else {
                dl_du * log_std.exp() * eps - alpha
            };
            let grad_out = DVector::from_vec(vec![dl_du * scale, dl_dlog_std * scale]);
            self.actor.backward(&trace, &grad_out, &mut grads);
        }
        ActorPass {
            exploitation,
            exploration,
            entropy,
            grad: grads.flat(),
        }
    }

    pub fn update<R: Rng + ?Sized>(
        &mut self,
        batch: &[SacSample],
        rng: &mut R,
        agent: AgentId,
    ) -> Result<SacLosses> {
        let alpha = self.alpha();
        if batch.is_empty() {
            return Ok(SacLosses {
                alpha,
                ..SacLosses::default()
            });
        }
        let targets: Vec<CriticTarget> = batch
            .iter()
            .map(|s| {
                let (mean, log_std, _) = self.head(&s.next_state);
                let next = squash(mean, log_std, rng.sample(StandardNormal));
                let q_next = self
                    .critic
                    .target_min_q(&critic_input(&s.next_state, next.allocation))[0];
                let value = q_next - alpha * next.log_prob;
                CriticTarget {
                    input: critic_input(&s.state, allocation_of(&s.action)),
                    index: 0,
                    target: self.criterion.target(s.reward, value, s.done),
                }
            })
            .collect();
        let critic_step = self.critic.regression_step(&targets, agent)?;
        let critic_proposal = self.critic.propose(&critic_step, agent)?;

        let states: Vec<&DVector<f64>> = batch.iter().map(|s| &s.state).collect();
        let noise: Vec<f64> = (0..batch.len()).map(|_| rng.sample(StandardNormal)).collect();
        let pass = self.actor_pass(&states, &noise, alpha);
        let params = self.actor.flat();
        let mut actor_loss = pass.exploitation + pass.exploration;
        let mut grad = pass.grad;
        if let Some(si) = &self.si {
            actor_loss += si.penalty(&params);
            grad += si.penalty_gradient(&params);
        }
        check_finite_scalar(actor_loss, agent, Module::Actor, "policy loss")?;
        check_finite(&grad, agent, Module::Actor, "actor gradient")?;
        let actor_step = self.actor_optimizer.step(&params, &grad);
        check_finite(&actor_step.params, agent, Module::Actor, "actor parameters")?;
        let (temperature_loss, temperature_step) = self.temperature.propose(pass.entropy, agent)?;

        self.critic.commit(critic_proposal, self.tau);
        let next = self.actor_optimizer.commit(actor_step);
        if let Some(si) = &mut self.si {
            si.record(&grad, &params, &next);
        }
        self.actor.load_flat(&next);
        self.temperature.commit(temperature_step);
        let mean_reward = batch.iter().map(|s| s.reward).sum::<f64>() / batch.len() as f64;
        self.criterion = self.criterion.advanced(mean_reward);

        Ok(SacLosses {
            critic: critic_step.loss,
            exploitation: pass.exploitation,
            exploration: pass.exploration,
            temperature: temperature_loss,
            alpha,
            entropy: pass.entropy,
        })
    }

    pub fn consolidate(&mut self) {
        let params = self.actor.flat();
        if let Some(si) = &mut self.si {
            si.consolidate(&params);
        }
    }
}

fn allocation_of(action: &Action) -> f64 {
    match action {
        Action::Allocation(x) => x.clamp(0.0, 1.0),
        Action::Discrete(i) => (*i as f64).clamp(0.0, 1.0),
    }
}
