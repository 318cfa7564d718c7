//! Soft actor-critic over a finite action set.

use nalgebra::DVector;
use rand::{Rng, RngCore};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::critic::{CriticTarget, TwinCritic};
use super::temperature::Temperature;
use super::{ActionMode, Criterion, Decision, SacLosses, SacSample};
use crate::config::AgentConfig;
use crate::error::{Module, Result};
use crate::nn::{
    check_finite, check_finite_scalar, log_softmax, softmax, Activation, Adam, Mlp, Parameters,
    SynapticIntelligence,
};
use crate::types::{Action, ActionSpace, AgentId};

/// Categorical actor with twin critics.
///
/// Because the action set is finite, the value of the next state and the
/// actor objective are computed exactly as expectations over all actions
/// rather than from sampled actions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiscreteSac {
    num_actions: usize,
    actor: Mlp,
    actor_optimizer: Adam,
    critic: TwinCritic,
    temperature: Temperature,
    criterion: Criterion,
    tau: f64,
    si: Option<SynapticIntelligence>,
}

/// Actor objective terms and their gradient for one batch.
struct ActorPass {
    exploitation: f64,
    exploration: f64,
    entropy: f64,
    grad: DVector<f64>,
}

impl DiscreteSac {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        num_actions: usize,
        config: &AgentConfig,
        target_entropy: f64,
        rng: &mut R,
    ) -> Self {
        let hidden = config.hidden_dim;
        let mut actor = Mlp::new(
            &[input_dim, hidden, hidden, num_actions],
            Activation::Tanh,
            rng,
        );
        actor.scale_output_layer(0.01);
        let actor_optimizer =
            Adam::new(actor.num_parameters(), config.actor_lr).with_max_grad_norm(config.max_grad_norm);
        let critic = TwinCritic::new(
            input_dim,
            num_actions,
            hidden,
            config.critic_lr,
            config.max_grad_norm,
            rng,
        );
        let si = config
            .use_si
            .then(|| SynapticIntelligence::new(&actor.flat(), config.si_importance, config.si_damping));
        Self {
            num_actions,
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
        ActionSpace::Discrete {
            n: self.num_actions,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.temperature.alpha()
    }

    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    pub fn probs(&self, input: &DVector<f64>) -> DVector<f64> {
        softmax(&self.actor.forward(input))
    }

    pub fn decide(&self, input: &DVector<f64>, mode: ActionMode, rng: &mut dyn RngCore) -> Decision {
        let probs = self.probs(input);
        let index = match mode {
            ActionMode::Exploit => probs.imax(),
            ActionMode::Explore => sample_categorical(&probs, rng),
        };
        Decision {
            action: Action::Discrete(index),
            allocation: (self.num_actions == 2).then(|| probs[1]),
            probs: Some(probs),
        }
    }

    fn actor_pass(&self, states: &[&DVector<f64>], alpha: f64) -> ActorPass {
        let mut grads = self.actor.zeros_like();
        let scale = 1.0 / states.len().max(1) as f64;
        let (mut exploitation, mut exploration, mut entropy) = (0.0, 0.0, 0.0);
        for state in states {
            let (logits, trace) = self.actor.forward_traced(state);
            let log_probs = log_softmax(&logits);
            let probs = log_probs.map(f64::exp);
            let q = self.critic.min_q(state);
            let plogp = probs.dot(&log_probs);
            exploitation -= probs.dot(&q) * scale;
            exploration += alpha * plogp * scale;
            entropy -= plogp * scale;
            // d/dz Σ π (α log π - Q) = π ⊙ (f - Σ π f)
            let f = log_probs * alpha - q;
            let mean_f = probs.dot(&f);
            let grad_logits = probs.zip_map(&f, |p, fi| p * (fi - mean_f)) * scale;
            self.actor.backward(&trace, &grad_logits, &mut grads);
        }
        ActorPass {
            exploitation,
            exploration,
            entropy,
            grad: grads.flat(),
        }
    }

    /// Soft value of `state` under the target critics.
    fn soft_value(&self, state: &DVector<f64>, alpha: f64) -> f64 {
        let log_probs = log_softmax(&self.actor.forward(state));
        let probs = log_probs.map(f64::exp);
        probs.dot(&(self.critic.target_min_q(state) - log_probs * alpha))
    }

    pub fn update(&mut self, batch: &[SacSample], agent: AgentId) -> Result<SacLosses> {
        let alpha = self.alpha();
        if batch.is_empty() {
            return Ok(SacLosses {
                alpha,
                ..SacLosses::default()
            });
        }
        let space = self.action_space();
        let targets: Vec<CriticTarget> = batch
            .iter()
            .map(|s| CriticTarget {
                input: s.state.clone(),
                index: space.class_of(&s.action),
                target: self
                    .criterion
                    .target(s.reward, self.soft_value(&s.next_state, alpha), s.done),
            })
            .collect();
        let critic_step = self.critic.regression_step(&targets, agent)?;
        let critic_proposal = self.critic.propose(&critic_step, agent)?;

        let states: Vec<&DVector<f64>> = batch.iter().map(|s| &s.state).collect();
        let pass = self.actor_pass(&states, alpha);
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

/// Inverse-CDF draw; falls back to the last index on rounding.
fn sample_categorical(probs: &DVector<f64>, rng: &mut dyn RngCore) -> usize {
    let u: f64 = rng.gen();
    let mut acc = 0.0;
    for (i, p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}
