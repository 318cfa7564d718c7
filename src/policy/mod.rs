//! Entropy-regularized actor-critic policies.
//!
//! Each agent owns one [`PolicyModule`]: a soft actor-critic with twin
//! critics and Polyak targets over the agent's policy input (belief, and
//! optionally the opponent summary). Discrete action sets use a categorical
//! actor; allocations use a tanh-squashed Gaussian mapped onto `[0, 1]`.
//! The value (exploitation) and entropy (exploration) parts of the actor
//! objective are computed and reported separately.

pub mod continuous;
pub mod critic;
pub mod discrete;
pub mod random;
pub mod temperature;
pub mod trait_;

use nalgebra::DVector;
use rand::{Rng, RngCore};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::types::{Action, ActionSpace, AgentId};

pub use continuous::ContinuousSac;
pub use critic::TwinCritic;
pub use discrete::DiscreteSac;
pub use random::RandomPolicy;
pub use temperature::Temperature;
pub use trait_::Policy;

/// Whether to sample from the policy or take its most likely action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMode {
    Explore,
    Exploit,
}

/// An action together with what the policy knew when choosing it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    /// Categorical probabilities, for discrete policies.
    pub probs: Option<DVector<f64>>,
    /// Expected share on the risky option: the allocation itself, or the
    /// probability of action 1 for two-action discrete policies.
    pub allocation: Option<f64>,
}

/// Full action distribution at one input.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionDistribution {
    Categorical(DVector<f64>),
    /// Gaussian before the `tanh` squash.
    SquashedGaussian { mean: f64, std: f64 },
}

impl ActionDistribution {
    /// Largest absolute difference between two distributions' parameters,
    /// or infinity when their kinds differ.
    pub fn max_abs_diff(&self, other: &ActionDistribution) -> f64 {
        match (self, other) {
            (ActionDistribution::Categorical(a), ActionDistribution::Categorical(b))
                if a.len() == b.len() =>
            {
                (a - b).amax()
            }
            (
                ActionDistribution::SquashedGaussian { mean: m1, std: s1 },
                ActionDistribution::SquashedGaussian { mean: m2, std: s2 },
            ) => (m1 - m2).abs().max((s1 - s2).abs()),
            _ => f64::INFINITY,
        }
    }
}

/// One transition as seen by the policy.
#[derive(Debug, Clone)]
pub struct SacSample {
    pub state: DVector<f64>,
    pub action: Action,
    pub reward: f64,
    pub next_state: DVector<f64>,
    pub done: bool,
}

/// Loss breakdown of one policy update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SacLosses {
    pub critic: f64,
    /// `-E[min Q]` under the current policy.
    pub exploitation: f64,
    /// `α E[log π]` under the current policy.
    pub exploration: f64,
    pub temperature: f64,
    pub alpha: f64,
    /// Mean policy entropy over the batch.
    pub entropy: f64,
}

/// How TD targets aggregate future reward.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case", tag = "kind"))]
pub enum Criterion {
    Discounted { gamma: f64 },
    /// Differential returns relative to a running reward estimate.
    AverageReward { estimate: f64, step: f64 },
}

impl Criterion {
    pub fn from_config(config: &AgentConfig) -> Self {
        if config.average_reward() {
            Criterion::AverageReward {
                estimate: 0.0,
                step: config.average_reward_step,
            }
        } else {
            Criterion::Discounted {
                gamma: config.discount_factor,
            }
        }
    }

    /// TD target for one transition.
    pub fn target(&self, reward: f64, next_value: f64, done: bool) -> f64 {
        let continuation = if done { 0.0 } else { 1.0 };
        match self {
            Criterion::Discounted { gamma } => reward + gamma * continuation * next_value,
            Criterion::AverageReward { estimate, .. } => {
                reward - estimate + continuation * next_value
            }
        }
    }

    /// Criterion after observing a batch with mean reward `mean_reward`.
    pub fn advanced(&self, mean_reward: f64) -> Self {
        match *self {
            Criterion::AverageReward { estimate, step } => Criterion::AverageReward {
                estimate: estimate + step * (mean_reward - estimate),
                step,
            },
            other => other,
        }
    }

    /// Running average-reward estimate, if any.
    pub fn average_reward(&self) -> Option<f64> {
        match self {
            Criterion::AverageReward { estimate, .. } => Some(*estimate),
            Criterion::Discounted { .. } => None,
        }
    }
}

/// The policy owned by one agent.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PolicyModule {
    Discrete(DiscreteSac),
    Continuous(ContinuousSac),
}

impl PolicyModule {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        space: ActionSpace,
        config: &AgentConfig,
        rng: &mut R,
    ) -> Self {
        let target = config.target_entropy_for(space);
        match space {
            ActionSpace::Discrete { n } => {
                PolicyModule::Discrete(DiscreteSac::new(input_dim, n, config, target, rng))
            }
            ActionSpace::Allocation { .. } => {
                PolicyModule::Continuous(ContinuousSac::new(input_dim, config, target, rng))
            }
        }
    }

    pub fn distribution(&self, input: &DVector<f64>) -> ActionDistribution {
        match self {
            PolicyModule::Discrete(p) => ActionDistribution::Categorical(p.probs(input)),
            PolicyModule::Continuous(p) => {
                let (mean, std) = p.gaussian(input);
                ActionDistribution::SquashedGaussian { mean, std }
            }
        }
    }

    pub fn alpha(&self) -> f64 {
        match self {
            PolicyModule::Discrete(p) => p.alpha(),
            PolicyModule::Continuous(p) => p.alpha(),
        }
    }

    /// One soft actor-critic update. Critics, actor and temperature are
    /// committed together, or not at all.
    pub fn update<R: Rng + ?Sized>(
        &mut self,
        batch: &[SacSample],
        rng: &mut R,
        agent: AgentId,
    ) -> Result<SacLosses> {
        match self {
            PolicyModule::Discrete(p) => p.update(batch, agent),
            PolicyModule::Continuous(p) => p.update(batch, rng, agent),
        }
    }

    /// Consolidates synaptic importance of the actor, if enabled.
    pub fn consolidate(&mut self) {
        match self {
            PolicyModule::Discrete(p) => p.consolidate(),
            PolicyModule::Continuous(p) => p.consolidate(),
        }
    }

    pub fn criterion(&self) -> Criterion {
        match self {
            PolicyModule::Discrete(p) => p.criterion(),
            PolicyModule::Continuous(p) => p.criterion(),
        }
    }
}

impl Policy for PolicyModule {
    fn decide(&self, input: &DVector<f64>, mode: ActionMode, rng: &mut dyn RngCore) -> Decision {
        match self {
            PolicyModule::Discrete(p) => p.decide(input, mode, rng),
            PolicyModule::Continuous(p) => p.decide(input, mode, rng),
        }
    }

    fn action_space(&self) -> ActionSpace {
        match self {
            PolicyModule::Discrete(p) => p.action_space(),
            PolicyModule::Continuous(p) => p.action_space(),
        }
    }

    fn name(&self) -> &str {
        match self {
            PolicyModule::Discrete(_) => "categorical-sac",
            PolicyModule::Continuous(_) => "squashed-gaussian-sac",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discounted_targets() {
        let c = Criterion::Discounted { gamma: 0.9 };
        assert!((c.target(1.0, 2.0, false) - 2.8).abs() < 1e-12);
        assert_eq!(c.target(1.0, 2.0, true), 1.0);
        assert_eq!(c.advanced(5.0), c);
    }

    #[test]
    fn zero_discount_selects_average_reward() {
        let config = AgentConfig {
            discount_factor: 0.0,
            average_reward_step: 0.5,
            ..AgentConfig::default()
        };
        let c = Criterion::from_config(&config);
        assert_eq!(c.average_reward(), Some(0.0));
        let c = c.advanced(2.0);
        assert_eq!(c.average_reward(), Some(1.0));
        // differential target bootstraps without discounting
        assert!((c.target(1.5, 3.0, false) - 3.5).abs() < 1e-12);
    }

    #[test]
    fn distribution_difference() {
        let a = ActionDistribution::Categorical(DVector::from_vec(vec![0.5, 0.5]));
        let b = ActionDistribution::Categorical(DVector::from_vec(vec![0.4, 0.6]));
        assert!((a.max_abs_diff(&b) - 0.1).abs() < 1e-12);
        let g = ActionDistribution::SquashedGaussian { mean: 0.0, std: 1.0 };
        assert_eq!(a.max_abs_diff(&g), f64::INFINITY);
    }
}
