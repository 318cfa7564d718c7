//! Partially observable social environments.
//!
//! Both games share a latent state that agents never see directly, private
//! per-agent signals, and a social network deciding whose actions (and, in
//! the experimentation game, outcomes) each agent observes. They sit behind
//! the [`Environment`] trait and the tagged [`SocialEnvironment`] enum.
//!
//! # Lifecycle
//!
//! 1. Build with [`SocialEnvironment::from_config`].
//! 2. Optionally [`Environment::reseed`], then [`Environment::reset`].
//! 3. Call [`Environment::step`] with one action per agent until `done`.

pub mod experimentation;
pub mod observation;
pub mod reward;
pub mod signal;
pub mod social_learning;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::{EnvironmentConfig, PolarisConfig};
use crate::error::{PolarisError, Result};
use crate::network::SocialNetwork;
use crate::types::{Action, ActionSpace, AgentId};

pub use experimentation::{ExperimentationConfig, StrategicExperimentation};
pub use observation::ObservationEncoder;
pub use reward::RewardComputer;
pub use signal::SignalModel;
pub use social_learning::{SocialLearning, SocialLearningConfig};

/// Realization of one agent's risky-arm payoff during a step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Outcome {
    /// Share of the resource placed on the risky arm.
    pub allocation: f64,
    /// Brownian part of the payoff increment.
    pub diffusion: f64,
    /// Number of Poisson jumps.
    pub jumps: u32,
}

impl Outcome {
    /// Outcome of an agent that stayed entirely on the safe arm.
    pub fn idle() -> Self {
        Self {
            allocation: 0.0,
            diffusion: 0.0,
            jumps: 0,
        }
    }
}

/// Private information an agent receives each step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PrivateSignal {
    /// Noisy report of the latent state.
    State(usize),
    /// Public background increment plus the agent's own risky-arm outcome.
    Experiment { background: f64, own: Outcome },
}

/// What an agent sees of one neighbor.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NeighborSignal {
    pub agent: AgentId,
    pub action: Action,
    /// Present when the game makes payoffs public.
    pub outcome: Option<Outcome>,
}

/// Per-agent observation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Observation {
    pub agent: AgentId,
    pub time_step: u32,
    pub signal: PrivateSignal,
    /// Neighbors' previous actions; empty right after a reset.
    pub neighbors: Vec<NeighborSignal>,
}

/// Diagnostics returned with every step. Not visible to agents.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInfo {
    /// Time step after the transition.
    pub time_step: u32,
    /// Latent state after the transition.
    pub true_state: usize,
    /// Per-agent accuracy of the submitted action, in `[0, 1]`.
    pub action_accuracy: Vec<f64>,
}

/// Result of a single environment step.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// One observation per agent.
    pub observations: Vec<Observation>,
    /// One reward per agent.
    pub rewards: Vec<f64>,
    /// Whether the horizon has been reached.
    pub done: bool,
    pub info: StepInfo,
}

/// Common interface of the two games.
pub trait Environment {
    fn num_agents(&self) -> usize;

    fn num_states(&self) -> usize;

    fn action_space(&self) -> ActionSpace;

    /// Declared conditional law of observations, shared with agents.
    fn signal_model(&self) -> SignalModel;

    fn network(&self) -> &SocialNetwork;

    /// Latent state. For diagnostics and metrics only.
    fn true_state(&self) -> usize;

    fn time_step(&self) -> u32;

    fn horizon(&self) -> u32;

    /// Seed used by the next [`Environment::reset`].
    fn reseed(&mut self, seed: u64);

    /// Starts a new episode and returns each agent's first observation.
    ///
    /// Each reset consumes the current seed and advances it by one, so two
    /// environments created with the same seed replay identical episodes.
    fn reset(&mut self) -> Vec<Observation>;

    /// Applies one joint action.
    fn step(&mut self, joint_action: &[Action]) -> Result<StepResult>;

    /// Accuracy in `[0, 1]` of `action` against the current latent state.
    fn action_accuracy(&self, action: &Action) -> f64;
}

/// Checks arity; kind and range checks are per game.
pub(crate) fn check_arity(joint_action: &[Action], num_agents: usize) -> Result<()> {
    if joint_action.len() != num_agents {
        return Err(PolarisError::env(
            None,
            format!(
                "expected {} actions, got {}",
                num_agents,
                joint_action.len()
            ),
        ));
    }
    Ok(())
}

/// Tagged union over the supported games.
#[derive(Debug, Clone)]
pub enum SocialEnvironment {
    Learning(SocialLearning),
    Experimentation(StrategicExperimentation),
}

impl SocialEnvironment {
    /// Builds the environment described by a validated configuration.
    pub fn from_config(config: &PolarisConfig) -> Result<Self> {
        config.validate()?;
        let horizon = config.training.horizon;
        match &config.environment {
            EnvironmentConfig::SocialLearning(env) => Ok(SocialEnvironment::Learning(
                SocialLearning::new(
                    env.clone(),
                    config.num_agents,
                    horizon,
                    config.network.clone(),
                    config.seed,
                )?,
            )),
            EnvironmentConfig::StrategicExperimentation(env) => {
                Ok(SocialEnvironment::Experimentation(
                    StrategicExperimentation::new(
                        env.clone(),
                        config.num_agents,
                        horizon,
                        config.action_space(),
                        config.network.clone(),
                        config.seed,
                    )?,
                ))
            }
        }
    }

    fn inner(&self) -> &dyn Environment {
        match self {
            SocialEnvironment::Learning(env) => env,
            SocialEnvironment::Experimentation(env) => env,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Environment {
        match self {
            SocialEnvironment::Learning(env) => env,
            SocialEnvironment::Experimentation(env) => env,
        }
    }
}

impl Environment for SocialEnvironment {
    fn num_agents(&self) -> usize {
        self.inner().num_agents()
    }

    fn num_states(&self) -> usize {
        self.inner().num_states()
    }

    fn action_space(&self) -> ActionSpace {
        self.inner().action_space()
    }

    fn signal_model(&self) -> SignalModel {
        self.inner().signal_model()
    }

    fn network(&self) -> &SocialNetwork {
        self.inner().network()
    }

    fn true_state(&self) -> usize {
        self.inner().true_state()
    }

    fn time_step(&self) -> u32 {
        self.inner().time_step()
    }

    fn horizon(&self) -> u32 {
        self.inner().horizon()
    }

    fn reseed(&mut self, seed: u64) {
        self.inner_mut().reseed(seed)
    }

    fn reset(&mut self) -> Vec<Observation> {
        self.inner_mut().reset()
    }

    fn step(&mut self, joint_action: &[Action]) -> Result<StepResult> {
        self.inner_mut().step(joint_action)
    }

    fn action_accuracy(&self, action: &Action) -> f64 {
        self.inner().action_accuracy(action)
    }
}
