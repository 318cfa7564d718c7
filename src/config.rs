//! Run configuration: environment, network, agents and training schedule.
//!
//! Every struct has a `Default` matching the reference experiments, so a
//! JSON file only needs the fields it changes. [`PolarisConfig::validate`]
//! runs before anything is built and reports the first offending field.

#[cfg(feature = "serde")]
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::environment::{ExperimentationConfig, SocialLearningConfig};
use crate::error::{PolarisError, Result};
use crate::network::NetworkConfig;
use crate::types::ActionSpace;

/// Which game to play, with its parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case", tag = "type"))]
pub enum EnvironmentConfig {
    SocialLearning(SocialLearningConfig),
    StrategicExperimentation(ExperimentationConfig),
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig::SocialLearning(SocialLearningConfig::default())
    }
}

impl EnvironmentConfig {
    pub fn num_states(&self) -> usize {
        match self {
            EnvironmentConfig::SocialLearning(c) => c.num_states,
            EnvironmentConfig::StrategicExperimentation(c) => c.num_states(),
        }
    }
}

/// Per-agent model and optimizer settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AgentConfig {
    // --- Belief ---
    /// Decay rates of the belief recurrence, one per timescale.
    pub belief_decays: Vec<f64>,
    /// Number of recent steps kept in the agent's history buffer (K).
    pub history_window: usize,

    // --- Opponent inference ---
    /// Number of recent neighbor actions the inference module conditions on (W).
    pub inference_window: usize,
    /// Dimension of each neighbor's latent policy state.
    pub latent_dim: usize,
    /// Classes allocations are bucketed into for neighbor modelling.
    pub allocation_bins: usize,
    /// Weight of the KL term in the variational objective.
    pub kl_weight: f64,
    /// Feed the inferred opponent summary to actor and critics.
    pub condition_on_opponents: bool,

    // --- Policy ---
    /// Width of hidden layers in actor, critics and inference encoder.
    pub hidden_dim: usize,
    /// Discount factor. Exactly `0.0` selects the average-reward criterion.
    pub discount_factor: f64,
    /// Initial (or fixed) entropy temperature α.
    pub temperature: f64,
    /// Adapt α toward `target_entropy`.
    pub adaptive_temperature: bool,
    /// Entropy target in nats; `None` picks a default for the action space.
    pub target_entropy: Option<f64>,
    /// Polyak rate of the target critics.
    pub tau: f64,
    /// Step size of the running average-reward estimate.
    pub average_reward_step: f64,

    // --- Optimizers ---
    pub belief_lr: f64,
    pub inference_lr: f64,
    pub actor_lr: f64,
    pub critic_lr: f64,
    pub temperature_lr: f64,
    /// Global gradient-norm clip applied to every optimizer.
    pub max_grad_norm: f64,

    // --- Synaptic intelligence ---
    pub use_si: bool,
    /// Strength of the consolidation penalty.
    pub si_importance: f64,
    /// Damping added to squared parameter drift.
    pub si_damping: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            belief_decays: vec![0.5, 0.9, 0.98],
            history_window: 32,
            inference_window: 8,
            latent_dim: 4,
            allocation_bins: 5,
            kl_weight: 0.01,
            condition_on_opponents: true,
            hidden_dim: 32,
            discount_factor: 0.99,
            temperature: 0.2,
            adaptive_temperature: true,
            target_entropy: None,
            tau: 0.005,
            average_reward_step: 0.01,
            belief_lr: 1e-3,
            inference_lr: 1e-3,
            actor_lr: 1e-3,
            critic_lr: 1e-3,
            temperature_lr: 3e-4,
            max_grad_norm: 1.0,
            use_si: false,
            si_importance: 100.0,
            si_damping: 0.1,
        }
    }
}

impl AgentConfig {
    /// Entropy target, falling back to a per-space default: 60% of the
    /// maximum entropy for categorical policies and `-1` (one action
    /// dimension) for allocations.
    pub fn target_entropy_for(&self, space: ActionSpace) -> f64 {
        self.target_entropy.unwrap_or(match space {
            ActionSpace::Discrete { n } => 0.6 * (n.max(1) as f64).ln(),
            ActionSpace::Allocation { .. } => -1.0,
        })
    }

    /// Returns true when the average-reward criterion is selected.
    pub fn average_reward(&self) -> bool {
        self.discount_factor == 0.0
    }

    pub fn validate(&self) -> Result<()> {
        if self.belief_decays.is_empty() {
            return Err(PolarisError::config(
                "agent.belief_decays",
                "need at least one timescale",
            ));
        }
        if let Some(d) = self.belief_decays.iter().find(|d| !(**d > 0.0 && **d < 1.0)) {
            return Err(PolarisError::config(
                "agent.belief_decays",
                format!("decay {} outside (0, 1)", d),
            ));
        }
        positive_count("agent.history_window", self.history_window)?;
        positive_count("agent.inference_window", self.inference_window)?;
        positive_count("agent.latent_dim", self.latent_dim)?;
        positive_count("agent.hidden_dim", self.hidden_dim)?;
        if self.allocation_bins < 2 {
            return Err(PolarisError::config(
                "agent.allocation_bins",
                format!("need at least 2 bins, got {}", self.allocation_bins),
            ));
        }
        if !(self.kl_weight >= 0.0 && self.kl_weight.is_finite()) {
            return Err(PolarisError::config(
                "agent.kl_weight",
                format!("{} must be finite and non-negative", self.kl_weight),
            ));
        }
        if !(0.0..1.0).contains(&self.discount_factor) {
            return Err(PolarisError::config(
                "agent.discount_factor",
                format!("{} outside [0, 1)", self.discount_factor),
            ));
        }
        if !(self.tau > 0.0 && self.tau <= 1.0) {
            return Err(PolarisError::config(
                "agent.tau",
                format!("{} outside (0, 1]", self.tau),
            ));
        }
        if let Some(h) = self.target_entropy {
            if !h.is_finite() {
                return Err(PolarisError::config("agent.target_entropy", "must be finite"));
            }
        }
        positive("agent.temperature", self.temperature)?;
        positive("agent.average_reward_step", self.average_reward_step)?;
        positive("agent.belief_lr", self.belief_lr)?;
        positive("agent.inference_lr", self.inference_lr)?;
        positive("agent.actor_lr", self.actor_lr)?;
        positive("agent.critic_lr", self.critic_lr)?;
        positive("agent.temperature_lr", self.temperature_lr)?;
        positive("agent.max_grad_norm", self.max_grad_norm)?;
        if self.use_si {
            positive("agent.si_importance", self.si_importance)?;
            positive("agent.si_damping", self.si_damping)?;
        }
        Ok(())
    }
}

/// Episode, buffer and update schedule.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrainingConfig {
    pub num_episodes: u32,
    /// Steps per episode.
    pub horizon: u32,
    /// Experience records per gradient step.
    pub batch_size: usize,
    /// Maximum experience records kept per agent.
    pub buffer_capacity: usize,
    /// Steps between update cycles.
    pub update_interval: u32,
    /// Upper bound on agents updated concurrently.
    pub workers: usize,
    /// Steps between progress log lines.
    pub log_interval: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_episodes: 1,
            horizon: 1000,
            batch_size: 32,
            buffer_capacity: 1000,
            update_interval: 10,
            workers: 4,
            log_interval: 100,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        positive_count("training.num_episodes", self.num_episodes as usize)?;
        positive_count("training.horizon", self.horizon as usize)?;
        positive_count("training.batch_size", self.batch_size)?;
        positive_count("training.update_interval", self.update_interval as usize)?;
        positive_count("training.workers", self.workers)?;
        positive_count("training.log_interval", self.log_interval as usize)?;
        if self.buffer_capacity < self.batch_size {
            return Err(PolarisError::config(
                "training.buffer_capacity",
                format!(
                    "capacity {} is smaller than batch size {}",
                    self.buffer_capacity, self.batch_size
                ),
            ));
        }
        Ok(())
    }
}

/// Complete configuration of a run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PolarisConfig {
    pub num_agents: usize,
    pub environment: EnvironmentConfig,
    pub network: NetworkConfig,
    /// Use allocations in `[0, 1]` instead of discrete actions.
    pub continuous_actions: bool,
    pub agent: AgentConfig,
    pub training: TrainingConfig,
    pub seed: u64,
}

impl Default for PolarisConfig {
    fn default() -> Self {
        Self {
            num_agents: 2,
            environment: EnvironmentConfig::default(),
            network: NetworkConfig::default(),
            continuous_actions: false,
            agent: AgentConfig::default(),
            training: TrainingConfig::default(),
            seed: 42,
        }
    }
}

impl PolarisConfig {
    /// Action space implied by the environment and `continuous_actions`.
    pub fn action_space(&self) -> ActionSpace {
        match &self.environment {
            EnvironmentConfig::SocialLearning(c) => ActionSpace::Discrete { n: c.num_states },
            EnvironmentConfig::StrategicExperimentation(_) if self.continuous_actions => {
                ActionSpace::Allocation {
                    bins: self.agent.allocation_bins,
                }
            }
            EnvironmentConfig::StrategicExperimentation(_) => ActionSpace::Discrete { n: 2 },
        }
    }

    /// Checks the whole configuration. Called before any environment or
    /// agent is built.
    pub fn validate(&self) -> Result<()> {
        positive_count("num_agents", self.num_agents)?;
        match &self.environment {
            EnvironmentConfig::SocialLearning(c) => {
                c.validate()?;
                if self.continuous_actions {
                    return Err(PolarisError::config(
                        "continuous_actions",
                        "the social-learning game only supports discrete actions",
                    ));
                }
            }
            EnvironmentConfig::StrategicExperimentation(c) => c.validate()?,
        }
        self.network.validate(self.num_agents)?;
        self.agent.validate()?;
        self.training.validate()
    }

    /// Reads and validates a configuration from a JSON file.
    #[cfg(feature = "serde")]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    #[cfg(feature = "serde")]
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn positive_count(field: &'static str, value: usize) -> Result<()> {
    if value == 0 {
        Err(PolarisError::config(field, "must be at least 1"))
    } else {
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(PolarisError::config(
            field,
            format!("{} must be positive and finite", value),
        ))
    }
}
