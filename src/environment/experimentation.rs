//! Keller–Rady strategic experimentation game.
//!
//! Each agent splits a unit resource between a safe arm with known flow
//! payoff and a risky arm whose payoff process depends on the latent state:
//! a Brownian component with state-dependent drift plus compound Poisson
//! jumps. Payoffs of neighbors are public, so experimentation by one agent
//! is information for everyone who observes it. A weak public background
//! signal keeps beliefs moving when nobody experiments.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson, StandardNormal};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::reward::RewardComputer;
use super::signal::SignalModel;
use super::{
    check_arity, Environment, NeighborSignal, Observation, Outcome, PrivateSignal, StepInfo,
    StepResult,
};
use crate::error::{PolarisError, Result};
use crate::network::{NetworkConfig, SocialNetwork};
use crate::types::{Action, ActionSpace, AgentId};

/// Parameters of the experimentation game. Per-state vectors are indexed by
/// latent state (state 0 is conventionally the bad state).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExperimentationConfig {
    /// Flow payoff of the safe arm per unit time.
    pub safe_payoff: f64,
    /// Drift of the risky arm's Brownian payoff, per state.
    pub drift_rates: Vec<f64>,
    /// Poisson jump intensity of the risky arm, per state.
    pub jump_rates: Vec<f64>,
    /// Payoff of a single jump, per state.
    pub jump_sizes: Vec<f64>,
    /// Volatility of the Brownian payoff.
    pub diffusion_sigma: f64,
    /// Drift multiplier of the public background signal.
    pub background_informativeness: f64,
    /// Length of one step in continuous time.
    pub time_step: f64,
}

impl Default for ExperimentationConfig {
    fn default() -> Self {
        Self {
            safe_payoff: 0.5,
            drift_rates: vec![0.0, 1.0],
            jump_rates: vec![0.0, 0.1],
            jump_sizes: vec![1.0, 1.0],
            diffusion_sigma: 0.1,
            background_informativeness: 0.001,
            time_step: 1.0,
        }
    }
}

impl ExperimentationConfig {
    pub fn num_states(&self) -> usize {
        self.drift_rates.len()
    }

    /// Expected risky-arm payoff per unit time in `state`.
    pub fn risky_payoff(&self, state: usize) -> f64 {
        self.drift_rates[state] + self.jump_rates[state] * self.jump_sizes[state]
    }

    /// Full-information optimal allocation in `state`.
    pub fn optimal_allocation(&self, state: usize) -> f64 {
        if self.risky_payoff(state) > self.safe_payoff {
            1.0
        } else {
            0.0
        }
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.drift_rates.len();
        if n < 2 {
            return Err(PolarisError::config(
                "environment.drift_rates",
                format!("need at least 2 states, got {}", n),
            ));
        }
        if self.jump_rates.len() != n || self.jump_sizes.len() != n {
            return Err(PolarisError::config(
                "environment.jump_rates",
                format!(
                    "drift, jump rate and jump size vectors must have equal length ({}, {}, {})",
                    n,
                    self.jump_rates.len(),
                    self.jump_sizes.len()
                ),
            ));
        }
        if self.jump_rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(PolarisError::config(
                "environment.jump_rates",
                "jump rates must be finite and non-negative",
            ));
        }
        let finite = self
            .drift_rates
            .iter()
            .chain(&self.jump_sizes)
            .chain([&self.safe_payoff, &self.background_informativeness])
            .all(|v| v.is_finite());
        if !finite {
            return Err(PolarisError::config(
                "environment",
                "payoff parameters must be finite",
            ));
        }
        if !(self.diffusion_sigma > 0.0 && self.diffusion_sigma.is_finite()) {
            return Err(PolarisError::config(
                "environment.diffusion_sigma",
                format!("{} must be positive", self.diffusion_sigma),
            ));
        }
        if !(self.time_step > 0.0 && self.time_step.is_finite()) {
            return Err(PolarisError::config(
                "environment.time_step",
                format!("{} must be positive", self.time_step),
            ));
        }
        Ok(())
    }
}

/// The strategic experimentation environment.
#[derive(Debug, Clone)]
pub struct StrategicExperimentation {
    config: ExperimentationConfig,
    num_agents: usize,
    horizon: u32,
    action_space: ActionSpace,
    network_config: NetworkConfig,
    network: SocialNetwork,
    state: usize,
    t: u32,
    rng: StdRng,
    seed: u64,
}

impl StrategicExperimentation {
    pub fn new(
        config: ExperimentationConfig,
        num_agents: usize,
        horizon: u32,
        action_space: ActionSpace,
        network_config: NetworkConfig,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        match action_space {
            ActionSpace::Discrete { n: 2 } | ActionSpace::Allocation { .. } => {}
            ActionSpace::Discrete { n } => {
                return Err(PolarisError::config(
                    "continuous_actions",
                    format!("discrete experimentation uses 2 actions (safe, risky), got {}", n),
                ))
            }
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let network = SocialNetwork::build(num_agents, &network_config, &mut rng)?;
        Ok(Self {
            config,
            num_agents,
            horizon,
            action_space,
            network_config,
            network,
            state: 0,
            t: 0,
            rng,
            seed,
        })
    }

    pub fn config(&self) -> &ExperimentationConfig {
        &self.config
    }

    fn normal(&mut self) -> f64 {
        StandardNormal.sample(&mut self.rng)
    }

    fn draw_outcome(&mut self, allocation: f64) -> Outcome {
        if allocation <= 0.0 {
            return Outcome::idle();
        }
        let dt = self.config.time_step;
        let drift = self.config.drift_rates[self.state];
        let sigma = self.config.diffusion_sigma;
        let diffusion = allocation * drift * dt + sigma * (allocation * dt).sqrt() * self.normal();
        let rate = allocation * self.config.jump_rates[self.state] * dt;
        let jumps = match Poisson::new(rate) {
            Ok(poisson) => poisson.sample(&mut self.rng) as u32,
            Err(_) => 0,
        };
        Outcome {
            allocation,
            diffusion,
            jumps,
        }
    }

    fn draw_background(&mut self) -> f64 {
        let dt = self.config.time_step;
        self.config.background_informativeness * self.config.drift_rates[self.state] * dt
            + self.config.diffusion_sigma * dt.sqrt() * self.normal()
    }

    fn allocation_of(&self, agent: AgentId, action: &Action) -> Result<f64> {
        match (self.action_space, action) {
            (ActionSpace::Allocation { .. }, Action::Allocation(x)) => {
                if x.is_finite() && (0.0..=1.0).contains(x) {
                    Ok(*x)
                } else {
                    Err(PolarisError::env(
                        Some(agent),
                        format!("allocation {} outside [0, 1]", x),
                    ))
                }
            }
            (ActionSpace::Discrete { .. }, Action::Discrete(a)) => match a {
                0 => Ok(0.0),
                1 => Ok(1.0),
                _ => Err(PolarisError::env(
                    Some(agent),
                    format!("action {} out of range, expected 0 (safe) or 1 (risky)", a),
                )),
            },
            (ActionSpace::Allocation { .. }, Action::Discrete(_)) => Err(PolarisError::env(
                Some(agent),
                "expected an allocation, got a discrete action",
            )),
            (ActionSpace::Discrete { .. }, Action::Allocation(_)) => Err(PolarisError::env(
                Some(agent),
                "expected a discrete action, got an allocation",
            )),
        }
    }

    fn observations(
        &self,
        background: f64,
        previous: Option<(&[Action], &[Outcome])>,
    ) -> Vec<Observation> {
        (0..self.num_agents)
            .map(|i| {
                let (own, neighbors) = match previous {
                    Some((actions, outcomes)) => (
                        outcomes[i],
                        self.network
                            .neighbors(i)
                            .into_iter()
                            .map(|j| NeighborSignal {
                                agent: j,
                                action: actions[j],
                                outcome: Some(outcomes[j]),
                            })
                            .collect(),
                    ),
                    None => (Outcome::idle(), Vec::new()),
                };
                Observation {
                    agent: i,
                    time_step: self.t,
                    signal: PrivateSignal::Experiment { background, own },
                    neighbors,
                }
            })
            .collect()
    }
}

impl Environment for StrategicExperimentation {
    fn num_agents(&self) -> usize {
        self.num_agents
    }

    fn num_states(&self) -> usize {
        self.config.num_states()
    }

    fn action_space(&self) -> ActionSpace {
        self.action_space
    }

    fn signal_model(&self) -> SignalModel {
        SignalModel::Experimentation {
            drift_rates: self.config.drift_rates.clone(),
            jump_rates: self.config.jump_rates.clone(),
            jump_sizes: self.config.jump_sizes.clone(),
            diffusion_sigma: self.config.diffusion_sigma,
            background_informativeness: self.config.background_informativeness,
            time_step: self.config.time_step,
        }
    }

    fn network(&self) -> &SocialNetwork {
        &self.network
    }

    fn true_state(&self) -> usize {
        self.state
    }

    fn time_step(&self) -> u32 {
        self.t
    }

    fn horizon(&self) -> u32 {
        self.horizon
    }

    fn reseed(&mut self, seed: u64) {
        self.seed = seed;
    }

    fn reset(&mut self) -> Vec<Observation> {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.seed = self.seed.wrapping_add(1);
        self.t = 0;
        if self.network_config.resamples() {
            if let Ok(net) =
                SocialNetwork::build(self.num_agents, &self.network_config, &mut self.rng)
            {
                self.network = net;
            }
        }
        self.state = self.rng.gen_range(0..self.config.num_states());
        let background = self.draw_background();
        self.observations(background, None)
    }

    fn step(&mut self, joint_action: &[Action]) -> Result<StepResult> {
        check_arity(joint_action, self.num_agents)?;
        let allocations = joint_action
            .iter()
            .enumerate()
            .map(|(i, a)| self.allocation_of(i, a))
            .collect::<Result<Vec<_>>>()?;

        let outcomes: Vec<Outcome> = allocations.iter().map(|&a| self.draw_outcome(a)).collect();
        let jump_size = self.config.jump_sizes[self.state];
        let rewards = outcomes
            .iter()
            .map(|o| {
                RewardComputer::allocation_reward(
                    o,
                    jump_size,
                    self.config.safe_payoff,
                    self.config.time_step,
                )
            })
            .collect();
        let action_accuracy = allocations
            .iter()
            .map(|&a| RewardComputer::allocation_accuracy(a, self.config.optimal_allocation(self.state)))
            .collect();
        let background = self.draw_background();

        self.t += 1;
        Ok(StepResult {
            observations: self.observations(background, Some((joint_action, &outcomes))),
            rewards,
            done: self.t >= self.horizon,
            info: StepInfo {
                time_step: self.t,
                true_state: self.state,
                action_accuracy,
            },
        })
    }

    fn action_accuracy(&self, action: &Action) -> f64 {
        let allocation = match action {
            Action::Allocation(x) => x.clamp(0.0, 1.0),
            Action::Discrete(a) => (*a).min(1) as f64,
        };
        RewardComputer::allocation_accuracy(allocation, self.config.optimal_allocation(self.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_env(action_space: ActionSpace) -> StrategicExperimentation {
        StrategicExperimentation::new(
            ExperimentationConfig::default(),
            2,
            20,
            action_space,
            NetworkConfig::default(),
            3,
        )
        .unwrap()
    }

    #[test]
    fn allocations_drive_outcomes() {
        let mut env = make_env(ActionSpace::Allocation { bins: 5 });
        env.reset();
        let result = env
            .step(&[Action::Allocation(0.0), Action::Allocation(1.0)])
            .unwrap();
        match &result.observations[0].signal {
            PrivateSignal::Experiment { own, .. } => assert_eq!(*own, Outcome::idle()),
            other => panic!("unexpected signal {:?}", other),
        }
        let seen = &result.observations[0].neighbors[0];
        assert_eq!(seen.agent, 1);
        assert_eq!(seen.outcome.map(|o| o.allocation), Some(1.0));
        // safe arm pays exactly the flow payoff
        assert!((result.rewards[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn risky_payoff_tracks_state() {
        let mut env = make_env(ActionSpace::Allocation { bins: 5 });
        let mut good = Vec::new();
        let mut bad = Vec::new();
        for _ in 0..20 {
            env.reset();
            let r = env
                .step(&[Action::Allocation(1.0), Action::Allocation(1.0)])
                .unwrap();
            let mean = r.rewards.iter().sum::<f64>() / 2.0;
            if env.true_state() == 1 {
                good.push(mean);
            } else {
                bad.push(mean);
            }
        }
        assert!(!good.is_empty() && !bad.is_empty());
        let avg = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        assert!(avg(&good) > 0.7);
        assert!(avg(&bad) < 0.3);
    }

    #[test]
    fn discrete_mode_maps_to_safe_or_risky() {
        let mut env = make_env(ActionSpace::Discrete { n: 2 });
        env.reset();
        assert!(env.step(&[Action::Discrete(0), Action::Discrete(1)]).is_ok());
        assert!(matches!(
            env.step(&[Action::Discrete(2), Action::Discrete(1)]),
            Err(PolarisError::Environment { agent: Some(0), .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_and_wrong_kind() {
        let mut env = make_env(ActionSpace::Allocation { bins: 5 });
        env.reset();
        assert!(matches!(
            env.step(&[Action::Allocation(0.5), Action::Allocation(1.5)]),
            Err(PolarisError::Environment { agent: Some(1), .. })
        ));
        assert!(matches!(
            env.step(&[Action::Discrete(1), Action::Allocation(0.5)]),
            Err(PolarisError::Environment { agent: Some(0), .. })
        ));
        assert!(env
            .step(&[Action::Allocation(f64::NAN), Action::Allocation(0.5)])
            .is_err());
    }

    #[test]
    fn allocation_accuracy_against_optimum() {
        let mut env = make_env(ActionSpace::Allocation { bins: 5 });
        env.reset();
        let optimum = env.config().optimal_allocation(env.true_state());
        assert_eq!(env.action_accuracy(&Action::Allocation(optimum)), 1.0);
        assert!((env.action_accuracy(&Action::Allocation(0.5)) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn config_validation() {
        let mut config = ExperimentationConfig::default();
        config.jump_sizes.pop();
        assert!(config.validate().is_err());
        let config = ExperimentationConfig {
            diffusion_sigma: 0.0,
            ..ExperimentationConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ExperimentationConfig::default().validate().is_ok());
    }
}
