//! Discrete-state social-learning game.
//!
//! A latent state `θ ∈ {0, …, S-1}` is drawn at reset. Every step each agent
//! receives a private signal equal to `θ` with probability `q` (otherwise a
//! uniformly drawn wrong state), guesses the state, and observes its
//! neighbors' previous guesses. The reward for a guess is an unbiased,
//! signal-based estimate of `1[a = θ]`, so agents never learn `θ` from
//! rewards faster than from signals.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::reward::RewardComputer;
use super::signal::SignalModel;
use super::{
    check_arity, Environment, NeighborSignal, Observation, PrivateSignal, StepInfo, StepResult,
};
use crate::error::{PolarisError, Result};
use crate::network::{NetworkConfig, SocialNetwork};
use crate::types::{Action, ActionSpace, AgentId};

/// Parameters of the social-learning game.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SocialLearningConfig {
    /// Number of latent states `S`.
    pub num_states: usize,
    /// Probability `q` that a private signal reports the true state.
    pub signal_accuracy: f64,
    /// Per-step probability that the latent state switches.
    pub state_switch_probability: f64,
}

impl Default for SocialLearningConfig {
    fn default() -> Self {
        Self {
            num_states: 2,
            signal_accuracy: 0.75,
            state_switch_probability: 0.0,
        }
    }
}

impl SocialLearningConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_states < 2 {
            return Err(PolarisError::config(
                "environment.num_states",
                format!("need at least 2 states, got {}", self.num_states),
            ));
        }
        let chance = 1.0 / self.num_states as f64;
        if !(self.signal_accuracy > chance && self.signal_accuracy <= 1.0) {
            return Err(PolarisError::config(
                "environment.signal_accuracy",
                format!(
                    "{} must lie in ({:.3}, 1] for {} states",
                    self.signal_accuracy, chance, self.num_states
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.state_switch_probability) {
            return Err(PolarisError::config(
                "environment.state_switch_probability",
                format!("{} outside [0, 1]", self.state_switch_probability),
            ));
        }
        Ok(())
    }
}

/// The social-learning environment.
#[derive(Debug, Clone)]
pub struct SocialLearning {
    config: SocialLearningConfig,
    num_agents: usize,
    horizon: u32,
    network_config: NetworkConfig,
    network: SocialNetwork,
    state: usize,
    signals: Vec<usize>,
    t: u32,
    rng: StdRng,
    seed: u64,
}

impl SocialLearning {
    pub fn new(
        config: SocialLearningConfig,
        num_agents: usize,
        horizon: u32,
        network_config: NetworkConfig,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let network = SocialNetwork::build(num_agents, &network_config, &mut rng)?;
        Ok(Self {
            config,
            num_agents,
            horizon,
            network_config,
            network,
            state: 0,
            signals: vec![0; num_agents],
            t: 0,
            rng,
            seed,
        })
    }

    pub fn config(&self) -> &SocialLearningConfig {
        &self.config
    }

    fn draw_signal(&mut self) -> usize {
        let s = self.config.num_states;
        if self.rng.gen_bool(self.config.signal_accuracy) {
            self.state
        } else {
            // uniform over the S-1 wrong states
            let k = self.rng.gen_range(0..s - 1);
            if k >= self.state {
                k + 1
            } else {
                k
            }
        }
    }

    fn observations(&self, previous: Option<&[Action]>) -> Vec<Observation> {
        (0..self.num_agents)
            .map(|i| Observation {
                agent: i,
                time_step: self.t,
                signal: PrivateSignal::State(self.signals[i]),
                neighbors: match previous {
                    Some(actions) => self
                        .network
                        .neighbors(i)
                        .into_iter()
                        .map(|j| NeighborSignal {
                            agent: j,
                            action: actions[j],
                            outcome: None,
                        })
                        .collect(),
                    None => Vec::new(),
                },
            })
            .collect()
    }

    fn validate_action(&self, agent: AgentId, action: &Action) -> Result<usize> {
        match action {
            Action::Discrete(a) if *a < self.config.num_states => Ok(*a),
            Action::Discrete(a) => Err(PolarisError::env(
                Some(agent),
                format!(
                    "action {} out of range for {} states",
                    a, self.config.num_states
                ),
            )),
            Action::Allocation(_) => Err(PolarisError::env(
                Some(agent),
                "social-learning game expects discrete actions, got an allocation",
            )),
        }
    }
}

impl Environment for SocialLearning {
    fn num_agents(&self) -> usize {
        self.num_agents
    }

    fn num_states(&self) -> usize {
        self.config.num_states
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete {
            n: self.config.num_states,
        }
    }

    fn signal_model(&self) -> SignalModel {
        SignalModel::Discrete {
            num_states: self.config.num_states,
            accuracy: self.config.signal_accuracy,
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
            // Validated at construction, so rebuilding cannot fail.
            if let Ok(net) =
                SocialNetwork::build(self.num_agents, &self.network_config, &mut self.rng)
            {
                self.network = net;
            }
        }
        self.state = self.rng.gen_range(0..self.config.num_states);
        self.signals = (0..self.num_agents).map(|_| self.draw_signal()).collect();
        self.observations(None)
    }

    fn step(&mut self, joint_action: &[Action]) -> Result<StepResult> {
        check_arity(joint_action, self.num_agents)?;
        let guesses = joint_action
            .iter()
            .enumerate()
            .map(|(i, a)| self.validate_action(i, a))
            .collect::<Result<Vec<_>>>()?;

        // Outcomes of this step are fresh signals about the current state.
        let realized: Vec<usize> = (0..self.num_agents).map(|_| self.draw_signal()).collect();
        let rewards = guesses
            .iter()
            .zip(&realized)
            .map(|(&a, &signal)| {
                RewardComputer::signal_reward(
                    a,
                    signal,
                    self.config.num_states,
                    self.config.signal_accuracy,
                )
            })
            .collect();
        let action_accuracy = guesses
            .iter()
            .map(|&a| if a == self.state { 1.0 } else { 0.0 })
            .collect();
        self.signals = realized;

        if self.config.state_switch_probability > 0.0
            && self.rng.gen_bool(self.config.state_switch_probability)
        {
            let k = self.rng.gen_range(0..self.config.num_states - 1);
            self.state = if k >= self.state { k + 1 } else { k };
        }

        self.t += 1;
        Ok(StepResult {
            observations: self.observations(Some(joint_action)),
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
        match action.as_discrete() {
            Some(a) if a == self.state => 1.0,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_env(num_states: usize, accuracy: f64) -> SocialLearning {
        let config = SocialLearningConfig {
            num_states,
            signal_accuracy: accuracy,
            state_switch_probability: 0.0,
        };
        SocialLearning::new(config, 3, 50, NetworkConfig::default(), 7).unwrap()
    }

    #[test]
    fn reset_returns_signals_without_neighbor_actions() {
        let mut env = make_env(3, 0.8);
        let obs = env.reset();
        assert_eq!(obs.len(), 3);
        for (i, o) in obs.iter().enumerate() {
            assert_eq!(o.agent, i);
            assert!(o.neighbors.is_empty());
            assert!(matches!(o.signal, PrivateSignal::State(s) if s < 3));
        }
    }

    #[test]
    fn step_reveals_neighbor_actions() {
        let mut env = make_env(3, 0.8);
        env.reset();
        let joint = vec![Action::Discrete(0), Action::Discrete(1), Action::Discrete(2)];
        let result = env.step(&joint).unwrap();
        let seen: Vec<_> = result.observations[0]
            .neighbors
            .iter()
            .map(|n| (n.agent, n.action))
            .collect();
        assert_eq!(seen, vec![(1, Action::Discrete(1)), (2, Action::Discrete(2))]);
        assert_eq!(result.info.time_step, 1);
    }

    #[test]
    fn signals_match_accuracy() {
        let mut env = make_env(3, 0.8);
        env.reset();
        let joint = vec![Action::Discrete(0); 3];
        let mut hits = 0usize;
        let mut total = 0usize;
        for _ in 0..2000 {
            let result = env.step(&joint).unwrap();
            for o in &result.observations {
                if o.signal == PrivateSignal::State(env.true_state()) {
                    hits += 1;
                }
                total += 1;
            }
            if result.done {
                env.reset();
            }
        }
        let freq = hits as f64 / total as f64;
        assert!((freq - 0.8).abs() < 0.03, "signal accuracy {}", freq);
    }

    #[test]
    fn rewards_estimate_correctness() {
        let mut env = make_env(2, 0.75);
        env.reset();
        let mut total = [0.0, 0.0];
        let mut count = 0.0;
        for _ in 0..4000 {
            let truth = env.true_state();
            let joint = vec![
                Action::Discrete(truth),
                Action::Discrete(1 - truth),
                Action::Discrete(truth),
            ];
            let result = env.step(&joint).unwrap();
            total[0] += result.rewards[0];
            total[1] += result.rewards[1];
            count += 1.0;
            if result.done {
                env.reset();
            }
        }
        assert!((total[0] / count - 1.0).abs() < 0.1);
        assert!((total[1] / count).abs() < 0.1);
    }

    #[test]
    fn malformed_actions_are_rejected() {
        let mut env = make_env(3, 0.8);
        env.reset();
        let out_of_range = vec![Action::Discrete(0), Action::Discrete(3), Action::Discrete(0)];
        assert!(matches!(
            env.step(&out_of_range),
            Err(PolarisError::Environment { agent: Some(1), .. })
        ));
        let wrong_kind = vec![Action::Discrete(0), Action::Discrete(0), Action::Allocation(0.2)];
        assert!(matches!(
            env.step(&wrong_kind),
            Err(PolarisError::Environment { agent: Some(2), .. })
        ));
        assert_eq!(env.time_step(), 0);
    }

    #[test]
    fn rejects_uninformative_signals() {
        let config = SocialLearningConfig {
            num_states: 3,
            signal_accuracy: 0.3,
            state_switch_probability: 0.0,
        };
        assert!(SocialLearning::new(config, 2, 10, NetworkConfig::default(), 0).is_err());
    }

    #[test]
    fn switching_hazard_changes_state() {
        let config = SocialLearningConfig {
            num_states: 2,
            signal_accuracy: 0.9,
            state_switch_probability: 1.0,
        };
        let mut env = SocialLearning::new(config, 2, 10, NetworkConfig::default(), 1).unwrap();
        env.reset();
        let before = env.true_state();
        env.step(&[Action::Discrete(0), Action::Discrete(0)]).unwrap();
        assert_ne!(before, env.true_state());
    }
}
