//! Agent state and learning for one network node.
//!
//! An [`Agent`] owns its modules outright: belief encoder, opponent
//! inference and policy. Nothing here reads or writes another agent's
//! parameters; everything an agent knows about its neighbors arrives
//! through its own observations.

use std::collections::{BTreeMap, VecDeque};

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::belief::{Belief, BeliefEncoder, BeliefSample, BeliefState};
use crate::config::PolarisConfig;
use crate::environment::{Observation, ObservationEncoder, SignalModel};
use crate::error::{PolarisError, Result};
use crate::inference::{
    InferenceLosses, InferenceModule, InferenceSample, NeighborRecord, NeighborhoodView,
    OpponentEstimate,
};
use crate::network::SocialNetwork;
use crate::nn::concat;
use crate::policy::{ActionDistribution, ActionMode, Decision, Policy, PolicyModule, SacLosses, SacSample};
use crate::training::buffer::{Experience, ReplayBuffer};
use crate::types::{Action, ActionSpace, AgentId};

/// Learned parameters of one agent, including optimizer state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AgentParameters {
    pub agent: AgentId,
    pub belief: BeliefEncoder,
    pub inference: InferenceModule,
    pub policy: PolicyModule,
}

/// Outcome of one agent update. When any module step turns non-finite the
/// whole update is discarded and every module reports `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUpdate {
    pub inference: Option<InferenceLosses>,
    pub policy: Option<SacLosses>,
    pub belief: Option<f64>,
    /// Module steps that turned non-finite in this update.
    pub skipped: u32,
}

/// A learning agent embedded in the social network.
#[derive(Debug, Clone)]
pub struct Agent {
    id: AgentId,
    condition_on_opponents: bool,
    observations: ObservationEncoder,
    belief: BeliefEncoder,
    inference: InferenceModule,
    policy: PolicyModule,

    trace: BeliefState,
    /// Encoded observations in the belief window, oldest first.
    window: VecDeque<DVector<f64>>,
    neighbor_actions: BTreeMap<AgentId, VecDeque<usize>>,
    view: NeighborhoodView,
    summary: DVector<f64>,

    buffer: ReplayBuffer<Experience>,
    rng: StdRng,
    skipped: u64,
}

impl Agent {
    /// Creates agent `id` for a validated configuration. The agent is told
    /// the declared signal law, never the latent state.
    pub fn new(id: AgentId, config: &PolarisConfig, signal_model: SignalModel) -> Self {
        let ac = &config.agent;
        let space = config.action_space();
        let mut rng = StdRng::seed_from_u64(agent_seed(config.seed, id));
        let observations = ObservationEncoder::new(signal_model, space);
        let mut belief = BeliefEncoder::new(
            &observations,
            &ac.belief_decays,
            ac.history_window,
            ac.belief_lr,
            ac.max_grad_norm,
        );
        if ac.use_si {
            belief = belief.with_synaptic_intelligence(ac.si_importance, ac.si_damping);
        }
        let inference = InferenceModule::new(
            config.num_agents,
            space.num_classes(),
            ac.inference_window,
            ac.hidden_dim,
            ac.latent_dim,
            ac.kl_weight,
            ac.inference_lr,
            ac.max_grad_norm,
            &mut rng,
        );
        let mut input_dim = observations.num_states();
        if ac.condition_on_opponents {
            input_dim += inference.summary_dim();
        }
        let policy = PolicyModule::new(input_dim, space, ac, &mut rng);
        Self {
            id,
            condition_on_opponents: ac.condition_on_opponents,
            trace: belief.initial_state(),
            window: VecDeque::with_capacity(ac.history_window + 1),
            neighbor_actions: BTreeMap::new(),
            view: NeighborhoodView::default(),
            summary: inference.prior_estimate(),
            buffer: ReplayBuffer::new(config.training.buffer_capacity),
            skipped: 0,
            observations,
            belief,
            inference,
            policy,
            rng,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn action_space(&self) -> ActionSpace {
        self.observations.action_space()
    }

    /// Current belief over latent states.
    pub fn belief(&self) -> Belief {
        self.belief.belief(&self.trace)
    }

    pub fn belief_trace(&self) -> &BeliefState {
        &self.trace
    }

    /// Full posterior over the current neighborhood.
    pub fn opponent_estimate(&self) -> OpponentEstimate {
        self.inference.estimate(&self.view)
    }

    pub fn neighborhood(&self) -> &NeighborhoodView {
        &self.view
    }

    pub fn buffer(&self) -> &ReplayBuffer<Experience> {
        &self.buffer
    }

    /// Replaces the replay buffer with a saved one of the same capacity.
    pub fn restore_buffer(&mut self, buffer: ReplayBuffer<Experience>) -> Result<()> {
        if buffer.capacity() != self.buffer.capacity() {
            return Err(PolarisError::Checkpoint(format!(
                "buffer of capacity {} restored into agent {} with capacity {}",
                buffer.capacity(),
                self.id,
                self.buffer.capacity()
            )));
        }
        self.buffer = buffer;
        Ok(())
    }

    pub fn policy(&self) -> &PolicyModule {
        &self.policy
    }

    /// Module steps skipped because of non-finite values.
    pub fn skipped_updates(&self) -> u64 {
        self.skipped
    }

    fn input_for(&self, trace: &BeliefState, view: &NeighborhoodView) -> DVector<f64> {
        let probs = self.belief.belief(trace).probs;
        if self.condition_on_opponents {
            concat(&[&probs, &self.inference.estimate(view).summary])
        } else {
            probs
        }
    }

    /// Policy input at the current step.
    pub fn policy_input(&self) -> DVector<f64> {
        let probs = self.belief().probs;
        if self.condition_on_opponents {
            concat(&[&probs, &self.summary])
        } else {
            probs
        }
    }

    /// Action distribution at the current step.
    pub fn policy_distribution(&self) -> ActionDistribution {
        self.policy.distribution(&self.policy_input())
    }

    /// Starts an episode from the agent's first observation. The belief
    /// returns to the prior; the replay buffer is kept.
    pub fn reset(&mut self, observation: &Observation, network: &SocialNetwork) {
        self.trace = self.belief.initial_state();
        self.window.clear();
        self.neighbor_actions.clear();
        self.absorb(observation, None, network);
    }

    /// Restarts the agent's private random stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(agent_seed(seed, self.id));
    }

    pub fn act(&mut self, mode: ActionMode) -> Decision {
        let input = self.policy_input();
        self.policy.decide(&input, mode, &mut self.rng)
    }

    /// Absorbs the consequences of `action` and stores the transition.
    pub fn observe(
        &mut self,
        action: Action,
        reward: f64,
        observation: &Observation,
        done: bool,
        network: &SocialNetwork,
    ) {
        let belief = self.trace.clone();
        let view = self.view.clone();
        let space = self.action_space();
        let next_likelihood = self.observations.signal_model().likelihood(observation);
        let next_actions = observation
            .neighbors
            .iter()
            .map(|n| (n.agent, space.class_of(&n.action)))
            .collect();
        self.absorb(observation, Some(&action), network);
        self.buffer.push(Experience {
            belief,
            view,
            action,
            reward,
            next_belief: self.trace.clone(),
            next_view: self.view.clone(),
            next_likelihood,
            next_actions,
            done,
        });
    }

    /// Like [`Agent::observe`] without storing the transition. Used by
    /// evaluation, which must leave training state alone.
    pub fn follow(&mut self, action: Action, observation: &Observation, network: &SocialNetwork) {
        self.absorb(observation, Some(&action), network);
    }

    /// Advances the belief by one observation and refreshes the neighborhood.
    fn absorb(&mut self, observation: &Observation, own: Option<&Action>, network: &SocialNetwork) {
        let x = self.observations.encode(observation, own);
        let dropped = if self.window.len() == self.belief.window() {
            self.window.pop_front()
        } else {
            None
        };
        self.trace = self.belief.advance(&self.trace, &x, dropped.as_ref());
        self.window.push_back(x);

        let space = self.action_space();
        let keep = self.inference.window();
        for n in &observation.neighbors {
            let actions = self.neighbor_actions.entry(n.agent).or_default();
            actions.push_back(space.class_of(&n.action));
            while actions.len() > keep {
                actions.pop_front();
            }
        }
        self.view = NeighborhoodView {
            neighbors: network
                .neighbors(self.id)
                .into_iter()
                .map(|j| NeighborRecord {
                    agent: j,
                    degree: network.degree(j),
                    actions: self
                        .neighbor_actions
                        .get(&j)
                        .map(|a| a.iter().copied().collect())
                        .unwrap_or_default(),
                })
                .collect(),
        };
        self.summary = self.inference.estimate(&self.view).summary;
    }

    /// One training cycle on a sample of the agent's own buffer:
    /// inference first, then the policy on refreshed opponent summaries,
    /// then the belief readout.
    ///
    /// The three modules are staged on working copies and committed
    /// together: if any step turns non-finite it is logged and the agent
    /// keeps its previous parameters. Other errors propagate.
    pub fn update(&mut self, batch_size: usize) -> Result<AgentUpdate> {
        let mut report = AgentUpdate::default();
        let batch = self.buffer.sample(batch_size, &mut self.rng);
        if batch.is_empty() {
            return Ok(report);
        }
        let staged = (self.inference.clone(), self.policy.clone(), self.belief.clone());

        let samples: Vec<InferenceSample<'_>> = batch
            .iter()
            .map(|e| InferenceSample {
                view: &e.view,
                next_actions: &e.next_actions,
            })
            .collect();
        let result = self.inference.update(&samples, &mut self.rng, self.id);
        report.inference = recover(result, self.id, &mut report.skipped)?;

        let samples: Vec<SacSample> = batch
            .iter()
            .map(|e| SacSample {
                state: self.input_for(&e.belief, &e.view),
                action: e.action,
                reward: e.reward,
                next_state: self.input_for(&e.next_belief, &e.next_view),
                done: e.done,
            })
            .collect();
        let result = self.policy.update(&samples, &mut self.rng, self.id);
        report.policy = recover(result, self.id, &mut report.skipped)?;

        let samples: Vec<BeliefSample<'_>> = batch
            .iter()
            .map(|e| BeliefSample {
                state: &e.belief,
                next_likelihood: &e.next_likelihood,
            })
            .collect();
        let result = self.belief.update(&samples, self.id);
        report.belief = recover(result, self.id, &mut report.skipped)?;

        if report.skipped > 0 {
            (self.inference, self.policy, self.belief) = staged;
            report.inference = None;
            report.policy = None;
            report.belief = None;
            warn!(agent = self.id, skipped = report.skipped, "discarding update");
        }
        self.skipped += u64::from(report.skipped);
        self.summary = self.inference.estimate(&self.view).summary;
        debug!(
            agent = self.id,
            elbo = report.inference.map(|l| l.elbo),
            critic = report.policy.map(|l| l.critic),
            exploitation = report.policy.map(|l| l.exploitation),
            exploration = report.policy.map(|l| l.exploration),
            alpha = report.policy.map(|l| l.alpha),
            belief = report.belief,
            "agent update"
        );
        Ok(report)
    }

    /// Consolidates synaptic importance on the actor and belief readout.
    pub fn consolidate(&mut self) {
        self.belief.consolidate();
        self.policy.consolidate();
    }

    pub fn parameters(&self) -> AgentParameters {
        AgentParameters {
            agent: self.id,
            belief: self.belief.clone(),
            inference: self.inference.clone(),
            policy: self.policy.clone(),
        }
    }

    /// Replaces this agent's parameters with a saved set.
    pub fn load_parameters(&mut self, params: AgentParameters) -> Result<()> {
        if params.agent != self.id {
            return Err(PolarisError::Checkpoint(format!(
                "parameters for agent {} loaded into agent {}",
                params.agent, self.id
            )));
        }
        if params.belief.num_states() != self.belief.num_states()
            || params.belief.input_dim() != self.belief.input_dim()
            || params.inference.num_classes() != self.inference.num_classes()
            || params.policy.action_space() != self.policy.action_space()
        {
            return Err(PolarisError::Checkpoint(format!(
                "parameter shapes of agent {} do not match the configuration",
                self.id
            )));
        }
        self.belief = params.belief;
        self.inference = params.inference;
        self.policy = params.policy;
        self.summary = self.inference.estimate(&self.view).summary;
        Ok(())
    }
}

fn agent_seed(seed: u64, id: AgentId) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(id as u64 + 1)
}

/// Turns a numeric-instability error into a skipped step.
fn recover<T>(result: Result<T>, agent: AgentId, skipped: &mut u32) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_recoverable() => {
            warn!(agent, error = %e, "skipping non-finite update");
            *skipped += 1;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentConfig;
    use crate::environment::{Environment, ExperimentationConfig, SocialEnvironment};
    use crate::network::{NetworkConfig, Topology};

    fn config(num_agents: usize, topology: Topology) -> PolarisConfig {
        let mut config = PolarisConfig {
            num_agents,
            ..PolarisConfig::default()
        };
        config.network = NetworkConfig {
            topology,
            ..NetworkConfig::default()
        };
        config.training.buffer_capacity = 50;
        config.agent.hidden_dim = 8;
        config
    }

    fn agents(config: &PolarisConfig, env: &SocialEnvironment) -> Vec<Agent> {
        (0..config.num_agents)
            .map(|i| Agent::new(i, config, env.signal_model()))
            .collect()
    }

    #[test]
    fn rollout_fills_buffer_and_updates() {
        let config = config(3, Topology::Complete);
        let mut env = SocialEnvironment::from_config(&config).unwrap();
        let mut agents = agents(&config, &env);
        let obs = env.reset();
        for (agent, o) in agents.iter_mut().zip(&obs) {
            agent.reset(o, env.network());
        }
        for _ in 0..60 {
            let actions: Vec<Action> = agents
                .iter_mut()
                .map(|a| a.act(ActionMode::Explore).action)
                .collect();
            let result = env.step(&actions).unwrap();
            for (i, agent) in agents.iter_mut().enumerate() {
                agent.observe(
                    actions[i],
                    result.rewards[i],
                    &result.observations[i],
                    result.done,
                    env.network(),
                );
            }
        }
        for agent in &mut agents {
            assert_eq!(agent.buffer().len(), 50);
            assert_eq!(agent.neighborhood().neighbors.len(), 2);
            let report = agent.update(16).unwrap();
            assert_eq!(report.skipped, 0);
            assert!(report.inference.is_some() && report.policy.is_some());
            assert!(report.belief.unwrap().is_finite());
            let belief = agent.belief();
            assert!((belief.probs.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn non_finite_step_discards_whole_update() {
        let config = config(2, Topology::Complete);
        let mut env = SocialEnvironment::from_config(&config).unwrap();
        let mut agents = agents(&config, &env);
        let obs = env.reset();
        for (agent, o) in agents.iter_mut().zip(&obs) {
            agent.reset(o, env.network());
        }
        for _ in 0..20 {
            let actions: Vec<Action> = agents
                .iter_mut()
                .map(|a| a.act(ActionMode::Explore).action)
                .collect();
            let result = env.step(&actions).unwrap();
            for (i, agent) in agents.iter_mut().enumerate() {
                // agent 0 is fed a reward the critic cannot fit
                let reward = if i == 0 { f64::NAN } else { result.rewards[i] };
                agent.observe(actions[i], reward, &result.observations[i], result.done, env.network());
            }
        }

        let before = agents[0].parameters();
        let report = agents[0].update(8).unwrap();
        assert!(report.skipped > 0);
        assert_eq!(report, AgentUpdate { skipped: report.skipped, ..AgentUpdate::default() });
        // inference and belief steps were finite but are rolled back too
        assert_eq!(agents[0].parameters(), before);
        assert_eq!(agents[0].skipped_updates(), u64::from(report.skipped));

        let before = agents[1].parameters();
        let report = agents[1].update(8).unwrap();
        assert_eq!(report.skipped, 0);
        assert_ne!(agents[1].parameters(), before);
    }

    #[test]
    fn restores_buffer_of_matching_capacity() {
        let config = config(2, Topology::Complete);
        let env = SocialEnvironment::from_config(&config).unwrap();
        let mut agent = Agent::new(0, &config, env.signal_model());
        let err = agent.restore_buffer(ReplayBuffer::new(10)).unwrap_err();
        assert!(matches!(err, PolarisError::Checkpoint(_)));
        agent.restore_buffer(ReplayBuffer::new(50)).unwrap();
        assert!(agent.buffer().is_empty());
    }

    #[test]
    fn isolated_agent_uses_prior_summary() {
        let config = config(3, Topology::Custom { edges: vec![(0, 1)] });
        let mut env = SocialEnvironment::from_config(&config).unwrap();
        let mut agents = agents(&config, &env);
        let obs = env.reset();
        for (agent, o) in agents.iter_mut().zip(&obs) {
            agent.reset(o, env.network());
        }
        let isolated = &agents[2];
        assert!(isolated.neighborhood().is_empty());
        let estimate = isolated.opponent_estimate();
        assert_eq!(estimate.summary, isolated.inference.prior_estimate());
        let input = isolated.policy_input();
        assert_eq!(input.len(), 2 + 3);
    }

    #[test]
    fn parameters_round_trip_between_agents() {
        let config = config(2, Topology::Complete);
        let env = SocialEnvironment::from_config(&config).unwrap();
        let source = Agent::new(0, &config, env.signal_model());
        let mut other_config = config.clone();
        other_config.seed = 99;
        let mut target = Agent::new(0, &other_config, env.signal_model());
        assert_ne!(source.parameters(), target.parameters());
        target.load_parameters(source.parameters()).unwrap();
        assert_eq!(source.parameters(), target.parameters());
        assert!(source
            .policy_distribution()
            .max_abs_diff(&target.policy_distribution())
            < 1e-12);
    }

    #[test]
    fn rejects_parameters_of_another_agent() {
        let config = config(2, Topology::Complete);
        let env = SocialEnvironment::from_config(&config).unwrap();
        let a = Agent::new(0, &config, env.signal_model());
        let mut b = Agent::new(1, &config, env.signal_model());
        let err = b.load_parameters(a.parameters()).unwrap_err();
        assert!(matches!(err, PolarisError::Checkpoint(_)));
    }

    #[test]
    fn continuous_agent_acts_in_unit_interval() {
        let mut config = config(2, Topology::Ring);
        config.environment = EnvironmentConfig::StrategicExperimentation(ExperimentationConfig::default());
        config.continuous_actions = true;
        let mut env = SocialEnvironment::from_config(&config).unwrap();
        let mut agents = agents(&config, &env);
        let obs = env.reset();
        for (agent, o) in agents.iter_mut().zip(&obs) {
            agent.reset(o, env.network());
        }
        for agent in &mut agents {
            let decision = agent.act(ActionMode::Explore);
            let share = decision.action.as_allocation().unwrap();
            assert!((0.0..=1.0).contains(&share));
        }
    }
}
