//! The collect/update loop.
//!
//! A [`Trainer`] owns the environment and one [`Agent`] per network node.
//! Runs move through [`Phase::Init`], then alternate between
//! [`Phase::Collect`] (every agent acts, the environment steps, every agent
//! observes) and [`Phase::Update`] (every agent with enough experience
//! updates its own modules), and end in [`Phase::Terminated`].
//!
//! Per-agent work runs on a rayon pool sized by
//! [`TrainingConfig::workers`](crate::config::TrainingConfig::workers). Each
//! agent draws from its own random stream, so results do not depend on
//! thread scheduling.

use std::collections::BTreeSet;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use super::cancel::CancellationToken;
#[cfg(feature = "serde")]
use super::checkpoint::Checkpoint;
#[cfg(feature = "serde")]
use super::metrics::LogHeader;
use super::metrics::{EvaluationSummary, LearningBounds, StepMetrics};
use crate::agent::{Agent, AgentUpdate};
use crate::config::PolarisConfig;
use crate::environment::{Environment, SocialEnvironment, StepResult};
use crate::error::{PolarisError, Result};
use crate::policy::{ActionMode, Decision};
use crate::types::{Action, AgentId};
use crate::{generate_run_id, RunId};

/// Offset added to evaluation seeds so they never replay training episodes.
const EVALUATION_SEED_OFFSET: u64 = 1000;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Collect,
    Update,
    Terminated,
}

/// Whether a rollout learns or only measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Sampled actions, updates on schedule, seeds `seed + episode`.
    Train,
    /// Greedy actions, no updates, seeds `seed + episode + 1000`.
    Evaluate,
}

/// Result of [`Trainer::train`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub run_id: RunId,
    /// Episodes completed by this call.
    pub episodes: u32,
    /// Environment steps taken by this call.
    pub steps: u64,
    /// Update cycles run by this call.
    pub updates: u64,
    /// Module steps skipped for non-finite values, over the whole run.
    pub skipped_updates: u64,
    pub cancelled: bool,
    pub summary: EvaluationSummary,
}

/// Result of [`Trainer::quick_evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct QuickEvaluation {
    pub steps: u32,
    /// Mean reward per agent and step.
    pub average_reward: f64,
    /// Mean action accuracy of each agent.
    pub action_accuracy: Vec<f64>,
}

/// Orchestrates one run.
#[derive(Debug)]
pub struct Trainer {
    run_id: RunId,
    config: PolarisConfig,
    env: SocialEnvironment,
    agents: Vec<Agent>,
    pool: ThreadPool,
    cancel: CancellationToken,
    phase: Phase,
    episode: u32,
    total_steps: u64,
    updates: u64,
    seen_states: BTreeSet<usize>,
    bounds: Option<LearningBounds>,
}

impl Trainer {
    /// Validates `config` and builds the environment and agents.
    pub fn new(config: PolarisConfig) -> Result<Self> {
        config.validate()?;
        let env = SocialEnvironment::from_config(&config)?;
        let signal_model = env.signal_model();
        let bounds = LearningBounds::new(&signal_model, config.num_agents);
        let agents = (0..config.num_agents)
            .map(|i| Agent::new(i, &config, signal_model.clone()))
            .collect();
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.training.workers)
            .build()
            .map_err(|e| PolarisError::config("training.workers", e.to_string()))?;
        let run_id = generate_run_id();
        info!(
            run_id = %run_id,
            agents = config.num_agents,
            states = env.num_states(),
            edges = env.network().num_edges(),
            autarky_rate = bounds.map(|b| b.autarky),
            coordination_rate = bounds.map(|b| b.coordination),
            "trainer initialized"
        );
        Ok(Self {
            run_id,
            env,
            agents,
            pool,
            cancel: CancellationToken::new(),
            phase: Phase::Init,
            episode: 0,
            total_steps: 0,
            updates: 0,
            seen_states: BTreeSet::new(),
            bounds,
            config,
        })
    }

    /// Rebuilds a run from a checkpoint: same run id, configuration,
    /// progress counters, parameters and replay buffers. Training resumed
    /// at an episode boundary continues exactly like the uninterrupted run.
    #[cfg(feature = "serde")]
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Result<Self> {
        checkpoint.validate()?;
        let mut trainer = Self::new(checkpoint.config)?;
        for (agent, params) in trainer.agents.iter_mut().zip(checkpoint.agents) {
            agent.load_parameters(params)?;
        }
        for (agent, buffer) in trainer.agents.iter_mut().zip(checkpoint.buffers) {
            agent.restore_buffer(buffer)?;
        }
        trainer.run_id = checkpoint.run_id;
        trainer.episode = checkpoint.episode;
        trainer.total_steps = checkpoint.total_steps;
        trainer.updates = checkpoint.updates;
        trainer.seen_states = checkpoint.seen_states;
        info!(run_id = %trainer.run_id, episode = trainer.episode, "resumed from checkpoint");
        Ok(trainer)
    }

    #[cfg(feature = "serde")]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            run_id: self.run_id.clone(),
            config: self.config.clone(),
            episode: self.episode,
            total_steps: self.total_steps,
            updates: self.updates,
            seen_states: self.seen_states.clone(),
            agents: self.agents.iter().map(Agent::parameters).collect(),
            buffers: self.agents.iter().map(|a| a.buffer().clone()).collect(),
        }
    }

    /// Header for a metrics log of this run.
    #[cfg(feature = "serde")]
    pub fn log_header(&self) -> LogHeader {
        LogHeader {
            run_id: self.run_id.clone(),
            num_agents: self.agents.len(),
            bounds: self.bounds,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &PolarisConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn environment(&self) -> &SocialEnvironment {
        &self.env
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Training episodes completed so far.
    pub fn episode(&self) -> u32 {
        self.episode
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// Update cycles run so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Learning-rate benchmarks of the environment's signal law.
    pub fn learning_bounds(&self) -> Option<LearningBounds> {
        self.bounds
    }

    /// Token that stops the run at the next episode or update-cycle boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Lazily runs `episodes` episodes, yielding one record per step.
    ///
    /// The sequence is finite and cannot be restarted; it stops after the
    /// last episode, on cancellation, or after yielding the first error.
    pub fn rollout(&mut self, mode: RunMode, episodes: u32) -> Rollout<'_> {
        let resume = self.phase;
        Rollout {
            trainer: self,
            mode,
            episodes,
            completed: 0,
            episode: 0,
            in_episode: false,
            cumulative: Vec::new(),
            cancelled: false,
            finished: false,
            resume,
        }
    }

    /// Trains for `training.num_episodes` episodes.
    pub fn train(&mut self) -> Result<TrainingReport> {
        self.train_with(|_| Ok(()))
    }

    /// Trains, handing every step record to `sink` (for example
    /// [`MetricsLog::append`](super::metrics::MetricsLog::append)).
    pub fn train_with<F>(&mut self, mut sink: F) -> Result<TrainingReport>
    where
        F: FnMut(&StepMetrics) -> Result<()>,
    {
        let episodes = self.config.training.num_episodes;
        let (steps_before, updates_before) = (self.total_steps, self.updates);
        info!(run_id = %self.run_id, episodes, "training started");
        let mut metrics = Vec::new();
        let (completed, cancelled) = {
            let mut rollout = self.rollout(RunMode::Train, episodes);
            for record in rollout.by_ref() {
                let record = record?;
                sink(&record)?;
                metrics.push(record);
            }
            (rollout.completed, rollout.cancelled)
        };
        let report = TrainingReport {
            run_id: self.run_id.clone(),
            episodes: completed,
            steps: self.total_steps - steps_before,
            updates: self.updates - updates_before,
            skipped_updates: self.agents.iter().map(Agent::skipped_updates).sum(),
            cancelled,
            summary: EvaluationSummary::from_metrics(&metrics).with_bounds(self.bounds),
        };
        info!(
            run_id = %self.run_id,
            episodes = report.episodes,
            steps = report.steps,
            updates = report.updates,
            skipped = report.skipped_updates,
            cancelled,
            "training finished"
        );
        Ok(report)
    }

    /// Runs `episodes` evaluation episodes without updating anything.
    pub fn evaluate(&mut self, episodes: u32) -> Result<EvaluationSummary> {
        let metrics = self
            .rollout(RunMode::Evaluate, episodes)
            .collect::<Result<Vec<_>>>()?;
        let summary = EvaluationSummary::from_metrics(&metrics).with_bounds(self.bounds);
        for a in &summary.agents {
            info!(
                agent = a.agent,
                reward = a.mean_episode_reward,
                action_accuracy = a.mean_action_accuracy,
                belief_accuracy = a.mean_belief_accuracy,
                belief_mass = a.mean_belief_mass,
                learning_rate = a.learning_rate,
                "evaluation"
            );
        }
        Ok(summary)
    }

    /// Short greedy rollout of at most `steps` steps on the next evaluation
    /// seed, without metrics records or updates.
    pub fn quick_evaluate(&mut self, steps: u32) -> Result<QuickEvaluation> {
        let seed = self
            .config
            .seed
            .wrapping_add(u64::from(self.episode) + EVALUATION_SEED_OFFSET);
        let resume = self.phase;
        self.begin_episode(seed);
        let n = self.agents.len();
        let mut total_reward = 0.0;
        let mut accuracy = vec![0.0; n];
        let mut taken = 0;
        while taken < steps {
            let (_, result) = self.collect_step(ActionMode::Exploit, false)?;
            taken += 1;
            total_reward += result.rewards.iter().sum::<f64>();
            for (acc, a) in accuracy.iter_mut().zip(&result.info.action_accuracy) {
                *acc += a;
            }
            if result.done {
                break;
            }
        }
        self.phase = resume;
        let denom = f64::from(taken.max(1));
        Ok(QuickEvaluation {
            steps: taken,
            average_reward: total_reward / (denom * n.max(1) as f64),
            action_accuracy: accuracy.into_iter().map(|a| a / denom).collect(),
        })
    }

    /// Resets the environment and every agent's random stream on `seed`,
    /// then every agent on its first observation. Nothing random carries
    /// over from one episode to the next, so evaluations between training
    /// episodes leave training untouched.
    fn begin_episode(&mut self, seed: u64) {
        self.env.reseed(seed);
        let observations = self.env.reset();
        for agent in &mut self.agents {
            agent.reseed(seed);
        }
        let network = self.env.network();
        let agents = &mut self.agents;
        self.pool.install(|| {
            agents
                .par_iter_mut()
                .zip(observations.par_iter())
                .for_each(|(agent, obs)| agent.reset(obs, network));
        });
    }

    /// One collect step: decide in parallel, step the environment, observe in
    /// parallel. Transitions go to the replay buffers only when `store` is set.
    fn collect_step(
        &mut self,
        mode: ActionMode,
        store: bool,
    ) -> Result<(Vec<Decision>, StepResult)> {
        self.phase = Phase::Collect;
        let agents = &mut self.agents;
        let decisions: Vec<Decision> = self
            .pool
            .install(|| agents.par_iter_mut().map(|a| a.act(mode)).collect());
        let actions: Vec<Action> = decisions.iter().map(|d| d.action).collect();
        let result = self.env.step(&actions)?;

        let network = self.env.network();
        let agents = &mut self.agents;
        let result_ref = &result;
        let actions_ref = &actions;
        self.pool.install(|| {
            agents.par_iter_mut().enumerate().for_each(|(i, agent)| {
                let observation = &result_ref.observations[i];
                if store {
                    agent.observe(
                        actions_ref[i],
                        result_ref.rewards[i],
                        observation,
                        result_ref.done,
                        network,
                    );
                } else {
                    agent.follow(actions_ref[i], observation, network);
                }
            });
        });
        Ok((decisions, result))
    }

    /// Updates every agent whose buffer holds more than a batch.
    fn update_cycle(&mut self) -> Result<()> {
        let batch_size = self.config.training.batch_size;
        if !self.agents.iter().any(|a| a.buffer().len() > batch_size) {
            return Ok(());
        }
        self.phase = Phase::Update;
        let agents = &mut self.agents;
        let results: Vec<Result<Option<AgentUpdate>>> = self.pool.install(|| {
            agents
                .par_iter_mut()
                .map(|a| {
                    if a.buffer().len() > batch_size {
                        a.update(batch_size).map(Some)
                    } else {
                        Ok(None)
                    }
                })
                .collect()
        });
        let (mut updated, mut skipped) = (0usize, 0u32);
        for result in results {
            if let Some(report) = result? {
                updated += 1;
                skipped += report.skipped;
            }
        }
        self.updates += 1;
        debug!(
            episode = self.episode,
            step = self.env.time_step(),
            agents = updated,
            skipped,
            "update cycle"
        );
        Ok(())
    }
}

/// Lazy, finite sequence of step records; see [`Trainer::rollout`].
#[derive(Debug)]
pub struct Rollout<'a> {
    trainer: &'a mut Trainer,
    mode: RunMode,
    episodes: u32,
    completed: u32,
    /// Episode number reported in records.
    episode: u32,
    in_episode: bool,
    cumulative: Vec<f64>,
    cancelled: bool,
    finished: bool,
    resume: Phase,
}

impl Rollout<'_> {
    /// Episodes completed so far.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Whether the rollout stopped because of cancellation.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    fn finish(&mut self) {
        self.finished = true;
        self.trainer.phase = match self.mode {
            RunMode::Train => Phase::Terminated,
            RunMode::Evaluate => self.resume,
        };
    }

    fn start_episode(&mut self) {
        let t = &mut *self.trainer;
        let (seed, episode) = match self.mode {
            RunMode::Train => (t.config.seed.wrapping_add(u64::from(t.episode)), t.episode),
            RunMode::Evaluate => (
                t.config
                    .seed
                    .wrapping_add(u64::from(self.completed) + EVALUATION_SEED_OFFSET),
                self.completed,
            ),
        };
        t.begin_episode(seed);
        if self.mode == RunMode::Train && t.config.agent.use_si {
            let state = t.env.true_state();
            let first = t.seen_states.is_empty();
            if t.seen_states.insert(state) && !first {
                info!(episode, state, "new latent state, consolidating");
                for agent in &mut t.agents {
                    agent.consolidate();
                }
            }
        }
        self.cumulative = vec![0.0; t.agents.len()];
        self.episode = episode;
        self.in_episode = true;
        info!(run_id = %t.run_id, episode, seed, mode = ?self.mode, "episode started");
    }

    fn advance(&mut self) -> Result<Option<StepMetrics>> {
        if !self.in_episode {
            if self.completed >= self.episodes {
                return Ok(None);
            }
            if self.trainer.cancel.is_cancelled() {
                warn!(run_id = %self.trainer.run_id, "run cancelled at episode boundary");
                self.cancelled = true;
                return Ok(None);
            }
            self.start_episode();
        }
        let action_mode = match self.mode {
            RunMode::Train => ActionMode::Explore,
            RunMode::Evaluate => ActionMode::Exploit,
        };
        let store = self.mode == RunMode::Train;
        let (decisions, result) = self.trainer.collect_step(action_mode, store)?;

        let t = &mut *self.trainer;
        let true_state = t.env.true_state();
        for (total, r) in self.cumulative.iter_mut().zip(&result.rewards) {
            *total += r;
        }
        let step = result.info.time_step;
        let record = StepMetrics {
            episode: self.episode,
            step,
            evaluation: self.mode == RunMode::Evaluate,
            true_state,
            belief_accuracy: t.agents.iter().map(|a| a.belief().accuracy(true_state)).collect(),
            belief_mass: t.agents.iter().map(|a| a.belief().prob(true_state)).collect(),
            action_accuracy: result.info.action_accuracy.clone(),
            allocations: decisions.iter().map(|d| d.allocation).collect(),
            rewards: result.rewards.clone(),
            cumulative_rewards: self.cumulative.clone(),
        };

        if self.mode == RunMode::Train {
            t.total_steps += 1;
            if step % t.config.training.update_interval == 0 {
                if t.cancel.is_cancelled() {
                    warn!(run_id = %t.run_id, step, "run cancelled at update boundary");
                    self.cancelled = true;
                } else {
                    t.update_cycle()?;
                }
            }
        }
        if step % t.config.training.log_interval == 0 {
            info!(
                episode = self.episode,
                step,
                belief_accuracy = record.mean_belief_accuracy(),
                reward = record.mean_reward(),
                "progress"
            );
        }
        if result.done {
            self.in_episode = false;
            self.completed += 1;
            if self.mode == RunMode::Train {
                t.episode += 1;
            }
            let n = self.cumulative.len().max(1) as f64;
            info!(
                episode = self.episode,
                steps = step,
                mean_return = self.cumulative.iter().sum::<f64>() / n,
                "episode finished"
            );
        }
        Ok(Some(record))
    }
}

impl Iterator for Rollout<'_> {
    type Item = Result<StepMetrics>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.cancelled {
            self.finish();
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(e) => {
                self.finished = true;
                self.trainer.phase = Phase::Terminated;
                Some(Err(e))
            }
        }
    }
}
