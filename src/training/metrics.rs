//! Per-step metrics, JSON-lines logs and evaluation summaries.
//!
//! The trainer yields one [`StepMetrics`] per environment step. Written with
//! [`MetricsLog`], a run can be summarized again later from disk alone.

use std::collections::BTreeMap;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::environment::SignalModel;
use crate::types::AgentId;

/// What every agent experienced at one environment step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepMetrics {
    pub episode: u32,
    /// Environment time after the step, starting at 1.
    pub step: u32,
    pub evaluation: bool,
    pub true_state: usize,
    /// 1 where an agent's most likely state is the true state, else 0.
    pub belief_accuracy: Vec<f64>,
    /// Probability mass each agent's belief puts on the true state.
    pub belief_mass: Vec<f64>,
    pub action_accuracy: Vec<f64>,
    /// Expected risky share, where the action space has one.
    pub allocations: Vec<Option<f64>>,
    pub rewards: Vec<f64>,
    /// Reward accumulated by each agent since the episode started.
    pub cumulative_rewards: Vec<f64>,
}

impl StepMetrics {
    pub fn num_agents(&self) -> usize {
        self.rewards.len()
    }

    pub fn mean_belief_accuracy(&self) -> f64 {
        mean(&self.belief_accuracy)
    }

    pub fn mean_reward(&self) -> f64 {
        mean(&self.rewards)
    }
}

/// Exponential rate at which the mass on wrong states decays: minus the
/// least-squares slope of `ln(1 - b_t)` against `t`, where `b_t` is the
/// mass on the true state.
///
/// Returns `None` for fewer than two points.
pub fn learning_rate(belief_mass: &[f64]) -> Option<f64> {
    let n = belief_mass.len();
    if n < 2 {
        return None;
    }
    let ys: Vec<f64> = belief_mass
        .iter()
        .map(|b| (1.0 - b).max(1e-12).ln())
        .collect();
    let t_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(&ys);
    let (mut cov, mut var) = (0.0, 0.0);
    for (t, y) in ys.iter().enumerate() {
        let dt = t as f64 - t_mean;
        cov += dt * (y - y_mean);
        var += dt * dt;
    }
    Some(-cov / var)
}

/// Benchmarks for [`learning_rate`] implied by the declared signal law.
///
/// The autarky rate is the smallest per-step KL divergence between the
/// private-signal laws of two states: the rate a lone Bayesian agent reaches
/// in the hardest state. The coordination rate pools the private signals of
/// every agent, so it is `num_agents` times larger.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LearningBounds {
    pub autarky: f64,
    pub coordination: f64,
}

impl LearningBounds {
    /// Returns `None` when the law has a single state or signals that
    /// separate every pair of states perfectly.
    pub fn new(model: &SignalModel, num_agents: usize) -> Option<Self> {
        let autarky = model.min_divergence()?;
        Some(Self {
            autarky,
            coordination: autarky * num_agents as f64,
        })
    }
}

/// Aggregate performance of one agent.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AgentSummary {
    pub agent: AgentId,
    /// Mean total reward per episode.
    pub mean_episode_reward: f64,
    pub std_episode_reward: f64,
    pub mean_action_accuracy: f64,
    pub mean_belief_accuracy: f64,
    pub mean_belief_mass: f64,
    /// Mean over episodes of [`learning_rate`].
    pub learning_rate: Option<f64>,
}

/// Aggregated metrics over one or more episodes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EvaluationSummary {
    pub episodes: usize,
    pub steps: usize,
    pub agents: Vec<AgentSummary>,
    /// Learning-rate benchmarks of the environment, when known.
    pub bounds: Option<LearningBounds>,
}

impl EvaluationSummary {
    /// Summarizes a sequence of step records.
    pub fn from_metrics<'a, I>(metrics: I) -> Self
    where
        I: IntoIterator<Item = &'a StepMetrics>,
    {
        // episode -> per-agent step series
        let mut episodes: BTreeMap<u32, Vec<&StepMetrics>> = BTreeMap::new();
        let mut steps = 0;
        for m in metrics {
            episodes.entry(m.episode).or_default().push(m);
            steps += 1;
        }
        let num_agents = episodes
            .values()
            .flatten()
            .map(|m| m.num_agents())
            .max()
            .unwrap_or(0);

        let agents = (0..num_agents)
            .map(|agent| {
                let mut totals = Vec::with_capacity(episodes.len());
                let mut rates = Vec::new();
                let (mut action_acc, mut belief_acc, mut mass, mut count) = (0.0, 0.0, 0.0, 0usize);
                for records in episodes.values() {
                    let mut total = 0.0;
                    let mut masses = Vec::with_capacity(records.len());
                    for m in records {
                        if agent >= m.num_agents() {
                            continue;
                        }
                        total += m.rewards[agent];
                        action_acc += m.action_accuracy.get(agent).copied().unwrap_or(0.0);
                        belief_acc += m.belief_accuracy.get(agent).copied().unwrap_or(0.0);
                        let b = m.belief_mass.get(agent).copied().unwrap_or(0.0);
                        mass += b;
                        masses.push(b);
                        count += 1;
                    }
                    totals.push(total);
                    if let Some(rate) = learning_rate(&masses) {
                        rates.push(rate);
                    }
                }
                let count = count.max(1) as f64;
                let mean_episode_reward = mean(&totals);
                let std_episode_reward = (totals
                    .iter()
                    .map(|t| (t - mean_episode_reward).powi(2))
                    .sum::<f64>()
                    / totals.len().max(1) as f64)
                    .sqrt();
                AgentSummary {
                    agent,
                    mean_episode_reward,
                    std_episode_reward,
                    mean_action_accuracy: action_acc / count,
                    mean_belief_accuracy: belief_acc / count,
                    mean_belief_mass: mass / count,
                    learning_rate: (!rates.is_empty()).then(|| mean(&rates)),
                }
            })
            .collect();

        Self {
            episodes: episodes.len(),
            steps,
            agents,
            bounds: None,
        }
    }

    /// Attaches learning-rate benchmarks.
    pub fn with_bounds(mut self, bounds: Option<LearningBounds>) -> Self {
        self.bounds = bounds;
        self
    }
}

impl fmt::Display for EvaluationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "=== Evaluation Summary ({} episodes, {} steps) ===",
            self.episodes, self.steps
        )?;
        for a in &self.agents {
            write!(
                f,
                "  Agent {:>3}: reward {:.2} ± {:.2}, action acc {:.3}, belief acc {:.3}",
                a.agent,
                a.mean_episode_reward,
                a.std_episode_reward,
                a.mean_action_accuracy,
                a.mean_belief_accuracy
            )?;
            match a.learning_rate {
                Some(rate) => writeln!(f, ", learning rate {:.4}", rate)?,
                None => writeln!(f)?,
            }
        }
        if let Some(b) = &self.bounds {
            writeln!(
                f,
                "  Bounds: autarky rate {:.4}, coordination rate {:.4}",
                b.autarky, b.coordination
            )?;
        }
        Ok(())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(feature = "serde")]
pub use jsonl::{LogHeader, MetricsLog, MetricsReplay};

#[cfg(feature = "serde")]
mod jsonl {
    use std::fs::File;
    use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
    use std::path::Path;

    use serde::{Deserialize, Serialize};

    use super::{LearningBounds, StepMetrics};
    use crate::error::{PolarisError, Result};
    use crate::RunId;

    /// First line of every metrics log.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LogHeader {
        pub run_id: RunId,
        pub num_agents: usize,
        #[serde(default)]
        pub bounds: Option<LearningBounds>,
    }

    /// JSON-lines writer: a [`LogHeader`] followed by one [`StepMetrics`]
    /// per line.
    #[derive(Debug)]
    pub struct MetricsLog {
        writer: BufWriter<File>,
        written: u64,
    }

    impl MetricsLog {
        pub fn create(path: impl AsRef<Path>, header: &LogHeader) -> Result<Self> {
            let mut writer = BufWriter::new(File::create(path)?);
            serde_json::to_writer(&mut writer, header)?;
            writer.write_all(b"\n")?;
            Ok(Self { writer, written: 0 })
        }

        pub fn append(&mut self, metrics: &StepMetrics) -> Result<()> {
            serde_json::to_writer(&mut self.writer, metrics)?;
            self.writer.write_all(b"\n")?;
            self.written += 1;
            Ok(())
        }

        /// Records appended so far.
        pub fn written(&self) -> u64 {
            self.written
        }

        pub fn flush(&mut self) -> Result<()> {
            self.writer.flush()?;
            Ok(())
        }

        /// Opens a log for replay. Records are parsed lazily, one per
        /// iteration.
        pub fn open(path: impl AsRef<Path>) -> Result<(LogHeader, MetricsReplay)> {
            let mut lines = BufReader::new(File::open(path)?).lines();
            let first = lines
                .next()
                .ok_or_else(|| PolarisError::Checkpoint("metrics log is empty".into()))??;
            let header = serde_json::from_str(&first)?;
            Ok((header, MetricsReplay { lines }))
        }
    }

    /// Lazy reader over the records of a metrics log.
    #[derive(Debug)]
    pub struct MetricsReplay {
        lines: Lines<BufReader<File>>,
    }

    impl Iterator for MetricsReplay {
        type Item = Result<StepMetrics>;

        fn next(&mut self) -> Option<Self::Item> {
            loop {
                let line = match self.lines.next()? {
                    Ok(line) => line,
                    Err(e) => return Some(Err(e.into())),
                };
                if line.trim().is_empty() {
                    continue;
                }
                return Some(serde_json::from_str(&line).map_err(Into::into));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(episode: u32, step: u32, rewards: [f64; 2], masses: [f64; 2]) -> StepMetrics {
        StepMetrics {
            episode,
            step,
            evaluation: true,
            true_state: 0,
            belief_accuracy: masses.iter().map(|m| if *m > 0.5 { 1.0 } else { 0.0 }).collect(),
            belief_mass: masses.to_vec(),
            action_accuracy: vec![1.0, 0.0],
            allocations: vec![None, None],
            rewards: rewards.to_vec(),
            cumulative_rewards: rewards.to_vec(),
        }
    }

    #[test]
    fn learning_rate_recovers_exponential_decay() {
        let beliefs: Vec<f64> = (0..50).map(|t| 1.0 - (-0.1 * t as f64).exp()).collect();
        let rate = learning_rate(&beliefs).unwrap();
        assert!((rate - 0.1).abs() < 1e-9);
        assert_eq!(learning_rate(&[0.5]), None);
    }

    #[test]
    fn summary_aggregates_per_episode() {
        let metrics = vec![
            record(0, 1, [1.0, 0.0], [0.5, 0.5]),
            record(0, 2, [1.0, 0.0], [0.7, 0.5]),
            record(1, 1, [0.0, 1.0], [0.6, 0.4]),
        ];
        let summary = EvaluationSummary::from_metrics(&metrics);
        assert_eq!(summary.episodes, 2);
        assert_eq!(summary.steps, 3);
        let a0 = &summary.agents[0];
        assert!((a0.mean_episode_reward - 1.0).abs() < 1e-12);
        assert!((a0.std_episode_reward - 1.0).abs() < 1e-12);
        assert!((a0.mean_action_accuracy - 1.0).abs() < 1e-12);
        assert!((a0.mean_belief_accuracy - 2.0 / 3.0).abs() < 1e-12);
        assert!((a0.mean_belief_mass - 0.6).abs() < 1e-12);
        assert!(a0.learning_rate.unwrap() > 0.0);
        assert!(summary.to_string().contains("Agent   1"));
        assert!(!summary.to_string().contains("Bounds"));
    }

    #[test]
    fn bounds_follow_signal_divergence() {
        let model = SignalModel::Discrete {
            num_states: 2,
            accuracy: 0.75,
        };
        let bounds = LearningBounds::new(&model, 4).unwrap();
        assert!((bounds.autarky - 0.5 * 3.0_f64.ln()).abs() < 1e-12);
        assert!((bounds.coordination - 4.0 * bounds.autarky).abs() < 1e-12);

        let perfect = SignalModel::Discrete {
            num_states: 2,
            accuracy: 1.0,
        };
        assert_eq!(LearningBounds::new(&perfect, 4), None);

        let summary = EvaluationSummary::from_metrics(&[record(0, 1, [0.0, 0.0], [0.5, 0.5])])
            .with_bounds(Some(bounds));
        let text = summary.to_string();
        assert!(text.contains("autarky rate 0.5493"));
        assert!(text.contains("coordination rate 2.1972"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn log_replays_what_was_written() {
        let path = std::env::temp_dir().join(format!("polaris-metrics-{}.jsonl", crate::generate_run_id()));
        let header = LogHeader {
            run_id: "run".into(),
            num_agents: 2,
            bounds: Some(LearningBounds {
                autarky: 0.25,
                coordination: 0.5,
            }),
        };
        let metrics = vec![
            record(0, 1, [0.25, -0.5], [0.1, 0.9]),
            record(0, 2, [1.0 / 3.0, 0.0], [0.2, 0.8]),
        ];
        {
            let mut log = MetricsLog::create(&path, &header).unwrap();
            for m in &metrics {
                log.append(m).unwrap();
            }
            assert_eq!(log.written(), 2);
            log.flush().unwrap();
        }
        let (read_header, replay) = MetricsLog::open(&path).unwrap();
        assert_eq!(read_header, header);
        let replayed: Vec<StepMetrics> = replay.collect::<crate::Result<_>>().unwrap();
        assert_eq!(replayed, metrics);
        assert_eq!(
            EvaluationSummary::from_metrics(&replayed),
            EvaluationSummary::from_metrics(&metrics)
        );
        std::fs::remove_file(&path).unwrap();
    }
}
