//! Persisted run state.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::agent::AgentParameters;
use crate::config::PolarisConfig;
use crate::error::{PolarisError, Result};
use crate::training::buffer::{Experience, ReplayBuffer};
use crate::RunId;

/// Everything needed to resume a run or evaluate it deterministically:
/// the configuration, progress counters, every agent's parameters with
/// optimizer state and every agent's replay buffer.
///
/// Random streams are not stored. Every episode restarts the environment
/// and agent streams from `seed + episode`, so a run resumed from a
/// checkpoint taken between episodes replays the uninterrupted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub config: PolarisConfig,
    /// Training episodes completed.
    pub episode: u32,
    pub total_steps: u64,
    /// Update cycles run so far.
    pub updates: u64,
    /// Latent states visited by training episodes.
    pub seen_states: BTreeSet<usize>,
    pub agents: Vec<AgentParameters>,
    pub buffers: Vec<ReplayBuffer<Experience>>,
}

impl Checkpoint {
    /// Checks that the checkpoint is consistent with its own configuration.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.agents.len() != self.config.num_agents {
            return Err(PolarisError::Checkpoint(format!(
                "{} agent parameter sets for {} agents",
                self.agents.len(),
                self.config.num_agents
            )));
        }
        if self.buffers.len() != self.agents.len() {
            return Err(PolarisError::Checkpoint(format!(
                "{} replay buffers for {} agents",
                self.buffers.len(),
                self.agents.len()
            )));
        }
        if let Some((i, p)) = self.agents.iter().enumerate().find(|(i, p)| p.agent != *i) {
            return Err(PolarisError::Checkpoint(format!(
                "slot {} holds parameters of agent {}",
                i, p.agent
            )));
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }
}
