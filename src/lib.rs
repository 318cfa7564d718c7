//! polaris - Partially Observable Learning with Active Reinforcement In Social environments
//!
//! A multi-agent reinforcement-learning library for social learning under
//! partial observability. Agents embedded in a social network form beliefs
//! about a hidden state, infer how their neighbours' policies evolve, and
//! optimise entropy-regularised actor-critic policies on top of both.
//!
//! The main entry point is [`training::Trainer`], which couples an
//! [`environment::SocialEnvironment`] with one [`agent::Agent`] per network
//! node and runs the collect/update loop.

pub mod agent;
pub mod belief;
pub mod config;
pub mod environment;
pub mod error;
pub mod inference;
pub mod network;
pub mod nn;
pub mod policy;
pub mod training;
pub mod types;

pub use agent::Agent;
pub use config::PolarisConfig;
pub use error::{PolarisError, Result};
pub use training::Trainer;
pub use types::{Action, ActionSpace, AgentId};

/// Identifier type used for training runs and checkpoints.
pub type RunId = String;

/// Generates a new unique run identifier (UUID v4).
pub fn generate_run_id() -> RunId {
    uuid::Uuid::new_v4().to_string()
}
