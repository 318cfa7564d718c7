use thiserror::Error;

use crate::types::AgentId;

/// Learned module an error or warning originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Belief,
    Inference,
    Actor,
    Critic,
    Temperature,
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Module::Belief => "belief encoder",
            Module::Inference => "inference module",
            Module::Actor => "actor",
            Module::Critic => "critic",
            Module::Temperature => "temperature",
        };
        f.write_str(name)
    }
}

/// Errors raised while configuring, running or persisting a POLARIS run.
#[derive(Debug, Error)]
pub enum PolarisError {
    #[error("invalid configuration for `{field}`: {reason}")]
    Configuration { field: &'static str, reason: String },

    #[error("environment error{}: {reason}", agent_suffix(.agent))]
    Environment {
        agent: Option<AgentId>,
        reason: String,
    },

    #[error("non-finite values in {module} of agent {agent}: {detail}")]
    NumericInstability {
        agent: AgentId,
        module: Module,
        detail: String,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "serde")]
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl PolarisError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        PolarisError::Configuration {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn env(agent: Option<AgentId>, reason: impl Into<String>) -> Self {
        PolarisError::Environment {
            agent,
            reason: reason.into(),
        }
    }

    /// Returns true for errors that only invalidate a single update step.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PolarisError::NumericInstability { .. })
    }
}

fn agent_suffix(agent: &Option<AgentId>) -> String {
    match agent {
        Some(a) => format!(" (agent {})", a),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, PolarisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_display() {
        let e = PolarisError::config("num_agents", "must be at least 1");
        assert_eq!(
            e.to_string(),
            "invalid configuration for `num_agents`: must be at least 1"
        );
        assert!(!e.is_recoverable());
    }

    #[test]
    fn environment_display_names_agent() {
        let e = PolarisError::env(Some(3), "allocation 1.5 outside [0, 1]");
        assert_eq!(
            e.to_string(),
            "environment error (agent 3): allocation 1.5 outside [0, 1]"
        );
        let e = PolarisError::env(None, "expected 2 actions, got 1");
        assert_eq!(e.to_string(), "environment error: expected 2 actions, got 1");
    }

    #[test]
    fn numeric_instability_is_recoverable() {
        let e = PolarisError::NumericInstability {
            agent: 1,
            module: Module::Critic,
            detail: "loss is NaN".into(),
        };
        assert!(e.is_recoverable());
        assert!(e.to_string().contains("critic of agent 1"));
    }
}
